//! Payload variations for conditional orders.
//!
//! A variation is one candidate request shape for the same logical order.
//! Shape differences live here as data (side field present or omitted,
//! numbers as strings or JSON numbers, optional fields), so operators can
//! add or reorder variations in config without touching the probe loop.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sigex_core::ConditionalOrderSpec;

use crate::error::{ExecutorError, ExecutorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideField {
    /// Send the closing side explicitly.
    Explicit,
    /// Leave the side out; the exchange infers it from the position.
    Omit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericEncoding {
    String,
    Number,
}

/// One request shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadVariation {
    pub id: String,
    #[serde(default = "default_side_field")]
    pub side_field: SideField,
    #[serde(default = "default_numeric_encoding")]
    pub numeric_encoding: NumericEncoding,
    /// Attach a `metadata` object (entry side, order kind, origin).
    #[serde(default)]
    pub include_metadata: bool,
    #[serde(default = "default_true")]
    pub include_reference_price: bool,
}

fn default_side_field() -> SideField {
    SideField::Explicit
}

fn default_numeric_encoding() -> NumericEncoding {
    NumericEncoding::String
}

fn default_true() -> bool {
    true
}

impl PayloadVariation {
    pub fn new(id: &str, side_field: SideField, numeric_encoding: NumericEncoding) -> Self {
        Self {
            id: id.to_string(),
            side_field,
            numeric_encoding,
            include_metadata: false,
            include_reference_price: true,
        }
    }

    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }

    /// Serialize `spec` in this variation's shape.
    ///
    /// Every numeric field comes from the already-rounded spec; nothing is
    /// rounded again here.
    pub fn render(&self, spec: &ConditionalOrderSpec, client_order_id: &str) -> Value {
        let mut body = Map::new();
        body.insert("instrument".into(), Value::from(spec.instrument.as_str()));
        body.insert("client_order_id".into(), Value::from(client_order_id));
        body.insert("order_type".into(), Value::from(spec.kind.as_str()));
        if self.side_field == SideField::Explicit {
            body.insert("side".into(), Value::from(spec.closing_side.as_str()));
        }
        body.insert("quantity".into(), self.number(spec.quantity.inner()));
        body.insert("price".into(), self.number(spec.execution_price.inner()));
        body.insert("trigger_price".into(), self.number(spec.trigger_price.inner()));
        body.insert(
            "trigger_condition".into(),
            Value::from(spec.trigger_condition.to_string()),
        );
        if self.include_reference_price {
            body.insert("reference_price".into(), self.number(spec.reference_price.inner()));
        }
        body.insert("reduce_only".into(), Value::Bool(true));
        if self.include_metadata {
            body.insert(
                "metadata".into(),
                serde_json::json!({
                    "entry_side": spec.entry_side.as_str(),
                    "kind": spec.kind.as_str(),
                    "variation": self.id,
                    "origin": "sigex",
                }),
            );
        }
        Value::Object(body)
    }

    fn number(&self, value: Decimal) -> Value {
        let text = value.normalize().to_string();
        match self.numeric_encoding {
            NumericEncoding::String => Value::String(text),
            NumericEncoding::Number => serde_json::from_str::<Value>(&text)
                .ok()
                .filter(Value::is_number)
                .unwrap_or(Value::String(text)),
        }
    }
}

/// Ordered list of variations tried for every conditional order.
///
/// Deserializes from a plain list through [`VariationPolicy::new`], so a
/// policy read from config is validated like one built in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PayloadVariation>", into = "Vec<PayloadVariation>")]
pub struct VariationPolicy {
    variations: Vec<PayloadVariation>,
}

impl VariationPolicy {
    /// Validate and wrap an ordered list: non-empty, unique ids.
    pub fn new(variations: Vec<PayloadVariation>) -> ExecutorResult<Self> {
        if variations.is_empty() {
            return Err(ExecutorError::Config("variation list is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for v in &variations {
            if v.id.trim().is_empty() {
                return Err(ExecutorError::Config("variation id is empty".to_string()));
            }
            if !seen.insert(v.id.as_str()) {
                return Err(ExecutorError::Config(format!("duplicate variation id: {}", v.id)));
            }
        }
        Ok(Self { variations })
    }

    pub fn variations(&self) -> &[PayloadVariation] {
        &self.variations
    }

    pub fn len(&self) -> usize {
        self.variations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variations.is_empty()
    }
}

impl TryFrom<Vec<PayloadVariation>> for VariationPolicy {
    type Error = ExecutorError;

    fn try_from(variations: Vec<PayloadVariation>) -> ExecutorResult<Self> {
        Self::new(variations)
    }
}

impl From<VariationPolicy> for Vec<PayloadVariation> {
    fn from(policy: VariationPolicy) -> Self {
        policy.variations
    }
}

impl Default for VariationPolicy {
    /// Built-in order: explicit side first, then the shapes the exchange has
    /// been seen to accept when it rejects an explicit side.
    fn default() -> Self {
        Self {
            variations: vec![
                PayloadVariation::new("explicit_side_str", SideField::Explicit, NumericEncoding::String),
                PayloadVariation::new("omit_side_str", SideField::Omit, NumericEncoding::String),
                PayloadVariation::new("explicit_side_num", SideField::Explicit, NumericEncoding::Number),
                PayloadVariation::new("omit_side_meta", SideField::Omit, NumericEncoding::String)
                    .with_metadata(),
            ],
        }
    }
}
