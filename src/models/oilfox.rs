//! Oilfox summary document and its flattened leaf view.
//!
//! The API answers with one JSON object: scalar account fields next to a
//! collection (`devices` or `items`) of device records, each of which may
//! carry a nested `metering` object. Only scalars (string, number, boolean)
//! are mirrored; everything else is dropped on the floor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub const INFO_PREFIX: &str = "info";
pub const METERING_FIELD: &str = "metering";
pub const ID_FIELD: &str = "id";

/// Declared type of a state slot, taken from the JSON runtime type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
}

impl ValueType {
    /// `None` for null, arrays and objects.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(ValueType::String),
            Value::Number(_) => Some(ValueType::Number),
            Value::Bool(_) => Some(ValueType::Boolean),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ValueType::String),
            "number" => Some(ValueType::Number),
            "boolean" => Some(ValueType::Boolean),
            _ => None,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            ValueType::String => "text",
            ValueType::Number => "value",
            ValueType::Boolean => "indicator",
        }
    }
}

/// One flattened scalar: its dotted slot path, field name and value.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub path: String,
    pub name: String,
    pub value: Value,
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDocument {
    /// Top-level scalar fields, in document order.
    pub info: Vec<(String, Value)>,
    /// Name of the collection field the records were read from.
    pub collection: String,
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceRecord {
    pub fields: Vec<(String, Value)>,
    pub metering: Vec<(String, Value)>,
}

fn scalar_fields(map: &Map<String, Value>) -> Vec<(String, Value)> {
    map.iter()
        .filter(|(_, v)| ValueType::of(v).is_some())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn leaf(path: String, name: &str, value: &Value) -> Option<Leaf> {
    let value_type = ValueType::of(value)?;
    Some(Leaf {
        path,
        name: name.to_string(),
        value: value.clone(),
        value_type,
    })
}

impl SummaryDocument {
    /// Split a parsed summary body into account fields and device records.
    ///
    /// A missing or non-array collection yields no devices. Entries of the
    /// collection that are not objects still occupy their position.
    pub fn from_value(value: Value, collection: &str) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("summary must be a JSON object, got {}", json_kind(&value)));
        };

        let devices = match map.get(collection) {
            Some(Value::Array(entries)) => entries.iter().map(DeviceRecord::from_value).collect(),
            _ => Vec::new(),
        };

        Ok(SummaryDocument {
            info: scalar_fields(&map),
            collection: collection.to_string(),
            devices,
        })
    }

    pub fn info_leaves(&self) -> Vec<Leaf> {
        self.info
            .iter()
            .filter_map(|(name, value)| leaf(slot_path(&[INFO_PREFIX, name]), name, value))
            .collect()
    }
}

impl DeviceRecord {
    pub fn from_value(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return DeviceRecord::default();
        };
        let metering = match map.get(METERING_FIELD) {
            Some(Value::Object(m)) => scalar_fields(m),
            _ => Vec::new(),
        };
        DeviceRecord {
            fields: scalar_fields(map),
            metering,
        }
    }

    pub fn id(&self) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == ID_FIELD).map(|(_, v)| v)
    }

    /// Textual form of the record's id, used as a binding key.
    pub fn id_key(&self) -> Option<String> {
        self.id().and_then(scalar_key)
    }

    /// Direct fields first, then metering fields, both under
    /// `<collection>.<index>`.
    pub fn leaves(&self, collection: &str, index: usize) -> Vec<Leaf> {
        let idx = index.to_string();
        let direct = self
            .fields
            .iter()
            .filter_map(|(name, value)| leaf(slot_path(&[collection, &idx, name]), name, value));
        let metering = self
            .metering
            .iter()
            .filter_map(|(name, value)| leaf(slot_path(&[collection, &idx, METERING_FIELD, name]), name, value));
        direct.chain(metering).collect()
    }
}

pub fn slot_path(parts: &[&str]) -> String {
    parts.join(".")
}

pub fn device_id_path(collection: &str, index: usize) -> String {
    slot_path(&[collection, &index.to_string(), ID_FIELD])
}

/// String form of a scalar so that `"42"`, `42` and `42.0` name the same
/// device.
pub fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(number_key(n)),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// Numbers compare by value: integral floats print without a fraction.
fn number_key(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

/// `null`, `false`, `0` and `""` count as unset.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
