//! Diesel row types for the persisted state tree.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use crate::models::oilfox::ValueType;
use crate::schema;
use crate::store::{SlotSpec, SlotState};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::state_slots)]
pub struct Slot {
    pub path: String,
    pub value_type: String,
    pub name: String,
    pub role: String,
    pub readable: bool,
    pub writable: bool,
    pub value: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::state_slots)]
pub struct NewSlot<'a> {
    pub path: &'a str,
    pub value_type: &'a str,
    pub name: &'a str,
    pub role: &'a str,
    pub readable: bool,
    pub writable: bool,
}

impl<'a> NewSlot<'a> {
    pub fn new(path: &'a str, spec: &'a SlotSpec) -> Self {
        NewSlot {
            path,
            value_type: spec.value_type.as_str(),
            name: &spec.name,
            role: &spec.role,
            readable: spec.readable,
            writable: spec.writable,
        }
    }
}

impl TryFrom<Slot> for SlotState {
    type Error = String;

    fn try_from(row: Slot) -> Result<Self, Self::Error> {
        let value_type = ValueType::parse(&row.value_type)
            .ok_or_else(|| format!("slot {} has unknown value type {:?}", row.path, row.value_type))?;
        Ok(SlotState {
            spec: SlotSpec {
                value_type,
                name: row.name,
                role: row.role,
                readable: row.readable,
                writable: row.writable,
            },
            value: row.value,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::device_bindings)]
pub struct NewDeviceBinding<'a> {
    pub collection: &'a str,
    pub idx: i32,
    pub device_id: &'a str,
}
