//! PostgreSQL-backed state tree.

use chrono::Utc;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::models::{NewDeviceBinding, NewSlot, Slot};
use crate::schema;
use crate::store::{SlotSpec, SlotState, StateStore, StoreError};

pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub fn new(conn: PgConnection) -> Self {
        PgStore { conn }
    }
}

fn backend(op: &str, e: DieselError) -> StoreError {
    StoreError::Backend(format!("{} failed: {}", op, e))
}

impl StateStore for PgStore {
    fn declare(&mut self, path: &str, spec: &SlotSpec) -> Result<bool, StoreError> {
        use schema::state_slots::dsl as S;

        let inserted = diesel::insert_into(S::state_slots)
            .values(&NewSlot::new(path, spec))
            .on_conflict(S::path)
            .do_nothing()
            .execute(&mut self.conn)
            .map_err(|e| backend("declare slot", e))?;
        if inserted > 0 {
            debug!("Declared slot {} ({})", path, spec.value_type.as_str());
        }
        Ok(inserted > 0)
    }

    fn write(&mut self, path: &str, value: &Value) -> Result<(), StoreError> {
        use schema::state_slots::dsl as S;

        let updated = diesel::update(S::state_slots.filter(S::path.eq(path)))
            .set((S::value.eq(Some(value.clone())), S::updated_at.eq(Some(Utc::now()))))
            .execute(&mut self.conn)
            .map_err(|e| backend("write slot", e))?;
        if updated == 0 {
            return Err(StoreError::Undeclared(path.to_string()));
        }
        Ok(())
    }

    fn read(&mut self, path: &str) -> Result<Option<SlotState>, StoreError> {
        use schema::state_slots::dsl as S;

        let row: Option<Slot> = S::state_slots
            .filter(S::path.eq(path))
            .select(Slot::as_select())
            .first(&mut self.conn)
            .optional()
            .map_err(|e| backend("read slot", e))?;
        row.map(SlotState::try_from).transpose().map_err(StoreError::Backend)
    }

    fn paths(&mut self) -> Result<Vec<String>, StoreError> {
        use schema::state_slots::dsl as S;

        S::state_slots
            .select(S::path)
            .order(S::path.asc())
            .load::<String>(&mut self.conn)
            .map_err(|e| backend("list slots", e))
    }

    fn bindings(&mut self, collection: &str) -> Result<BTreeMap<usize, String>, StoreError> {
        use schema::device_bindings::dsl as B;

        let rows = B::device_bindings
            .filter(B::collection.eq(collection))
            .select((B::idx, B::device_id))
            .load::<(i32, String)>(&mut self.conn)
            .map_err(|e| backend("load bindings", e))?;

        rows.into_iter()
            .map(|(idx, id)| {
                usize::try_from(idx)
                    .map(|i| (i, id))
                    .map_err(|_| StoreError::Backend(format!("negative binding index {} in {}", idx, collection)))
            })
            .collect()
    }

    fn bind(&mut self, collection: &str, index: usize, device_id: &str) -> Result<(), StoreError> {
        use schema::device_bindings::dsl as B;

        let idx = i32::try_from(index)
            .map_err(|_| StoreError::Backend(format!("binding index {} out of range", index)))?;
        let row = NewDeviceBinding {
            collection,
            idx,
            device_id,
        };
        match diesel::insert_into(B::device_bindings).values(&row).execute(&mut self.conn) {
            Ok(_) => Ok(()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => Err(StoreError::Conflict(
                format!("{}.{} <-> {}: {}", collection, index, device_id, info.message()),
            )),
            Err(e) => Err(backend("bind device", e)),
        }
    }
}
