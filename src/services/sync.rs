//! Mirror a summary document into the state tree.
//!
//! Two passes per poll: [`TreeSynchronizer::ensure_schema`] declares every
//! slot the document needs, [`TreeSynchronizer::apply_values`] writes the
//! current values. Slots are never removed and never change type.

use crate::models::oilfox::{DeviceRecord, Leaf, SummaryDocument, device_id_path, is_falsy, scalar_key};
use crate::store::{SlotSpec, StateStore, StoreError};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum SyncError {
    Store(StoreError),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Store(e) => Some(e),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        SyncError::Store(value)
    }
}

/// How a device record finds its `<collection>.<n>` index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DeviceKeying {
    /// Index is the record's position in the document. A record is only
    /// written when the stored id at its index is unset or matches.
    #[default]
    Positional,
    /// Index comes from a persistent id -> index binding table.
    ById,
}

impl DeviceKeying {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positional" | "position" => Some(DeviceKeying::Positional),
            "id" | "by-id" => Some(DeviceKeying::ById),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKeying::Positional => "positional",
            DeviceKeying::ById => "id",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Slots declared during this poll.
    pub created: usize,
    pub written: usize,
    /// Document positions of records whose values were not written.
    pub skipped_devices: Vec<usize>,
    /// Bound device ids absent from the document (id keying only).
    pub missing_devices: Vec<String>,
}

/// Where each record of a document lands.
struct Placement {
    indices: Vec<Option<usize>>,
    missing: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TreeSynchronizer {
    keying: DeviceKeying,
}

impl TreeSynchronizer {
    pub fn new(keying: DeviceKeying) -> Self {
        TreeSynchronizer { keying }
    }

    /// Declare every slot the document maps to. Returns the number of
    /// slots created; zero when the tree already covers the document.
    pub fn ensure_schema<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        doc: &SummaryDocument,
    ) -> Result<usize, SyncError> {
        let placement = self.place(store, doc)?;
        let mut created = 0;
        for leaf in doc.info_leaves() {
            created += usize::from(declare(store, &leaf)?);
        }
        for (record, index) in doc.devices.iter().zip(&placement.indices) {
            let Some(index) = index else { continue };
            for leaf in record.leaves(&doc.collection, *index) {
                created += usize::from(declare(store, &leaf)?);
            }
        }
        if created > 0 {
            info!("Declared {} new slot(s)", created);
        }
        Ok(created)
    }

    /// Write info fields, then each device's direct and metering fields,
    /// in document order.
    pub fn apply_values<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        doc: &SummaryDocument,
    ) -> Result<SyncReport, SyncError> {
        let placement = self.place(store, doc)?;
        let mut report = SyncReport {
            missing_devices: placement.missing,
            ..SyncReport::default()
        };

        for leaf in doc.info_leaves() {
            write(store, &leaf, &mut report)?;
        }

        for (position, (record, index)) in doc.devices.iter().zip(&placement.indices).enumerate() {
            let Some(index) = *index else {
                report.skipped_devices.push(position);
                continue;
            };
            if self.keying == DeviceKeying::Positional && !identity_matches(store, &doc.collection, index, record)? {
                report.skipped_devices.push(position);
                continue;
            }
            for leaf in record.leaves(&doc.collection, index) {
                write(store, &leaf, &mut report)?;
            }
        }

        for id in &report.missing_devices {
            warn!("Device {} is bound in {} but absent from the summary", id, doc.collection);
        }
        Ok(report)
    }

    fn place<S: StateStore + ?Sized>(&self, store: &mut S, doc: &SummaryDocument) -> Result<Placement, SyncError> {
        match self.keying {
            DeviceKeying::Positional => Ok(Placement {
                indices: (0..doc.devices.len()).map(Some).collect(),
                missing: Vec::new(),
            }),
            DeviceKeying::ById => place_by_id(store, doc),
        }
    }
}

fn declare<S: StateStore + ?Sized>(store: &mut S, leaf: &Leaf) -> Result<bool, StoreError> {
    store.declare(&leaf.path, &SlotSpec::read_only(&leaf.name, leaf.value_type))
}

fn write<S: StateStore + ?Sized>(store: &mut S, leaf: &Leaf, report: &mut SyncReport) -> Result<(), StoreError> {
    match store.write(&leaf.path, &leaf.value) {
        Err(StoreError::Undeclared(_)) => {
            report.created += usize::from(declare(store, leaf)?);
            store.write(&leaf.path, &leaf.value)?;
        }
        other => other?,
    }
    report.written += 1;
    Ok(())
}

/// Guard against relabelling a different device under the same index.
///
/// Passes when the stored id is unset, falsy or equal to the record's id.
/// Records without an id always pass.
fn identity_matches<S: StateStore + ?Sized>(
    store: &mut S,
    collection: &str,
    index: usize,
    record: &DeviceRecord,
) -> Result<bool, StoreError> {
    let Some(incoming) = record.id() else {
        return Ok(true);
    };
    let path = device_id_path(collection, index);
    let stored = store.read(&path)?.and_then(|slot| slot.value);
    let matches = match &stored {
        None => true,
        Some(v) if is_falsy(v) => true,
        Some(v) => scalar_key(v) == scalar_key(incoming),
    };
    if !matches {
        warn!(
            "Skipping {}: stored id {} differs from incoming id {}",
            path,
            stored.as_ref().map(|v| v.to_string()).unwrap_or_default(),
            incoming
        );
    }
    Ok(matches)
}

fn place_by_id<S: StateStore + ?Sized>(store: &mut S, doc: &SummaryDocument) -> Result<Placement, SyncError> {
    let mut bound: BTreeMap<usize, String> = store.bindings(&doc.collection)?;
    let mut index_of: HashMap<String, usize> = bound.iter().map(|(i, id)| (id.clone(), *i)).collect();
    let mut seen = HashSet::new();
    let mut indices = Vec::with_capacity(doc.devices.len());

    for (position, record) in doc.devices.iter().enumerate() {
        let Some(key) = record.id_key() else {
            debug!("{} record at position {} has no id; not bound", doc.collection, position);
            indices.push(None);
            continue;
        };
        if !seen.insert(key.clone()) {
            warn!("Duplicate device id {} at position {}; ignored", key, position);
            indices.push(None);
            continue;
        }
        let index = match index_of.get(&key) {
            Some(i) => *i,
            None => {
                let free = (0..).find(|i| !bound.contains_key(i)).unwrap_or(bound.len());
                store.bind(&doc.collection, free, &key)?;
                info!("Bound device {} to {}.{}", key, doc.collection, free);
                bound.insert(free, key.clone());
                index_of.insert(key, free);
                free
            }
        };
        indices.push(Some(index));
    }

    let missing = bound.into_values().filter(|id| !seen.contains(id)).collect();
    Ok(Placement { indices, missing })
}
