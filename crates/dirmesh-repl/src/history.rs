//! Per-entry, per-attribute change history: the input to conflict resolution.
//!
//! For every attribute value the history remembers when it was last added and
//! last deleted, plus whole-attribute delete/update high-water marks. The
//! history travels inside the entry as an opaque serialized blob; the storage
//! layer stores and returns it unmodified.

use crate::stamp::ChangeStamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An attribute value, kept as raw bytes (directory values are binary-safe).
pub type AttrValue = Vec<u8>;

/// Last add/delete stamps for one attribute value.
///
/// Identity is the owning map key (the value bytes), so a record never stores
/// its own value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRecord {
    /// Stamp of the last add of this value, if any.
    pub update_stamp: Option<ChangeStamp>,
    /// Stamp of the last delete of this value, if any.
    pub delete_stamp: Option<ChangeStamp>,
}

impl ValueRecord {
    /// True if this record represents a currently present value: added, and
    /// not deleted since.
    pub fn is_present(&self) -> bool {
        match (self.update_stamp, self.delete_stamp) {
            (Some(up), Some(del)) => up > del,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Change history for one multi-valued attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrHistory {
    /// Stamp of the last whole-attribute delete, if any.
    pub last_attr_delete: Option<ChangeStamp>,
    /// Stamp of the last modification that touched this attribute, if any.
    pub last_attr_update: Option<ChangeStamp>,
    /// Per-value records, keyed by value bytes.
    pub records: BTreeMap<AttrValue, ValueRecord>,
}

impl AttrHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `value`, if any operation ever touched it.
    pub fn record(&self, value: &[u8]) -> Option<&ValueRecord> {
        self.records.get(value)
    }

    /// True if `value` is currently present per the history.
    pub fn value_present(&self, value: &[u8]) -> bool {
        self.records.get(value).is_some_and(ValueRecord::is_present)
    }

    /// Values currently present, in byte order.
    pub fn present_values(&self) -> Vec<AttrValue> {
        self.records
            .iter()
            .filter(|(_, rec)| rec.is_present())
            .map(|(v, _)| v.clone())
            .collect()
    }

    /// Record an add of `value` at `stamp`.
    pub fn record_add(&mut self, value: &[u8], stamp: ChangeStamp) {
        let rec = self.records.entry(value.to_vec()).or_default();
        if rec.update_stamp.is_none_or(|up| stamp > up) {
            rec.update_stamp = Some(stamp);
        }
        self.touch_update(stamp);
    }

    /// Record a delete of `value` at `stamp`.
    pub fn record_value_delete(&mut self, value: &[u8], stamp: ChangeStamp) {
        let rec = self.records.entry(value.to_vec()).or_default();
        if rec.delete_stamp.is_none_or(|del| stamp > del) {
            rec.delete_stamp = Some(stamp);
        }
        self.touch_update(stamp);
    }

    /// Record a whole-attribute delete at `stamp`: every existing record is
    /// marked deleted and the attribute-level delete mark advances.
    pub fn record_attr_delete(&mut self, stamp: ChangeStamp) {
        for rec in self.records.values_mut() {
            if rec.delete_stamp.is_none_or(|del| stamp > del) {
                rec.delete_stamp = Some(stamp);
            }
        }
        if self.last_attr_delete.is_none_or(|del| stamp > del) {
            self.last_attr_delete = Some(stamp);
        }
        self.touch_update(stamp);
    }

    fn touch_update(&mut self, stamp: ChangeStamp) {
        if self.last_attr_update.is_none_or(|up| stamp > up) {
            self.last_attr_update = Some(stamp);
        }
    }

    /// Drop records no longer needed for conflict resolution, keeping at most
    /// `max_records` (0 = unlimited). Present values are always retained, and
    /// so are the most recently stamped tombstones.
    pub fn purge(&mut self, max_records: usize) {
        if max_records == 0 || self.records.len() <= max_records {
            return;
        }
        let mut tombstones: Vec<(AttrValue, ChangeStamp)> = self
            .records
            .iter()
            .filter(|(_, rec)| !rec.is_present())
            .filter_map(|(v, rec)| {
                let newest = rec.delete_stamp.max(rec.update_stamp)?;
                Some((v.clone(), newest))
            })
            .collect();
        // Oldest tombstones go first.
        tombstones.sort_by_key(|(_, stamp)| *stamp);
        let excess = self.records.len() - max_records;
        for (value, _) in tombstones.into_iter().take(excess) {
            self.records.remove(&value);
        }
    }
}

/// Change history for one single-valued attribute: one current value plus its
/// update stamp, and the attribute-level delete mark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleValueHistory {
    /// The current value, if the attribute is present.
    pub value: Option<AttrValue>,
    /// Stamp of the modification that set the current value (or last removed
    /// it).
    pub update_stamp: Option<ChangeStamp>,
    /// Stamp of the last delete of this attribute, if any.
    pub delete_stamp: Option<ChangeStamp>,
}

impl SingleValueHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the attribute currently holds a value.
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    /// Record that `value` was set at `stamp`. A tombstone older than the
    /// set is superseded and cleared, so the ledger ends up the same no
    /// matter which of the two operations arrived first.
    pub fn record_set(&mut self, value: &[u8], stamp: ChangeStamp) {
        self.value = Some(value.to_vec());
        self.update_stamp = Some(stamp);
        if self.delete_stamp.is_some_and(|del| del < stamp) {
            self.delete_stamp = None;
        }
    }

    /// Record that the attribute was deleted at `stamp`.
    pub fn record_delete(&mut self, stamp: ChangeStamp) {
        self.value = None;
        self.update_stamp = Some(stamp);
        if self.delete_stamp.is_none_or(|del| stamp > del) {
            self.delete_stamp = Some(stamp);
        }
    }
}

/// History for one attribute of an entry, multi- or single-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeHistory {
    /// Multi-valued attribute.
    Multi(AttrHistory),
    /// Single-valued attribute.
    Single(SingleValueHistory),
}

/// Full conflict-resolution history for one directory entry, keyed by
/// attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHistory {
    /// Per-attribute histories.
    pub attrs: BTreeMap<String, AttributeHistory>,
}

/// Format tag prepended to every encoded history blob.
const HISTORY_FORMAT: u8 = 1;

impl EntryHistory {
    /// Create an empty entry history.
    pub fn new() -> Self {
        Self::default()
    }

    /// The multi-valued history for `attr`, created on first touch.
    pub fn multi_mut(&mut self, attr: &str) -> &mut AttrHistory {
        let slot = self
            .attrs
            .entry(attr.to_string())
            .or_insert_with(|| AttributeHistory::Multi(AttrHistory::new()));
        if let AttributeHistory::Single(_) = slot {
            // Schema changed under us; restart the history for the new shape.
            *slot = AttributeHistory::Multi(AttrHistory::new());
        }
        match slot {
            AttributeHistory::Multi(h) => h,
            AttributeHistory::Single(_) => unreachable!(),
        }
    }

    /// The single-valued history for `attr`, created on first touch.
    pub fn single_mut(&mut self, attr: &str) -> &mut SingleValueHistory {
        let slot = self
            .attrs
            .entry(attr.to_string())
            .or_insert_with(|| AttributeHistory::Single(SingleValueHistory::new()));
        if let AttributeHistory::Multi(_) = slot {
            *slot = AttributeHistory::Single(SingleValueHistory::new());
        }
        match slot {
            AttributeHistory::Single(h) => h,
            AttributeHistory::Multi(_) => unreachable!(),
        }
    }

    /// The history for `attr`, if any operation ever touched it.
    pub fn get(&self, attr: &str) -> Option<&AttributeHistory> {
        self.attrs.get(attr)
    }

    /// Bound every multi-valued attribute history to `max_records` value
    /// records. Zero disables purging.
    pub fn purge(&mut self, max_records: usize) {
        if max_records == 0 {
            return;
        }
        for history in self.attrs.values_mut() {
            if let AttributeHistory::Multi(h) = history {
                h.purge(max_records);
            }
        }
    }

    /// Serialize to the opaque blob stored inside the entry.
    pub fn encode(&self) -> Result<Vec<u8>, crate::error::ReplError> {
        let mut out = vec![HISTORY_FORMAT];
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    /// Strict decode of an encoded history blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::ReplError> {
        match bytes.split_first() {
            Some((&HISTORY_FORMAT, rest)) => Ok(bincode::deserialize(rest)?),
            Some((&tag, _)) => Err(crate::error::ReplError::MalformedHistory {
                msg: format!("unknown history format tag {tag}"),
            }),
            None => Err(crate::error::ReplError::MalformedHistory {
                msg: "empty history blob".to_string(),
            }),
        }
    }

    /// Decode an encoded history blob, rebuilding an empty history when the
    /// blob is malformed. Losing history costs future conflict precision but
    /// must never abort entry processing.
    pub fn decode_lenient(bytes: &[u8]) -> Self {
        match Self::decode(bytes) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(error = %e, "malformed attribute history, rebuilding empty");
                Self::new()
            }
        }
    }
}
