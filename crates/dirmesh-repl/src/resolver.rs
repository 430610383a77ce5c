//! Deterministic conflict resolution for replayed modifications.
//!
//! Given an entry's change history and an incoming modification with its
//! stamp, the resolver produces the modification that must actually be
//! applied: values made obsolete by a causally-later change are dropped, and a
//! whole operation may collapse to nothing. Replaying the same operation twice
//! is always a no-op the second time (ties favor what the ledger already
//! reflects).

use crate::history::{AttrHistory, AttrValue, EntryHistory, SingleValueHistory};
use crate::stamp::ChangeStamp;
use serde::{Deserialize, Serialize};

/// The operation part of a modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModOp {
    /// Add the listed values to the attribute.
    AddValues(Vec<AttrValue>),
    /// Delete the listed values from the attribute.
    DeleteValues(Vec<AttrValue>),
    /// Delete the whole attribute.
    DeleteAttr,
    /// Replace the attribute's value set wholesale.
    Replace(Vec<AttrValue>),
}

/// A modification of one attribute of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Target attribute name.
    pub attr: String,
    /// The operation to perform.
    pub op: ModOp,
}

impl Modification {
    /// Convenience constructor.
    pub fn new(attr: impl Into<String>, op: ModOp) -> Self {
        Self {
            attr: attr.into(),
            op,
        }
    }
}

/// Resolve a locally-originated modification.
///
/// Local operations are always causally latest (the stamp was just issued by
/// the local clock), so nothing is ever discarded; the history is updated and
/// the modification passes through unchanged.
pub fn resolve_local(
    history: &mut EntryHistory,
    modification: &Modification,
    stamp: ChangeStamp,
    single_valued: bool,
) -> Modification {
    if single_valued {
        let h = history.single_mut(&modification.attr);
        match &modification.op {
            ModOp::AddValues(values) | ModOp::Replace(values) => {
                if let Some(value) = values.first() {
                    h.record_set(value, stamp);
                }
            }
            ModOp::DeleteValues(_) | ModOp::DeleteAttr => h.record_delete(stamp),
        }
    } else {
        let h = history.multi_mut(&modification.attr);
        match &modification.op {
            ModOp::AddValues(values) => {
                for value in values {
                    h.record_add(value, stamp);
                }
            }
            ModOp::DeleteValues(values) => {
                for value in values {
                    h.record_value_delete(value, stamp);
                }
            }
            ModOp::DeleteAttr => h.record_attr_delete(stamp),
            ModOp::Replace(values) => {
                apply_replace(h, values, stamp);
            }
        }
    }
    modification.clone()
}

/// Resolve a modification replayed from another replica.
///
/// Returns the effective modification to apply, or `None` when the whole
/// operation is obsolete. The history is updated to reflect whatever part of
/// the operation survived.
pub fn resolve_replayed(
    history: &mut EntryHistory,
    modification: &Modification,
    stamp: ChangeStamp,
    single_valued: bool,
) -> Option<Modification> {
    let effective_op = if single_valued {
        resolve_single(history.single_mut(&modification.attr), &modification.op, stamp)
    } else {
        resolve_multi(history.multi_mut(&modification.attr), &modification.op, stamp)
    };
    match effective_op {
        Some(op) => Some(Modification::new(modification.attr.clone(), op)),
        None => {
            tracing::debug!(
                attr = %modification.attr,
                stamp = %stamp,
                "modification obsoleted by later change"
            );
            None
        }
    }
}

fn resolve_multi(h: &mut AttrHistory, op: &ModOp, stamp: ChangeStamp) -> Option<ModOp> {
    match op {
        ModOp::AddValues(values) => {
            let mut kept = Vec::new();
            for value in values {
                if add_is_obsolete(h, value, stamp) {
                    continue;
                }
                h.record_add(value, stamp);
                kept.push(value.clone());
            }
            (!kept.is_empty()).then_some(ModOp::AddValues(kept))
        }
        ModOp::DeleteValues(values) => {
            let mut kept = Vec::new();
            for value in values {
                let rec = h.record(value).copied().unwrap_or_default();
                // A later (or idempotently replayed) add of this value wins.
                if rec.update_stamp.is_some_and(|up| up >= stamp) {
                    continue;
                }
                let was_present = rec.is_present();
                h.record_value_delete(value, stamp);
                if was_present {
                    kept.push(value.clone());
                }
            }
            (!kept.is_empty()).then_some(ModOp::DeleteValues(kept))
        }
        ModOp::DeleteAttr => {
            // Any later change to the attribute obsoletes the whole delete.
            if h.last_attr_update.is_some_and(|up| up >= stamp) {
                return None;
            }
            h.record_attr_delete(stamp);
            Some(ModOp::DeleteAttr)
        }
        ModOp::Replace(values) => {
            if h.last_attr_delete.is_some_and(|del| del >= stamp) {
                return None;
            }
            let changed = apply_replace(h, values, stamp);
            // The effective replace carries the resolved value set, which may
            // include values from concurrent later adds.
            changed.then(|| ModOp::Replace(h.present_values()))
        }
    }
}

fn add_is_obsolete(h: &AttrHistory, value: &[u8], stamp: ChangeStamp) -> bool {
    if h.last_attr_delete.is_some_and(|del| del >= stamp) {
        return true;
    }
    match h.record(value) {
        Some(rec) => {
            rec.delete_stamp.is_some_and(|del| del >= stamp)
                || rec.update_stamp.is_some_and(|up| up >= stamp)
        }
        None => false,
    }
}

/// Replace decomposes as delete-all-then-add-each at the same stamp. Values
/// written by the replace itself shed their same-stamp tombstone so they stay
/// present; values with strictly newer history are left alone.
///
/// Returns whether the history changed at all.
fn apply_replace(h: &mut AttrHistory, values: &[AttrValue], stamp: ChangeStamp) -> bool {
    let mut changed = false;
    // Delete-all part: tombstone every value not re-added later.
    let stale: Vec<AttrValue> = h
        .records
        .iter()
        .filter(|(_, rec)| rec.update_stamp.is_none_or(|up| up < stamp))
        .map(|(v, _)| v.clone())
        .collect();
    for value in &stale {
        h.record_value_delete(value, stamp);
        changed = true;
    }
    if h.last_attr_delete.is_none_or(|del| stamp > del) {
        h.last_attr_delete = Some(stamp);
        changed = true;
    }
    // Add part.
    for value in values {
        let rec = h.record(value).copied().unwrap_or_default();
        if rec.update_stamp.is_some_and(|up| up > stamp) {
            continue; // a later add already owns this value
        }
        if rec.delete_stamp.is_some_and(|del| del > stamp) {
            continue; // a later delete already removed this value
        }
        if rec.update_stamp == Some(stamp) && !rec.is_present() || rec.update_stamp != Some(stamp) {
            let slot = h.records.entry(value.clone()).or_default();
            slot.update_stamp = Some(stamp);
            // Clear the tombstone this replace just laid down.
            if slot.delete_stamp.is_some_and(|del| del <= stamp) {
                slot.delete_stamp = None;
            }
            changed = true;
        }
    }
    if h.last_attr_update.is_none_or(|up| stamp > up) {
        h.last_attr_update = Some(stamp);
        changed = true;
    }
    changed
}

fn resolve_single(h: &mut SingleValueHistory, op: &ModOp, stamp: ChangeStamp) -> Option<ModOp> {
    match op {
        ModOp::AddValues(values) | ModOp::Replace(values) => {
            let value = values.first()?;
            // Ties favor the ledger: only a strictly newer stamp may move the
            // current value.
            if h.update_stamp.is_some_and(|up| up >= stamp) {
                return None;
            }
            if h.delete_stamp.is_some_and(|del| del >= stamp) {
                return None;
            }
            let had_value = h.is_present();
            h.record_set(value, stamp);
            if had_value {
                // Rewrite the add into a replace of the existing value.
                Some(ModOp::Replace(vec![value.clone()]))
            } else {
                Some(op.clone())
            }
        }
        ModOp::DeleteValues(_) | ModOp::DeleteAttr => {
            if h.update_stamp.is_some_and(|up| up >= stamp) {
                return None;
            }
            let was_present = h.is_present();
            h.record_delete(stamp);
            was_present.then_some(ModOp::DeleteAttr)
        }
    }
}
