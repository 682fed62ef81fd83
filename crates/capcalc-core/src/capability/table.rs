//! Reference-counted table of exported capabilities.
//!
//! Backed by a sharded concurrent map, so updates to distinct capabilities
//! do not contend on a single lock. Entries removed from the table are
//! dropped outside of the shard lock, because dropping a capability can
//! cascade into further releases.

use super::{Capability, CapabilityId};
use crate::error::{CalcError, Result};
use crate::function::Function;
use crate::value::Value;
use dashmap::DashMap;

struct TableEntry {
    capability: Capability,
    refs: u32,
}

/// Capabilities handed to a peer, keyed by id, with the peer's ref counts.
#[derive(Default)]
pub struct CapabilityTable {
    entries: DashMap<CapabilityId, TableEntry>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a capability, adding one reference. Returns its id.
    pub fn export(&self, capability: Capability) -> CapabilityId {
        let id = capability.id();
        self.entries
            .entry(id)
            .and_modify(|entry| entry.refs += 1)
            .or_insert(TableEntry {
                capability,
                refs: 1,
            });
        id
    }

    /// Add a reference to an exported capability.
    pub fn retain(&self, id: CapabilityId) -> Result<u32> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or(CalcError::CapabilityReleased { id })?;
        entry.refs += 1;
        Ok(entry.refs)
    }

    /// Drop one reference; the entry is removed when none remain.
    ///
    /// Returns the number of references left.
    pub fn release(&self, id: CapabilityId) -> Result<u32> {
        let remaining = {
            let mut entry = self
                .entries
                .get_mut(&id)
                .ok_or(CalcError::CapabilityReleased { id })?;
            entry.refs = entry.refs.saturating_sub(1);
            entry.refs
        };
        if remaining == 0 {
            let removed = self.entries.remove_if(&id, |_, entry| entry.refs == 0);
            drop(removed);
        }
        Ok(remaining)
    }

    pub fn get(&self, id: CapabilityId) -> Result<Capability> {
        self.entries
            .get(&id)
            .map(|entry| entry.capability.clone())
            .ok_or(CalcError::CapabilityReleased { id })
    }

    pub fn value(&self, id: CapabilityId) -> Result<Value> {
        self.get(id)?.into_value()
    }

    pub fn function(&self, id: CapabilityId) -> Result<Function> {
        self.get(id)?.into_function()
    }

    /// References the peer currently holds, or `None` if not exported.
    pub fn ref_count(&self, id: CapabilityId) -> Option<u32> {
        self.entries.get(&id).map(|entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry regardless of ref count. Returns how many were held.
    pub fn clear(&self) -> usize {
        let ids: Vec<CapabilityId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let drained: Vec<(CapabilityId, TableEntry)> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Operator;

    #[test]
    fn test_export_and_release_counts() {
        let table = CapabilityTable::new();
        let value = Value::resolved(5.0);

        let id = table.export(value.clone().into());
        assert_eq!(id, value.id());
        assert_eq!(table.ref_count(id), Some(1));

        assert_eq!(table.export(value.clone().into()), id);
        assert_eq!(table.ref_count(id), Some(2));
        assert_eq!(table.len(), 1);

        assert_eq!(table.release(id).unwrap(), 1);
        assert!(table.value(id).is_ok());

        assert_eq!(table.release(id).unwrap(), 0);
        assert!(table.is_empty());
        assert_eq!(
            table.value(id).unwrap_err(),
            CalcError::CapabilityReleased { id }
        );
    }

    #[test]
    fn test_release_unknown_id_fails() {
        let table = CapabilityTable::new();
        let id = CapabilityId(987_654);
        assert_eq!(
            table.release(id),
            Err(CalcError::CapabilityReleased { id })
        );
        assert!(table.retain(id).is_err());
    }

    #[test]
    fn test_retain_adds_reference() {
        let table = CapabilityTable::new();
        let id = table.export(Function::operator(Operator::Multiply).into());
        assert_eq!(table.retain(id).unwrap(), 2);
        assert!(table.function(id).is_ok());
        assert!(table.value(id).is_err());
    }

    #[test]
    fn test_table_pins_capability_alive() {
        let table = CapabilityTable::new();
        let (value, resolver) = Value::pending();
        let id = table.export(value.into());

        // The only remaining handle lives in the table.
        assert!(!resolver.is_abandoned());
        table.release(id).unwrap();
        assert!(resolver.is_abandoned());
    }

    #[test]
    fn test_clear_drops_everything() {
        let table = CapabilityTable::new();
        table.export(Value::resolved(1.0).into());
        table.export(Value::resolved(2.0).into());
        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
    }
}
