//! Capability identifiers and the export table.
//!
//! Locally, capabilities are plain reference-counted handles ([`Value`] and
//! [`Function`]). Identifiers only matter once a capability crosses a
//! connection: the [`CapabilityTable`] pins exported objects alive and counts
//! how many references the peer holds.

mod table;

pub use table::CapabilityTable;

use crate::error::{CalcError, Result};
use crate::function::Function;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable, process-unique capability identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(pub u64);

impl CapabilityId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CapabilityId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// Either kind of capability in the lattice.
#[derive(Debug, Clone)]
pub enum Capability {
    Value(Value),
    Function(Function),
}

impl Capability {
    pub fn id(&self) -> CapabilityId {
        match self {
            Capability::Value(value) => value.id(),
            Capability::Function(function) => function.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Capability::Value(_) => "value",
            Capability::Function(_) => "function",
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Capability::Value(value) => Ok(value),
            other => Err(kind_mismatch(&other, "value")),
        }
    }

    pub fn into_function(self) -> Result<Function> {
        match self {
            Capability::Function(function) => Ok(function),
            other => Err(kind_mismatch(&other, "function")),
        }
    }
}

fn kind_mismatch(capability: &Capability, expected: &str) -> CalcError {
    CalcError::Validation {
        field: "capability".to_string(),
        message: format!(
            "{} is a {}, expected a {}",
            capability.id(),
            capability.kind(),
            expected
        ),
    }
}

impl From<Value> for Capability {
    fn from(value: Value) -> Self {
        Capability::Value(value)
    }
}

impl From<Function> for Capability {
    fn from(function: Function) -> Self {
        Capability::Function(function)
    }
}
