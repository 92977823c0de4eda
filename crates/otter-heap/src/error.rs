//! Heap error types

use crate::address::Address;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the heap and the collector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// The reserved address range has no region left to commit
    #[error("out of address space: all {max_regions} regions are in use")]
    OutOfAddressSpace {
        /// Size of the reserved range in regions
        max_regions: usize,
    },

    /// Allocation failed after every collection retry
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory {
        /// Requested block size in bytes
        requested: usize,
    },

    /// A mutator did not reach a safepoint in time
    #[error("mutator {mutator} did not reach a safepoint within {waited:?} (state: {state})")]
    SafepointTimeout {
        /// Id of the offending mutator
        mutator: usize,
        /// Its state when the timeout fired
        state: &'static str,
        /// How long the coordinator waited
        waited: Duration,
    },

    /// Marking verification found a black object pointing at a white one
    #[error("marking invariant violated: black object {object} field {field} refers to white object {target}")]
    MarkInvariantViolation {
        /// The black object
        object: Address,
        /// Reference slot index inside `object`
        field: usize,
        /// The white referent
        target: Address,
    },

    /// Heap verification found a structural inconsistency
    #[error("heap verification failed: {0}")]
    HeapCorruption(String),

    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Address does not name a live object
    #[error("invalid heap address {0}")]
    InvalidAddress(Address),

    /// Reference slot index outside the object's reference slots
    #[error("field {field} out of bounds for object {object} with {ref_slots} reference slots")]
    FieldOutOfBounds {
        /// The object
        object: Address,
        /// Requested slot
        field: usize,
        /// Number of reference slots the object has
        ref_slots: usize,
    },

    /// Payload word index past the end of the object
    #[error("payload word {index} out of bounds for object {object} with {words} payload words")]
    PayloadOutOfBounds {
        /// The object
        object: Address,
        /// Requested payload word
        index: usize,
        /// Payload words the object has
        words: usize,
    },

    /// Object layout does not fit its size
    #[error("invalid layout: {ref_slots} reference slots do not fit in {size} bytes")]
    InvalidLayout {
        /// Requested size in bytes
        size: usize,
        /// Requested reference slots
        ref_slots: usize,
    },

    /// The background marker thread is not running
    #[error("background marker thread is not running")]
    Detached,

    /// A collector thread could not be started
    #[error("failed to spawn collector thread: {0}")]
    ThreadSpawn(String),
}

impl GcError {
    /// Whether a collection could resolve this error
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            GcError::OutOfMemory { .. } | GcError::OutOfAddressSpace { .. }
        )
    }

    /// Whether the error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GcError::SafepointTimeout { .. }
                | GcError::MarkInvariantViolation { .. }
                | GcError::HeapCorruption(_)
        )
    }
}

/// Result alias used across the crate
pub type GcResult<T> = Result<T, GcError>;

/// Escalate an unrecoverable heap error.
///
/// The release profile builds with `panic = "abort"`, so this terminates the
/// process there.
#[cold]
pub fn fatal(err: GcError) -> ! {
    tracing::error!(target: "otter::heap", error = %err, "fatal heap error");
    panic!("fatal heap error: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GcError::OutOfMemory { requested: 8 }.is_allocation_failure());
        assert!(GcError::OutOfAddressSpace { max_regions: 4 }.is_allocation_failure());
        assert!(!GcError::Detached.is_allocation_failure());

        let timeout = GcError::SafepointTimeout {
            mutator: 3,
            state: "running",
            waited: Duration::from_millis(5),
        };
        assert!(timeout.is_fatal());
        assert!(timeout.to_string().contains("mutator 3"));
    }

    #[test]
    #[should_panic(expected = "fatal heap error")]
    fn test_fatal_panics() {
        fatal(GcError::HeapCorruption("overlapping chunks".into()));
    }
}
