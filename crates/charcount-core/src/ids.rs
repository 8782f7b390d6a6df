//! Identifier generation
//!
//! New games and players need a UUID. Instead of reaching for a global
//! generator, callers pass an [`IdGenerator`] explicitly so tests can swap in
//! a deterministic sequence.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of fresh identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce the next identifier
    fn next_id(&self) -> Uuid;
}

/// Random (v4) identifiers for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic identifiers: 1, 2, 3, ... encoded as the low bits of a UUID
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Create a generator whose first identifier is `Uuid::from_u128(1)`
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Uuid {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(u128::from(n))
    }
}
