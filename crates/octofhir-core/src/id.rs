// Server-assigned logical ids.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid ID: {0:?} (expected 1-64 characters of [A-Za-z0-9-.])")]
    Invalid(String),
}

/// How new logical ids are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// "1", "2", "3", ... shared across resource types
    #[default]
    Sequential,
    /// Random v4 UUIDs
    Uuid,
}

/// Generates logical ids for resources and subscriptions.
///
/// The sequential counter never wraps. `u64::MAX` marks it exhausted, after
/// which ids fall back to UUIDs.
#[derive(Debug)]
pub struct IdGenerator {
    strategy: IdStrategy,
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            next: AtomicU64::new(1),
        }
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    pub fn next_id(&self) -> String {
        match self.strategy {
            IdStrategy::Sequential => match self.next.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |n| (n != u64::MAX).then(|| n + 1),
            ) {
                Ok(n) => n.to_string(),
                Err(_) => generate_id(),
            },
            IdStrategy::Uuid => generate_id(),
        }
    }

    /// Make sure sequential ids never collide with an id restored from storage.
    pub fn observe(&self, existing: &str) {
        if let Ok(n) = existing.parse::<u64>() {
            self.next.fetch_max(n.saturating_add(1), Ordering::Relaxed);
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(IdStrategy::default())
    }
}

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn validate_id(id: &str) -> Result<(), IdError> {
    let valid = (1..=64).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(IdError::Invalid(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_start_at_one() {
        let ids = IdGenerator::new(IdStrategy::Sequential);
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
    }

    #[test]
    fn observe_skips_past_restored_ids() {
        let ids = IdGenerator::default();
        ids.observe("41");
        ids.observe("not-a-number");
        ids.observe("7");
        assert_eq!(ids.next_id(), "42");
    }

    #[test]
    fn sequence_never_wraps() {
        let ids = IdGenerator::default();
        assert_eq!(ids.next_id(), "1");

        ids.observe(&u64::MAX.to_string());
        let after: Vec<String> = (0..3).map(|_| ids.next_id()).collect();
        for id in &after {
            assert_eq!(id.len(), 36, "{id}");
            assert!(validate_id(id).is_ok());
        }
        assert!(!after.iter().any(|id| id == "0" || id == "1"));

        let near = IdGenerator::default();
        near.observe(&(u64::MAX - 2).to_string());
        assert_eq!(near.next_id(), (u64::MAX - 1).to_string());
        assert_eq!(near.next_id().len(), 36);
    }

    #[test]
    fn uuid_ids_are_valid() {
        let ids = IdGenerator::new(IdStrategy::Uuid);
        let id = ids.next_id();
        assert_eq!(id.len(), 36);
        assert!(validate_id(&id).is_ok());
    }

    #[test]
    fn id_validation() {
        assert!(validate_id("abc-1.2").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(&"x".repeat(65)).is_err());
    }
}
