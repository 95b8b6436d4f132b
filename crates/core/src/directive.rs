//! Soft-delete / restore directives.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle directive carried by a projection task.
///
/// Unlike counter deltas this is an **absolute** state set, which makes it
/// idempotent under at-least-once delivery: re-applying `Delete` leaves the
/// document deleted, re-applying `Restore` leaves it visible.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionDirective {
    /// No visibility change.
    #[default]
    None,
    /// Mark the index document soft-deleted (hidden from search).
    Delete,
    /// Clear the soft-delete flag.
    Restore,
}

impl DeletionDirective {
    pub fn is_none(&self) -> bool {
        matches!(self, DeletionDirective::None)
    }

    /// Persistence form: `None` maps to a NULL column, the others to text.
    pub fn as_db_str(&self) -> Option<&'static str> {
        match self {
            DeletionDirective::None => None,
            DeletionDirective::Delete => Some("delete"),
            DeletionDirective::Restore => Some("restore"),
        }
    }

    pub fn from_db_str(value: Option<&str>) -> Result<Self, DomainError> {
        match value {
            None => Ok(DeletionDirective::None),
            Some("delete") => Ok(DeletionDirective::Delete),
            Some("restore") => Ok(DeletionDirective::Restore),
            Some(other) => Err(DomainError::validation(format!(
                "unknown deletion directive: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_str_round_trips() {
        for directive in [
            DeletionDirective::None,
            DeletionDirective::Delete,
            DeletionDirective::Restore,
        ] {
            let db = directive.as_db_str();
            assert_eq!(DeletionDirective::from_db_str(db).unwrap(), directive);
        }
        assert!(DeletionDirective::from_db_str(Some("purge")).is_err());
    }
}
