//! Subjects of projection: which primary aggregate a task targets.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::SubjectId;

/// The kind of primary aggregate a projection task targets.
///
/// The platform projects two aggregate kinds into the search index. Each kind
/// maps to its own index, so the pair `(kind, id)` uniquely names an index
/// document.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Dataset,
    Project,
}

impl SubjectKind {
    /// Stable textual form, used for persistence and index routing.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Dataset => "dataset",
            SubjectKind::Project => "project",
        }
    }
}

impl core::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset" => Ok(SubjectKind::Dataset),
            "project" => Ok(SubjectKind::Project),
            other => Err(DomainError::UnknownSubjectKind(other.to_string())),
        }
    }
}

/// Fully-qualified reference to one index document.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl SubjectRef {
    pub fn new(kind: SubjectKind, id: impl Into<SubjectId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn dataset(id: impl Into<SubjectId>) -> Self {
        Self::new(SubjectKind::Dataset, id)
    }

    pub fn project(id: impl Into<SubjectId>) -> Self {
        Self::new(SubjectKind::Project, id)
    }
}

impl core::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [SubjectKind::Dataset, SubjectKind::Project] {
            assert_eq!(kind.as_str().parse::<SubjectKind>().unwrap(), kind);
        }
        assert!("comment".parse::<SubjectKind>().is_err());
    }

    #[test]
    fn subject_ref_display() {
        assert_eq!(SubjectRef::dataset(42).to_string(), "dataset/42");
    }
}
