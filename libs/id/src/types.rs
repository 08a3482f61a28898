//! Identifier types used by the orchestrator.

use crate::prefixed_id;

prefixed_id!(
    /// Identifies a recovery plan.
    PlanId,
    "plan"
);

prefixed_id!(
    /// Identifies one run of a recovery plan.
    ExecutionId,
    "exec"
);


/// Monotonic notification sequence number, not ULID-based.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version marker of a stored execution record.
///
/// Every successful write bumps the version by one; a writer holding an
/// older version is rejected by the store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct RecordVersion(u64);

impl RecordVersion {
    /// Version assigned on first insert.
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_execution_id_prefix() {
        let id = ExecutionId::new();
        assert!(id.to_string().starts_with("exec_"));
    }

    #[test]
    fn test_plan_id_rejects_execution_prefix() {
        let exec = ExecutionId::new().to_string();
        let err = PlanId::parse(&exec).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ExecutionId::parse(""), Err(IdError::Empty));
        assert_eq!(
            ExecutionId::parse("exec01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
        assert!(matches!(
            ExecutionId::parse("exec_nope"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_json_is_string_form() {
        let id = PlanId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PlanId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_record_version_next() {
        assert_eq!(RecordVersion::INITIAL.next().value(), 2);
        assert!(RecordVersion::INITIAL < RecordVersion::INITIAL.next());
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [PlanId::PREFIX, ExecutionId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_parse_display(raw in any::<u128>()) {
            let id = ExecutionId::from_ulid(crate::Ulid(raw));
            prop_assert_eq!(ExecutionId::parse(&id.to_string()), Ok(id));
        }
    }
}
