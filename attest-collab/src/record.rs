//! Requirement record model.
//!
//! A `Requirement` is one compliance record (a control/requirement row) owned
//! by an organization. All mutable data lives in a field map; the `version`
//! counter is the optimistic-concurrency token checked by the store on every
//! write. Version moves by exactly +1 per accepted write and never skips.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use uuid::Uuid;

/// Well-known field names on a requirement record.
///
/// The field map is an open set — these are the names the validation layer
/// type-checks and the UI renders with dedicated widgets.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const EVIDENCE: &str = "evidence";
    pub const NOTES: &str = "notes";
    pub const TAGS: &str = "tags";
    pub const RESPONSIBLE: &str = "responsible_party";
    pub const RISK_LEVEL: &str = "risk_level";
}

/// Current epoch time in whole seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Field values ───────────────────────────────────────────────────

/// Fulfillment state of a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceStatus {
    Fulfilled,
    PartiallyFulfilled,
    NotFulfilled,
    NotApplicable,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Fulfilled => "fulfilled",
            ComplianceStatus::PartiallyFulfilled => "partially_fulfilled",
            ComplianceStatus::NotFulfilled => "not_fulfilled",
            ComplianceStatus::NotApplicable => "not_applicable",
        }
    }
}

/// Assessed risk of leaving a requirement unfulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// One value in the requirement field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Free text (notes, evidence descriptions, titles).
    Text(String),
    /// Fulfillment status — only valid under the `status` field name.
    Status(ComplianceStatus),
    /// Risk assessment — only valid under the `risk_level` field name.
    Risk(RiskLevel),
    /// Tag list.
    Tags(Vec<String>),
    /// Reference to another entity (responsible actor, linked evidence).
    Reference(Uuid),
}

/// The field changes a writer wants applied in one write.
pub type FieldUpdates = BTreeMap<String, FieldValue>;

// ─── Validation ─────────────────────────────────────────────────────

/// A field update rejected before the compare-and-swap is attempted.
///
/// Validation failures are local to the write and must stay distinguishable
/// from version conflicts — the UI reacts differently to each.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: Option<String>,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<Option<String>>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(name) => write!(f, "invalid field `{name}`: {}", self.reason),
            None => write!(f, "invalid update: {}", self.reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a field-update set before any store interaction.
///
/// Unknown field names are allowed (the field map is an open set); the
/// well-known typed fields must carry the matching `FieldValue` variant.
pub fn validate_updates(updates: &FieldUpdates) -> Result<(), ValidationError> {
    if updates.is_empty() {
        return Err(ValidationError::new(None, "no fields to update"));
    }

    for (name, value) in updates {
        if name.trim().is_empty() {
            return Err(ValidationError::new(None, "empty field name"));
        }

        match (name.as_str(), value) {
            (fields::STATUS, FieldValue::Status(_)) => {}
            (fields::STATUS, _) => {
                return Err(ValidationError::new(
                    Some(name.clone()),
                    "expected a compliance status value",
                ));
            }
            (fields::RISK_LEVEL, FieldValue::Risk(_)) => {}
            (fields::RISK_LEVEL, _) => {
                return Err(ValidationError::new(
                    Some(name.clone()),
                    "expected a risk level value",
                ));
            }
            (fields::TAGS, FieldValue::Tags(tags)) => {
                if tags.iter().any(|t| t.trim().is_empty()) {
                    return Err(ValidationError::new(
                        Some(name.clone()),
                        "empty tag",
                    ));
                }
            }
            (fields::TAGS, _) => {
                return Err(ValidationError::new(
                    Some(name.clone()),
                    "expected a tag list",
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

// ─── Requirement record ─────────────────────────────────────────────

/// One versioned compliance record.
///
/// `version` starts at 0 on creation and increments by exactly 1 per accepted
/// write. The store's compare-and-swap is the only path that mutates a stored
/// record; nothing else may touch `version` or `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: Uuid,
    pub org_id: Uuid,
    pub fields: BTreeMap<String, FieldValue>,
    pub version: u64,
    pub updated_at: u64,
    pub updated_by: Uuid,
}

impl Requirement {
    /// Create a fresh record at version 0.
    pub fn new(org_id: Uuid, actor_id: Uuid, fields: FieldUpdates) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            fields,
            version: 0,
            updated_at: unix_now(),
            updated_by: actor_id,
        }
    }

    /// Apply accepted field updates in place, bumping the version by 1.
    ///
    /// Callers must have won the compare-and-swap first — this is the commit
    /// half, not the check.
    pub fn apply(&mut self, updates: &FieldUpdates, actor_id: Uuid) {
        for (name, value) in updates {
            self.fields.insert(name.clone(), value.clone());
        }
        self.version += 1;
        self.updated_at = unix_now();
        self.updated_by = actor_id;
    }

    /// Look up a single field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Encode for storage (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| e.to_string())
    }

    /// Decode from storage bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_updates() -> FieldUpdates {
        let mut updates = FieldUpdates::new();
        updates.insert(
            fields::STATUS.into(),
            FieldValue::Status(ComplianceStatus::Fulfilled),
        );
        updates.insert(fields::NOTES.into(), FieldValue::Text("reviewed".into()));
        updates
    }

    #[test]
    fn test_new_record_starts_at_version_zero() {
        let actor = Uuid::new_v4();
        let record = Requirement::new(Uuid::new_v4(), actor, sample_updates());
        assert_eq!(record.version, 0);
        assert_eq!(record.updated_by, actor);
        assert!(record.updated_at > 0);
    }

    #[test]
    fn test_apply_increments_version_by_one() {
        let mut record = Requirement::new(Uuid::new_v4(), Uuid::new_v4(), FieldUpdates::new());
        let actor = Uuid::new_v4();

        record.apply(&sample_updates(), actor);
        assert_eq!(record.version, 1);
        assert_eq!(record.updated_by, actor);

        record.apply(&sample_updates(), actor);
        assert_eq!(record.version, 2);
    }

    #[test]
    fn test_apply_overlays_fields() {
        let mut record = Requirement::new(Uuid::new_v4(), Uuid::new_v4(), sample_updates());

        let mut updates = FieldUpdates::new();
        updates.insert(
            fields::STATUS.into(),
            FieldValue::Status(ComplianceStatus::NotFulfilled),
        );
        record.apply(&updates, Uuid::new_v4());

        // Updated field replaced, untouched field preserved.
        assert_eq!(
            record.field(fields::STATUS),
            Some(&FieldValue::Status(ComplianceStatus::NotFulfilled))
        );
        assert_eq!(
            record.field(fields::NOTES),
            Some(&FieldValue::Text("reviewed".into()))
        );
    }

    #[test]
    fn test_record_roundtrip() {
        let record = Requirement::new(Uuid::new_v4(), Uuid::new_v4(), sample_updates());
        let encoded = record.encode().unwrap();
        let decoded = Requirement::decode(&encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_validate_rejects_empty_update_set() {
        let updates = FieldUpdates::new();
        assert!(validate_updates(&updates).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_field_name() {
        let mut updates = FieldUpdates::new();
        updates.insert("  ".into(), FieldValue::Text("x".into()));
        assert!(validate_updates(&updates).is_err());
    }

    #[test]
    fn test_validate_rejects_mistyped_status() {
        let mut updates = FieldUpdates::new();
        updates.insert(fields::STATUS.into(), FieldValue::Text("fulfilled".into()));
        let err = validate_updates(&updates).unwrap_err();
        assert_eq!(err.field.as_deref(), Some(fields::STATUS));
    }

    #[test]
    fn test_validate_rejects_mistyped_risk() {
        let mut updates = FieldUpdates::new();
        updates.insert(fields::RISK_LEVEL.into(), FieldValue::Text("high".into()));
        assert!(validate_updates(&updates).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_tag() {
        let mut updates = FieldUpdates::new();
        updates.insert(
            fields::TAGS.into(),
            FieldValue::Tags(vec!["iso-27001".into(), "".into()]),
        );
        assert!(validate_updates(&updates).is_err());
    }

    #[test]
    fn test_validate_accepts_open_set_fields() {
        let mut updates = FieldUpdates::new();
        updates.insert("control_reference".into(), FieldValue::Text("A.5.1".into()));
        updates.insert(
            fields::RESPONSIBLE.into(),
            FieldValue::Reference(Uuid::new_v4()),
        );
        updates.insert(
            fields::RISK_LEVEL.into(),
            FieldValue::Risk(RiskLevel::Critical),
        );
        assert!(validate_updates(&updates).is_ok());
    }

    #[test]
    fn test_status_and_risk_names() {
        assert_eq!(ComplianceStatus::PartiallyFulfilled.as_str(), "partially_fulfilled");
        assert_eq!(RiskLevel::Critical.as_str(), "critical");
        assert!(RiskLevel::Low < RiskLevel::High);
    }
}
