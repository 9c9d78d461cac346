//! Core domain model for derived-key reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dkr-core";

/// Primary key of an entity. Ordering doubles as "most recently created".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependentId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier computed from a child's source fields and stored redundantly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivedKey(String);

impl DerivedKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DerivedKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Denormalized summary fields maintained by the aggregation phases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAggregates {
    pub total_amount_cents: i64,
    pub latest_child_id: Option<ChildId>,
    pub category: Option<String>,
    pub dependent_count: i64,
    pub dependent_amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub derived_key: DerivedKey,
    #[serde(default)]
    pub aggregates: EntityAggregates,
}

impl Entity {
    pub fn new(id: i64, derived_key: impl Into<String>) -> Self {
        Self {
            id: EntityId(id),
            derived_key: DerivedKey::new(derived_key),
            aggregates: EntityAggregates::default(),
        }
    }
}

/// Record owned by exactly one entity; carries the fields the key is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: ChildId,
    pub entity_id: EntityId,
    pub derived_key: DerivedKey,
    pub record_kind: String,
    #[serde(default)]
    pub amount_cents: i64,
    #[serde(default)]
    pub source_fields: BTreeMap<String, String>,
}

/// Record that points at an entity but has no say in its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentRecord {
    pub id: DependentId,
    pub entity_id: EntityId,
    pub relation: String,
    #[serde(default)]
    pub amount_cents: i64,
}

/// One child whose stored keys disagree with the key its source fields imply.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MismatchRow {
    pub entity_id: EntityId,
    pub entity_key: DerivedKey,
    pub child_id: ChildId,
    pub child_key: DerivedKey,
    pub correct_key: DerivedKey,
}

impl MismatchRow {
    pub fn entity_ids(rows: &[MismatchRow]) -> BTreeSet<EntityId> {
        rows.iter().map(|row| row.entity_id).collect()
    }

    pub fn child_ids(rows: &[MismatchRow]) -> Vec<ChildId> {
        let mut ids = rows.iter().map(|row| row.child_id).collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Live references to an entity, checked right before it is deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCounts {
    pub children: u64,
    pub dependents: BTreeMap<String, u64>,
}

impl ReferenceCounts {
    pub fn total(&self) -> u64 {
        self.children + self.dependents.values().sum::<u64>()
    }

    pub fn is_clear(&self) -> bool {
        self.total() == 0
    }
}

impl fmt::Display for ReferenceCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "children={}", self.children)?;
        for (relation, count) in &self.dependents {
            write!(f, " {relation}={count}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePhase {
    /// Amount totals and latest child pointer.
    Totals,
    /// Category classification from the latest child.
    Categories,
    /// Dependent-record counts and amounts.
    DependentRollups,
}

impl AggregatePhase {
    pub const ALL: [AggregatePhase; 3] = [
        AggregatePhase::Totals,
        AggregatePhase::Categories,
        AggregatePhase::DependentRollups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregatePhase::Totals => "totals",
            AggregatePhase::Categories => "categories",
            AggregatePhase::DependentRollups => "dependent_rollups",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyComponent {
    /// Value of the named source field, or the missing placeholder.
    Field(String),
    /// Always the missing placeholder.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVariant {
    pub record_kind: String,
    pub components: Vec<KeyComponent>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyRuleError {
    #[error("key rule prefix must not be empty")]
    EmptyPrefix,
    #[error("key rule separator must not be empty")]
    EmptySeparator,
    #[error("key rule has no variants")]
    NoVariants,
    #[error("variant for record kind {0:?} has no components")]
    EmptyVariant(String),
    #[error("record kind {0:?} is declared more than once")]
    DuplicateKind(String),
    #[error("variant for record kind {0:?} references an empty field name")]
    EmptyFieldName(String),
}

/// Pure function from a child's source fields to its correct derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRule {
    pub prefix: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_missing")]
    pub missing: String,
    pub variants: Vec<KeyVariant>,
}

fn default_separator() -> String {
    "_".to_string()
}

fn default_missing() -> String {
    "-NONE-".to_string()
}

impl Default for KeyRule {
    fn default() -> Self {
        Self::assistance_award()
    }
}

impl KeyRule {
    /// Assistance award key: aggregate records (kind `1`) key on agency + URI,
    /// non-aggregate records (kind `2`) key on agency + FAIN.
    pub fn assistance_award() -> Self {
        let agency = KeyComponent::Field("awarding_sub_tier_agency_c".to_string());
        Self {
            prefix: "ASST_AW".to_string(),
            separator: default_separator(),
            missing: default_missing(),
            variants: vec![
                KeyVariant {
                    record_kind: "1".to_string(),
                    components: vec![
                        agency.clone(),
                        KeyComponent::Missing,
                        KeyComponent::Field("uri".to_string()),
                    ],
                },
                KeyVariant {
                    record_kind: "2".to_string(),
                    components: vec![
                        agency,
                        KeyComponent::Field("fain".to_string()),
                        KeyComponent::Missing,
                    ],
                },
            ],
        }
    }

    pub fn validate(&self) -> Result<(), KeyRuleError> {
        if self.prefix.is_empty() {
            return Err(KeyRuleError::EmptyPrefix);
        }
        if self.separator.is_empty() {
            return Err(KeyRuleError::EmptySeparator);
        }
        if self.variants.is_empty() {
            return Err(KeyRuleError::NoVariants);
        }
        let mut seen = BTreeSet::new();
        for variant in &self.variants {
            if !seen.insert(variant.record_kind.as_str()) {
                return Err(KeyRuleError::DuplicateKind(variant.record_kind.clone()));
            }
            if variant.components.is_empty() {
                return Err(KeyRuleError::EmptyVariant(variant.record_kind.clone()));
            }
            let empty_field = variant
                .components
                .iter()
                .any(|c| matches!(c, KeyComponent::Field(name) if name.is_empty()));
            if empty_field {
                return Err(KeyRuleError::EmptyFieldName(variant.record_kind.clone()));
            }
        }
        Ok(())
    }

    pub fn variant_for(&self, record_kind: &str) -> Option<&KeyVariant> {
        self.variants.iter().find(|v| v.record_kind == record_kind)
    }

    /// Key the child should carry, or `None` when its kind has no formula.
    pub fn derive(&self, child: &ChildRecord) -> Option<DerivedKey> {
        let variant = self.variant_for(&child.record_kind)?;
        let mut parts = Vec::with_capacity(variant.components.len() + 1);
        parts.push(self.prefix.as_str());
        for component in &variant.components {
            let part = match component {
                KeyComponent::Field(name) => child
                    .source_fields
                    .get(name)
                    .map(String::as_str)
                    .unwrap_or(self.missing.as_str()),
                KeyComponent::Missing => self.missing.as_str(),
            };
            parts.push(part);
        }
        Some(DerivedKey::new(parts.join(&self.separator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(kind: &str, fields: &[(&str, &str)]) -> ChildRecord {
        ChildRecord {
            id: ChildId(1),
            entity_id: EntityId(1),
            derived_key: DerivedKey::from("stale"),
            record_kind: kind.to_string(),
            amount_cents: 0,
            source_fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn aggregate_records_key_on_agency_and_uri() {
        let rule = KeyRule::assistance_award();
        let key = rule
            .derive(&child("1", &[("awarding_sub_tier_agency_c", "7530"), ("uri", "U-1"), ("fain", "F-9")]))
            .unwrap();
        assert_eq!(key.as_str(), "ASST_AW_7530_-NONE-_U-1");
    }

    #[test]
    fn non_aggregate_records_key_on_agency_and_fain() {
        let rule = KeyRule::assistance_award();
        let key = rule
            .derive(&child("2", &[("awarding_sub_tier_agency_c", "7530"), ("fain", "F-9")]))
            .unwrap();
        assert_eq!(key.as_str(), "ASST_AW_7530_F-9_-NONE-");
    }

    #[test]
    fn absent_fields_fall_back_to_placeholder() {
        let rule = KeyRule::assistance_award();
        let key = rule.derive(&child("2", &[])).unwrap();
        assert_eq!(key.as_str(), "ASST_AW_-NONE-_-NONE-_-NONE-");
    }

    #[test]
    fn unknown_kind_has_no_key() {
        let rule = KeyRule::assistance_award();
        assert!(rule.derive(&child("3", &[("fain", "F-9")])).is_none());
    }

    #[test]
    fn validation_rejects_duplicate_kinds() {
        let mut rule = KeyRule::assistance_award();
        rule.variants[1].record_kind = "1".to_string();
        assert_eq!(rule.validate(), Err(KeyRuleError::DuplicateKind("1".to_string())));
        assert!(KeyRule::assistance_award().validate().is_ok());
    }

    #[test]
    fn rule_parses_from_yaml() {
        let yaml = r#"
prefix: CONT_AW
variants:
  - record_kind: contract
    components:
      - field: agency
      - missing
      - field: piid
"#;
        let rule: KeyRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.separator, "_");
        assert_eq!(rule.missing, "-NONE-");
        let key = rule
            .derive(&child("contract", &[("agency", "97"), ("piid", "P1")]))
            .unwrap();
        assert_eq!(key.as_str(), "CONT_AW_97_-NONE-_P1");
    }

    #[test]
    fn reference_counts_sum_all_relations() {
        let mut counts = ReferenceCounts::default();
        assert!(counts.is_clear());
        counts.children = 1;
        counts.dependents.insert("subaward".to_string(), 2);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.to_string(), "children=1 subaward=2");
    }
}
