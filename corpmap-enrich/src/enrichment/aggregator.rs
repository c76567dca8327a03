//! Field aggregation and confidence resolution
//!
//! Folds one tier's successful outcomes into the session field map.
//!
//! Per field, candidate values from the tier are grouped by equality:
//! - confidence = highest base confidence in the group
//!   + `agreement_bonus` for every additional agreeing source
//!   - `conflict_penalty` when an earlier tier already set a different value
//! - the best group wins by confidence, then per-field adapter priority,
//!   then adapter name
//! - the winner replaces the stored entry when its confidence is at least
//!   the stored one; every reporting source is appended to provenance
//!
//! Outcomes are sorted before folding, so the result does not depend on the
//! order in which adapters finished.

use crate::adapters::AdapterRegistry;
use crate::types::{FieldClass, TierResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One resolved field of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    pub value: Value,
    /// 0-100
    pub confidence: u8,
    /// Every adapter that reported this field, in fold order
    pub contributing_sources: Vec<String>,
    pub last_updated_tier: u8,
    pub class: FieldClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// First value for the field
    Added,
    /// Value or confidence replaced
    Updated,
    /// Only provenance grew
    Corroborated,
}

/// Change to one field produced by a fold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDelta {
    pub name: String,
    pub value: Value,
    pub confidence: u8,
    pub previous_confidence: Option<u8>,
    pub contributing_sources: Vec<String>,
    pub kind: DeltaKind,
}

/// Candidates for one value of one field
struct Group {
    value: Value,
    class: FieldClass,
    /// (priority rank, adapter name, base confidence), sorted
    sources: Vec<(usize, String, u8)>,
    confidence: u8,
}

pub struct FieldAggregator {
    registry: Arc<AdapterRegistry>,
    agreement_bonus: u8,
    conflict_penalty: u8,
}

impl FieldAggregator {
    pub fn new(registry: Arc<AdapterRegistry>, agreement_bonus: u8, conflict_penalty: u8) -> Self {
        Self {
            registry,
            agreement_bonus,
            conflict_penalty,
        }
    }

    /// Fold one tier into `fields`, returning the changes in field-name order
    pub fn fold(&self, fields: &mut BTreeMap<String, FieldEntry>, tier: &TierResult) -> Vec<FieldDelta> {
        let tier_number = tier.tier_number;

        // field name -> comparison key -> group
        let mut candidates: BTreeMap<String, BTreeMap<String, Group>> = BTreeMap::new();
        for outcome in tier.outcomes.iter().filter(|o| o.succeeded) {
            for field in outcome.fields.normalize() {
                let rank = self.registry.priority_of(&field.name, &outcome.adapter_name);
                let group = candidates
                    .entry(field.name.clone())
                    .or_default()
                    .entry(comparison_key(&field.value))
                    .or_insert_with(|| Group {
                        value: field.value.clone(),
                        class: field.class,
                        sources: Vec::new(),
                        confidence: 0,
                    });
                if !group.sources.iter().any(|(_, name, _)| name == &outcome.adapter_name) {
                    group
                        .sources
                        .push((rank, outcome.adapter_name.clone(), outcome.base_confidence.min(100)));
                }
            }
        }

        let mut deltas = Vec::new();
        for (name, groups) in candidates {
            let existing = fields.get(&name);
            let mut groups: Vec<Group> = groups.into_values().collect();

            for group in &mut groups {
                group.sources.sort();
                let base = group.sources.iter().map(|(_, _, c)| *c).max().unwrap_or(0);
                let agreeing = group.sources.len().saturating_sub(1);
                let mut confidence = u32::from(base)
                    + u32::from(self.agreement_bonus).saturating_mul(agreeing as u32);
                let conflicts = existing.is_some_and(|e| {
                    e.last_updated_tier < tier_number
                        && comparison_key(&e.value) != comparison_key(&group.value)
                });
                if conflicts {
                    confidence = confidence.saturating_sub(u32::from(self.conflict_penalty));
                }
                group.confidence = confidence.min(100) as u8;
            }

            groups.sort_by(|a, b| {
                b.confidence
                    .cmp(&a.confidence)
                    .then_with(|| a.sources[0].cmp(&b.sources[0]))
            });

            let Some(winner) = groups.first() else {
                continue;
            };

            let mut reporting: Vec<String> = Vec::new();
            for group in &groups {
                for (_, adapter, _) in &group.sources {
                    reporting.push(adapter.clone());
                }
            }

            match fields.get_mut(&name) {
                None => {
                    let entry = FieldEntry {
                        name: name.clone(),
                        value: winner.value.clone(),
                        confidence: winner.confidence,
                        contributing_sources: reporting,
                        last_updated_tier: tier_number,
                        class: winner.class,
                    };
                    deltas.push(delta(&entry, None, DeltaKind::Added));
                    fields.insert(name, entry);
                }
                Some(entry) => {
                    let previous = entry.confidence;
                    let mut grew = false;
                    for adapter in reporting {
                        if !entry.contributing_sources.contains(&adapter) {
                            entry.contributing_sources.push(adapter);
                            grew = true;
                        }
                    }

                    if winner.confidence >= entry.confidence {
                        let changed = entry.value != winner.value || entry.confidence != winner.confidence;
                        entry.value = winner.value.clone();
                        entry.confidence = winner.confidence;
                        entry.class = winner.class;
                        entry.last_updated_tier = tier_number;
                        if changed {
                            deltas.push(delta(entry, Some(previous), DeltaKind::Updated));
                            continue;
                        }
                    }
                    if grew {
                        deltas.push(delta(entry, Some(previous), DeltaKind::Corroborated));
                    }
                }
            }
        }

        deltas
    }
}

fn delta(entry: &FieldEntry, previous_confidence: Option<u8>, kind: DeltaKind) -> FieldDelta {
    FieldDelta {
        name: entry.name.clone(),
        value: entry.value.clone(),
        confidence: entry.confidence,
        previous_confidence,
        contributing_sources: entry.contributing_sources.clone(),
        kind,
    }
}

/// Equality key: strings compare case-insensitively with collapsed whitespace
fn comparison_key(value: &Value) -> String {
    match value {
        Value::String(s) => s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::ScriptedAdapter;
    use crate::adapters::SourceAdapter;
    use crate::types::{AdapterError, FieldSet, KnownField, SourceOutcome};
    use chrono::Utc;
    use serde_json::json;

    fn registry(priorities: &[(&str, &[&str])]) -> Arc<AdapterRegistry> {
        let adapters: Vec<Arc<dyn SourceAdapter>> =
            vec![Arc::new(ScriptedAdapter::ok("website", 1, FieldSet::default()))];
        let priorities = priorities
            .iter()
            .map(|(field, names)| {
                (
                    field.to_string(),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect();
        Arc::new(AdapterRegistry::new(adapters, priorities).unwrap())
    }

    fn aggregator() -> FieldAggregator {
        FieldAggregator::new(registry(&[]), 10, 15)
    }

    fn ok(adapter: &str, tier: u8, confidence: u8, fields: FieldSet) -> SourceOutcome {
        SourceOutcome::success(adapter, tier, confidence, 1.0, fields, 10, 1)
    }

    fn name(value: &str) -> FieldSet {
        FieldSet::new().with(KnownField::LegalName(value.to_string()))
    }

    fn tier(number: u8, outcomes: Vec<SourceOutcome>) -> TierResult {
        TierResult::new(number, outcomes, Utc::now())
    }

    #[test]
    fn test_agreement_adds_bonus() {
        let mut fields = BTreeMap::new();
        let deltas = aggregator().fold(
            &mut fields,
            &tier(1, vec![ok("a", 1, 60, name("Acme Inc.")), ok("b", 1, 50, name("ACME  inc."))]),
        );

        let entry = &fields["legal_name"];
        assert_eq!(entry.confidence, 70);
        assert_eq!(entry.contributing_sources, vec!["a", "b"]);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind, DeltaKind::Added);
    }

    #[test]
    fn test_failed_outcomes_contribute_nothing() {
        let mut fields = BTreeMap::new();
        let failed = SourceOutcome::failure("a", 1, 90, AdapterError::timeout("slow"), 10, 1);
        let deltas = aggregator().fold(&mut fields, &tier(1, vec![failed]));

        assert!(deltas.is_empty());
        assert!(fields.is_empty());
    }

    #[test]
    fn test_higher_later_tier_replaces_and_keeps_provenance() {
        let agg = aggregator();
        let mut fields = BTreeMap::new();
        agg.fold(&mut fields, &tier(1, vec![ok("website", 1, 40, name("Acme"))]));
        let deltas = agg.fold(&mut fields, &tier(2, vec![ok("registry", 2, 90, name("Acme Holdings GmbH"))]));

        let entry = &fields["legal_name"];
        assert_eq!(entry.value, json!("Acme Holdings GmbH"));
        // 90 - 15 conflict penalty
        assert_eq!(entry.confidence, 75);
        assert_eq!(entry.last_updated_tier, 2);
        assert_eq!(entry.contributing_sources, vec!["website", "registry"]);
        assert_eq!(deltas[0].previous_confidence, Some(40));
        assert_eq!(deltas[0].kind, DeltaKind::Updated);
    }

    #[test]
    fn test_lower_confidence_does_not_replace_but_is_recorded() {
        let agg = aggregator();
        let mut fields = BTreeMap::new();
        agg.fold(&mut fields, &tier(1, vec![ok("registry", 1, 90, name("Acme GmbH"))]));
        let deltas = agg.fold(&mut fields, &tier(2, vec![ok("geo", 2, 60, name("Acme Corp"))]));

        let entry = &fields["legal_name"];
        assert_eq!(entry.value, json!("Acme GmbH"));
        assert_eq!(entry.confidence, 90);
        assert_eq!(entry.contributing_sources, vec!["registry", "geo"]);
        assert_eq!(deltas[0].kind, DeltaKind::Corroborated);
    }

    #[test]
    fn test_confidence_never_decreases_without_value_change() {
        let agg = aggregator();
        let mut fields = BTreeMap::new();
        agg.fold(&mut fields, &tier(1, vec![ok("a", 1, 80, name("Acme"))]));
        agg.fold(&mut fields, &tier(2, vec![ok("b", 2, 30, name("Acme"))]));
        agg.fold(&mut fields, &tier(3, vec![ok("c", 3, 20, name("Other"))]));

        assert_eq!(fields["legal_name"].value, json!("Acme"));
        assert_eq!(fields["legal_name"].confidence, 80);
    }

    #[test]
    fn test_tie_broken_by_priority_then_name() {
        let agg = FieldAggregator::new(registry(&[("legal_name", &["zeta"])]), 10, 15);
        let mut fields = BTreeMap::new();
        agg.fold(
            &mut fields,
            &tier(1, vec![ok("alpha", 1, 60, name("Alpha Co")), ok("zeta", 1, 60, name("Zeta Co"))]),
        );
        assert_eq!(fields["legal_name"].value, json!("Zeta Co"));

        let mut fields = BTreeMap::new();
        aggregator().fold(
            &mut fields,
            &tier(1, vec![ok("zeta", 1, 60, name("Zeta Co")), ok("alpha", 1, 60, name("Alpha Co"))]),
        );
        assert_eq!(fields["legal_name"].value, json!("Alpha Co"));
    }

    #[test]
    fn test_fold_is_order_independent() {
        let outcomes = vec![
            ok("a", 1, 55, name("Acme").with(KnownField::Industry("Widgets".into()))),
            ok("b", 1, 70, name("Acme Inc").with_extension("rating", json!(4.1))),
            ok("c", 1, 55, name("Acme").with_extension("unknown_key", json!(true))),
        ];
        let mut reversed = outcomes.clone();
        reversed.reverse();

        let mut forward = BTreeMap::new();
        let mut backward = BTreeMap::new();
        let d1 = aggregator().fold(&mut forward, &tier(1, outcomes));
        let d2 = aggregator().fold(&mut backward, &tier(1, reversed));

        assert_eq!(forward, backward);
        assert_eq!(d1, d2);
        assert!(forward.contains_key("unknown.unknown_key"));
        assert_eq!(forward["unknown.unknown_key"].class, FieldClass::Volatile);
    }

    #[test]
    fn test_confidence_is_capped() {
        let agg = FieldAggregator::new(registry(&[]), 50, 0);
        let mut fields = BTreeMap::new();
        agg.fold(
            &mut fields,
            &tier(1, vec![ok("a", 1, 90, name("Acme")), ok("b", 1, 90, name("Acme"))]),
        );
        assert_eq!(fields["legal_name"].confidence, 100);
    }
}
