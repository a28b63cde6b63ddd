use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MeshError, Result};
use crate::task::Task;

/// Condition on one payload field, addressed by JSON pointer. Without
/// `equals` the field only has to be present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMatch {
    pub pointer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
}

impl FieldMatch {
    fn matches(&self, payload: &Value) -> bool {
        match (payload.pointer(&self.pointer), &self.equals) {
            (Some(found), Some(expected)) => found == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchPredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldMatch>,
}

impl MatchPredicate {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, pointer: impl Into<String>, equals: Value) -> Self {
        self.fields.push(FieldMatch {
            pointer: pointer.into(),
            equals: Some(equals),
        });
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(kind) = &self.kind {
            if kind != task.kind.as_str() {
                return false;
            }
        }
        self.fields.iter().all(|field| field.matches(&task.payload))
    }

    /// Order-insensitive form used to detect duplicate predicates.
    fn canonical(&self) -> String {
        let mut fields: Vec<String> = self
            .fields
            .iter()
            .map(|field| {
                format!(
                    "{}={}",
                    field.pointer,
                    field
                        .equals
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_else(|| "*".to_string())
                )
            })
            .collect();
        fields.sort();
        format!(
            "{}|{}",
            self.kind.as_deref().unwrap_or("*"),
            fields.join("&")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingRule {
    pub id: String,
    #[serde(rename = "match")]
    pub predicate: MatchPredicate,
    pub target_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_override: Option<i32>,
}

impl RoutingRule {
    pub fn new(
        id: impl Into<String>,
        predicate: MatchPredicate,
        target_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            predicate,
            target_agent: target_agent.into(),
            priority_override: None,
        }
    }

    pub fn with_priority_override(mut self, priority: i32) -> Self {
        self.priority_override = Some(priority);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub target: String,
    pub rule_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed(RouteDecision),
    NoRoute,
}

/// Ordered, immutable rule list. Construct a new table to change routing.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Wrapped { rules: Vec<RoutingRule> },
    Bare(Vec<RoutingRule>),
}

impl RoutingTable {
    /// Rejects tables where two rules share an id or an identical predicate,
    /// since either would make precedence a guess.
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut predicates = HashSet::new();
        for rule in &rules {
            if rule.id.trim().is_empty() {
                return Err(MeshError::AmbiguousRules(
                    "rule id must not be empty".to_string(),
                ));
            }
            if rule.target_agent.trim().is_empty() {
                return Err(MeshError::AmbiguousRules(format!(
                    "rule '{}' has no target agent",
                    rule.id
                )));
            }
            if let Some(field) = rule
                .predicate
                .fields
                .iter()
                .find(|field| !field.pointer.is_empty() && !field.pointer.starts_with('/'))
            {
                return Err(MeshError::AmbiguousRules(format!(
                    "rule '{}' uses invalid JSON pointer '{}'",
                    rule.id, field.pointer
                )));
            }
            if !ids.insert(rule.id.as_str()) {
                return Err(MeshError::AmbiguousRules(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
            if !predicates.insert(rule.predicate.canonical()) {
                return Err(MeshError::AmbiguousRules(format!(
                    "rule '{}' repeats the predicate of an earlier rule",
                    rule.id
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Accepts either `[rule, ...]` or `{"rules": [rule, ...]}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let rules = match serde_json::from_str::<RuleFile>(raw)? {
            RuleFile::Wrapped { rules } | RuleFile::Bare(rules) => rules,
        };
        Self::new(rules)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule wins. No scoring, no fallback.
    pub fn route(&self, task: &Task) -> RouteOutcome {
        self.rules
            .iter()
            .find(|rule| rule.predicate.matches(task))
            .map(|rule| {
                RouteOutcome::Routed(RouteDecision {
                    target: rule.target_agent.clone(),
                    rule_id: rule.id.clone(),
                    priority: rule.priority_override,
                })
            })
            .unwrap_or(RouteOutcome::NoRoute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use serde_json::json;

    fn table() -> RoutingTable {
        RoutingTable::new(vec![
            RoutingRule::new(
                "critical-incidents",
                MatchPredicate::kind("incident").with_field("/severity", json!("critical")),
                "repair",
            )
            .with_priority_override(10),
            RoutingRule::new("incidents", MatchPredicate::kind("incident"), "repair"),
            RoutingRule::new("chat", MatchPredicate::kind("chat"), "orchestrator"),
        ])
        .unwrap()
    }

    #[test]
    fn first_match_wins() {
        let table = table();
        let critical = Task::new(TaskKind::Incident, json!({ "severity": "critical" }), "m");
        match table.route(&critical) {
            RouteOutcome::Routed(decision) => {
                assert_eq!(decision.rule_id, "critical-incidents");
                assert_eq!(decision.priority, Some(10));
            }
            RouteOutcome::NoRoute => panic!("expected a route"),
        }
        let minor = Task::new(TaskKind::Incident, json!({ "severity": "low" }), "m");
        assert!(matches!(
            table.route(&minor),
            RouteOutcome::Routed(RouteDecision { ref rule_id, .. }) if rule_id == "incidents"
        ));
    }

    #[test]
    fn unknown_kind_has_no_route() {
        let task = Task::new("unknown_kind", json!({}), "test");
        assert_eq!(table().route(&task), RouteOutcome::NoRoute);
        assert_eq!(RoutingTable::empty().route(&task), RouteOutcome::NoRoute);
    }

    #[test]
    fn ambiguous_tables_are_rejected() {
        let duplicate_id = RoutingTable::new(vec![
            RoutingRule::new("a", MatchPredicate::kind("chat"), "orchestrator"),
            RoutingRule::new("a", MatchPredicate::kind("incident"), "repair"),
        ]);
        assert!(matches!(duplicate_id, Err(MeshError::AmbiguousRules(_))));

        let same_predicate = RoutingTable::new(vec![
            RoutingRule::new(
                "a",
                MatchPredicate::kind("incident")
                    .with_field("/x", json!(1))
                    .with_field("/y", json!(2)),
                "repair",
            ),
            RoutingRule::new(
                "b",
                MatchPredicate::kind("incident")
                    .with_field("/y", json!(2))
                    .with_field("/x", json!(1)),
                "monitoring",
            ),
        ]);
        assert!(matches!(same_predicate, Err(MeshError::AmbiguousRules(_))));
    }

    #[test]
    fn rule_files_accept_both_shapes() {
        let bare = r#"[{"id": "chat", "match": {"kind": "chat"}, "target_agent": "orchestrator"}]"#;
        let wrapped = r#"{"rules": [
            {"id": "health-checks", "match": {"kind": "health_probe"},
             "target_agent": "monitoring"},
            {"id": "with-session", "match": {"fields": [{"pointer": "/session_id"}]},
             "target_agent": "orchestrator", "priority_override": 2}
        ]}"#;
        assert_eq!(RoutingTable::from_json(bare).unwrap().len(), 1);
        let table = RoutingTable::from_json(wrapped).unwrap();
        assert_eq!(table.len(), 2);
        let task = Task::new("anything", json!({ "session_id": "s-1" }), "frontend");
        assert!(matches!(
            table.route(&task),
            RouteOutcome::Routed(RouteDecision { ref target, .. }) if target == "orchestrator"
        ));
    }
}
