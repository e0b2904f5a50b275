//! Condition Tracking
//!
//! Conditions attached to a single combatant: duration countdown at the end
//! of the owner's turn, auto-removal at zero, and catalog-driven stacking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Stacking Rules
// ============================================================================

/// How a new instance of an already-present condition interacts with it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StackingRule {
    /// The new instance replaces the prior entry (last writer wins)
    #[default]
    Latest,
    /// Instances coexist side by side
    Stack,
    /// The new duration is added to the existing entry
    ExtendDuration,
}

/// Source of per-condition stacking policy.
///
/// The catalog of condition definitions lives outside the engine; the state
/// machine only asks it how a given name stacks.
pub trait ConditionCatalog: Send + Sync {
    fn stacking_rule(&self, name: &str) -> StackingRule;
}

/// Catalog built from configuration: unknown names fall back to `Latest`
#[derive(Debug, Clone, Default)]
pub struct StaticConditionCatalog {
    rules: HashMap<String, StackingRule>,
}

impl StaticConditionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, name: impl Into<String>, rule: StackingRule) -> Self {
        self.rules.insert(name.into().to_ascii_lowercase(), rule);
        self
    }

    pub fn from_lists(stackable: &[String], extend_duration: &[String]) -> Self {
        let mut catalog = Self::new();
        for name in stackable {
            catalog = catalog.with_rule(name.as_str(), StackingRule::Stack);
        }
        for name in extend_duration {
            catalog = catalog.with_rule(name.as_str(), StackingRule::ExtendDuration);
        }
        catalog
    }
}

impl ConditionCatalog for StaticConditionCatalog {
    fn stacking_rule(&self, name: &str) -> StackingRule {
        self.rules
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or_default()
    }
}

// ============================================================================
// Condition
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub name: String,
    /// Remaining turns of the owner; `None` lasts until removed
    pub remaining: Option<u32>,
    pub source: Option<String>,
    pub applied_at: DateTime<Utc>,
}

impl Condition {
    pub fn new(name: impl Into<String>, remaining: Option<u32>) -> Self {
        Self {
            name: name.into(),
            remaining,
            source: None,
            applied_at: Utc::now(),
        }
    }

    /// Builder: set source attribution
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Count down one turn. Returns true once the condition has run out.
    pub fn tick(&mut self) -> bool {
        match self.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Names match the way the catalog keys them, ignoring ASCII case
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

// ============================================================================
// Condition Tracker
// ============================================================================

/// Conditions active on a single combatant
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ConditionTracker {
    conditions: Vec<Condition>,
}

impl ConditionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conditions(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Add a condition, respecting the stacking rule for its name
    pub fn add(&mut self, condition: Condition, rule: StackingRule) {
        let existing = self.conditions.iter().position(|c| c.is_named(&condition.name));

        match (existing, rule) {
            (Some(pos), StackingRule::Latest) => {
                self.conditions[pos] = condition;
            }
            (Some(pos), StackingRule::ExtendDuration) => {
                let current = &mut self.conditions[pos];
                current.remaining = match (current.remaining, condition.remaining) {
                    (Some(a), Some(b)) => Some(a.saturating_add(b)),
                    _ => None,
                };
            }
            (Some(_), StackingRule::Stack) | (None, _) => {
                self.conditions.push(condition);
            }
        }
    }

    /// Remove every instance with the given name; empty if none was present
    pub fn remove_by_name(&mut self, name: &str) -> Vec<Condition> {
        let mut removed = Vec::new();
        self.conditions.retain(|c| {
            if c.is_named(name) {
                removed.push(c.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Tick all conditions at the end of the owner's turn.
    /// Returns the conditions that ran out and were removed.
    pub fn tick_end_of_turn(&mut self) -> Vec<Condition> {
        let mut expired = Vec::new();
        self.conditions.retain_mut(|c| {
            if c.tick() {
                expired.push(c.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.iter().any(|c| c.is_named(name))
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}
