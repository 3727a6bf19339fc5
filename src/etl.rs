//! ETL rule table
//!
//! Upstream data loads announce "domain X changed" as a `(source, event)` pair.
//! [`EtlRules`] maps known pairs to the key substrings that must be invalidated.

use serde::{Deserialize, Serialize};

/// Matches any source
pub const ANY_SOURCE: &str = "*";

/// One `(source, event) -> patterns` mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlRule {
    /// Emitting loader, or [`ANY_SOURCE`]
    pub source: String,
    pub event: String,
    /// Key substrings passed to `invalidate_pattern`
    pub patterns: Vec<String>,
}

impl EtlRule {
    pub fn new<I, S>(source: impl Into<String>, event: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            event: event.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, source: &str, event: &str) -> bool {
        self.event == event && (self.source == ANY_SOURCE || self.source == source)
    }
}

/// Ordered rule list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlRules {
    rules: Vec<EtlRule>,
}

impl EtlRules {
    /// A table with no rules; every ETL event is re-broadcast
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: EtlRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn push(&mut self, rule: EtlRule) {
        self.rules.push(rule);
    }

    #[must_use]
    pub fn rules(&self) -> &[EtlRule] {
        &self.rules
    }

    /// Patterns to invalidate for a `(source, event)` pair
    ///
    /// Patterns from every matching rule are returned in rule order without
    /// duplicates. Empty means the pair is unknown.
    #[must_use]
    pub fn patterns_for(&self, source: &str, event: &str) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.matches(source, event)) {
            for pattern in &rule.patterns {
                if !patterns.contains(pattern) {
                    patterns.push(pattern.clone());
                }
            }
        }
        patterns
    }
}

impl Default for EtlRules {
    fn default() -> Self {
        Self::empty()
            .with_rule(EtlRule::new("final_watchdog", "inventory_updated", ["inventory"]))
            .with_rule(EtlRule::new(ANY_SOURCE, "leads_updated", ["leads", "kpi"]))
            .with_rule(EtlRule::new(ANY_SOURCE, "sales_updated", ["sales", "kpi"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_inventory_rule() {
        let rules = EtlRules::default();
        assert_eq!(rules.patterns_for("final_watchdog", "inventory_updated"), vec!["inventory"]);
        assert!(rules.patterns_for("other_loader", "inventory_updated").is_empty());
    }

    #[test]
    fn test_wildcard_source() {
        let rules = EtlRules::default();
        assert_eq!(rules.patterns_for("crm_sync", "leads_updated"), vec!["leads", "kpi"]);
    }

    #[test]
    fn test_unknown_pair_and_dedup() {
        let rules = EtlRules::empty()
            .with_rule(EtlRule::new("a", "e", ["x", "y"]))
            .with_rule(EtlRule::new(ANY_SOURCE, "e", ["y", "z"]));
        assert_eq!(rules.patterns_for("a", "e"), vec!["x", "y", "z"]);
        assert_eq!(rules.patterns_for("b", "e"), vec!["y", "z"]);
        assert!(rules.patterns_for("a", "nope").is_empty());
    }
}
