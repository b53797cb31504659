use crate::matcher::score_rule;
use crate::types::{MatchingType, Rule};

/// The ordered union of one owner's rules: advanced rules first, then auto
/// rules, insertion order within each tier. That order is the whole
/// precedence policy.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub owner_id: String,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn assemble(owner_id: &str, mut rules: Vec<Rule>) -> RuleSet {
        rules.sort_by(|a, b| {
            b.advanced
                .cmp(&a.advanced)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        RuleSet {
            owner_id: owner_id.to_string(),
            rules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    Matched { rule: Rule, score: f64 },
    Unmatched,
}

impl ResolutionOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, ResolutionOutcome::Matched { .. })
    }
}

/// First rule clearing its acceptance threshold wins. Word, regex and synonym
/// strategies are all-or-nothing and require an exact 1.0; fuzzy accepts the
/// configured threshold. Pure function of its inputs: no hidden state, safe
/// to re-evaluate.
pub fn resolve(message: &str, rule_set: &RuleSet, fuzzy_threshold: f64) -> ResolutionOutcome {
    for rule in &rule_set.rules {
        let score = score_rule(message, rule);
        let accepted = match rule.matching_type {
            MatchingType::FuzzyMatch => score >= fuzzy_threshold,
            _ => score >= 1.0,
        };
        if accepted {
            return ResolutionOutcome::Matched {
                rule: rule.clone(),
                score,
            };
        }
    }
    ResolutionOutcome::Unmatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MatchingType, ResponseKind};

    fn rule(id: &str, keywords: &[&str], matching: MatchingType, advanced: bool) -> Rule {
        Rule {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            matching_type: matching,
            response: format!("response-{id}"),
            response_kind: ResponseKind::Text,
            button_label: None,
            advanced,
            created_at: format!("2026-01-01T00:00:{id:0>2}Z"),
        }
    }

    #[test]
    fn advanced_rules_win_over_auto_rules() {
        let set = RuleSet::assemble(
            "owner-1",
            vec![
                rule("01", &["hello"], MatchingType::WordMatch, false),
                rule("02", &["hello"], MatchingType::WordMatch, true),
            ],
        );
        match resolve("hello there", &set, 0.8) {
            ResolutionOutcome::Matched { rule, .. } => assert_eq!(rule.id, "02"),
            ResolutionOutcome::Unmatched => panic!("expected a match"),
        }
    }

    #[test]
    fn first_inserted_rule_wins_within_a_tier() {
        let set = RuleSet::assemble(
            "owner-1",
            vec![
                rule("05", &["hello"], MatchingType::WordMatch, false),
                rule("03", &["hello"], MatchingType::WordMatch, false),
            ],
        );
        match resolve("hello", &set, 0.8) {
            ResolutionOutcome::Matched { rule, .. } => assert_eq!(rule.id, "03"),
            ResolutionOutcome::Unmatched => panic!("expected a match"),
        }
    }

    #[test]
    fn first_match_wins_over_higher_scores_later() {
        // The fuzzy rule clears its threshold first even though the word rule
        // after it would score a perfect 1.0.
        let set = RuleSet::assemble(
            "owner-1",
            vec![
                rule("01", &["pricing"], MatchingType::FuzzyMatch, false),
                rule("02", &["prcing"], MatchingType::WordMatch, false),
            ],
        );
        match resolve("prcing", &set, 0.8) {
            ResolutionOutcome::Matched { rule, score } => {
                assert_eq!(rule.id, "01");
                assert!(score < 1.0);
            }
            ResolutionOutcome::Unmatched => panic!("expected a match"),
        }
    }

    #[test]
    fn fuzzy_threshold_is_applied_by_the_resolver() {
        let set = RuleSet::assemble(
            "owner-1",
            vec![rule("01", &["pricing"], MatchingType::FuzzyMatch, false)],
        );
        assert!(resolve("prcing", &set, 0.8).is_matched());
        assert!(!resolve("prcing", &set, 0.99).is_matched());
    }

    #[test]
    fn invalid_regex_rule_never_fails_resolution() {
        let set = RuleSet::assemble(
            "owner-1",
            vec![
                rule("01", &["(unclosed"], MatchingType::Regex, false),
                rule("02", &["hello"], MatchingType::WordMatch, false),
            ],
        );
        match resolve("hello", &set, 0.8) {
            ResolutionOutcome::Matched { rule, .. } => assert_eq!(rule.id, "02"),
            ResolutionOutcome::Unmatched => panic!("expected a match"),
        }
        assert!(!resolve("anything else", &set, 0.8).is_matched());
    }

    #[test]
    fn resolve_is_deterministic() {
        let set = RuleSet::assemble(
            "owner-1",
            vec![
                rule("01", &["pricing"], MatchingType::FuzzyMatch, false),
                rule("02", &["hello"], MatchingType::WordMatch, true),
            ],
        );
        for _ in 0..5 {
            match (resolve("hello pricing", &set, 0.8), resolve("hello pricing", &set, 0.8)) {
                (
                    ResolutionOutcome::Matched { rule: a, score: sa },
                    ResolutionOutcome::Matched { rule: b, score: sb },
                ) => {
                    assert_eq!(a.id, b.id);
                    assert_eq!(sa, sb);
                }
                _ => panic!("expected stable matches"),
            }
        }
    }

    #[test]
    fn no_rule_clearing_threshold_is_unmatched() {
        let set = RuleSet::assemble(
            "owner-1",
            vec![rule("01", &["hello"], MatchingType::WordMatch, false)],
        );
        assert!(!resolve("completely unrelated", &set, 0.8).is_matched());
    }

    #[test]
    fn empty_rule_set_is_unmatched() {
        let set = RuleSet::assemble("owner-1", vec![]);
        assert!(!resolve("hello", &set, 0.8).is_matched());
    }
}
