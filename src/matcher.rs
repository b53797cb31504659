use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{MatchingType, Rule};

/// Small static thesaurus for synonym matching, keyed by lowercase word.
static SYNONYMS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let entries: &[(&str, &[&str])] = &[
        ("hello", &["hi", "hey", "howdy", "greetings"]),
        ("price", &["pricing", "cost", "costs", "fee", "fees", "rate"]),
        ("pricing", &["price", "cost", "costs", "fee", "fees"]),
        ("help", &["support", "assist", "assistance", "aid"]),
        ("buy", &["purchase", "order", "acquire"]),
        ("refund", &["return", "reimbursement", "chargeback"]),
        ("hours", &["schedule", "opening", "availability"]),
        ("shipping", &["delivery", "dispatch", "postage"]),
        ("problem", &["issue", "error", "bug", "fault"]),
        ("thanks", &["thank", "thx", "cheers"]),
        ("bye", &["goodbye", "farewell"]),
        ("cancel", &["terminate", "unsubscribe", "stop"]),
    ];
    entries.iter().copied().collect()
});

/// Case-insensitive whole-word containment: every character adjacent to the
/// needle occurrence must be non-alphanumeric. "cat" does not match
/// "concatenate".
fn contains_whole_word(message: &str, needle: &str) -> bool {
    let haystack = message.to_lowercase();
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }

    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        from = start + needle.chars().next().map(char::len_utf8).unwrap_or(1);
    }
    false
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Normalized edit-distance similarity in [0,1]. Identical strings score 1.0.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein(a, b) as f64;
    (1.0 - distance / longest as f64).clamp(0.0, 1.0)
}

/// Whole-word containment of any keyword. All-or-nothing: 1.0 or 0.0.
pub fn word_match(message: &str, keywords: &[String]) -> f64 {
    let hit = keywords
        .iter()
        .any(|keyword| contains_whole_word(message, keyword));
    if hit {
        1.0
    } else {
        0.0
    }
}

/// Best normalized similarity between any keyword and any whitespace token of
/// the message. Returns the raw score; the acceptance threshold is applied by
/// the resolver so the policy stays in one place.
pub fn fuzzy_match(message: &str, keywords: &[String]) -> f64 {
    let mut best: f64 = 0.0;
    for keyword in keywords {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            continue;
        }
        for token in message.split_whitespace() {
            let token: String = token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            best = best.max(similarity(&keyword, &token));
        }
    }
    best.clamp(0.0, 1.0)
}

/// Each keyword is compiled as a pattern and searched anywhere in the
/// message. A keyword that fails to compile is skipped; a bad pattern can
/// make a rule permanently non-matching but never fails resolution.
pub fn regex_match(message: &str, keywords: &[String]) -> f64 {
    for keyword in keywords {
        match Regex::new(keyword) {
            Ok(pattern) => {
                if pattern.is_match(message) {
                    return 1.0;
                }
            }
            Err(err) => {
                tracing::debug!(pattern = %keyword, error = %err, "skipping invalid regex keyword");
            }
        }
    }
    0.0
}

/// Whole-word containment of any keyword or any of its thesaurus synonyms.
pub fn synonym_match(message: &str, keywords: &[String]) -> f64 {
    for keyword in keywords {
        if contains_whole_word(message, keyword) {
            return 1.0;
        }
        let expansions = SYNONYMS
            .get(keyword.trim().to_lowercase().as_str())
            .copied()
            .unwrap_or_default();
        if expansions
            .iter()
            .any(|synonym| contains_whole_word(message, synonym))
        {
            return 1.0;
        }
    }
    0.0
}

/// Score one rule against a message using the rule's matching strategy.
pub fn score_rule(message: &str, rule: &Rule) -> f64 {
    if rule.keywords.is_empty() || message.trim().is_empty() {
        return 0.0;
    }
    match rule.matching_type {
        MatchingType::WordMatch => word_match(message, &rule.keywords),
        MatchingType::FuzzyMatch => fuzzy_match(message, &rule.keywords),
        MatchingType::Regex => regex_match(message, &rule.keywords),
        MatchingType::SynonymMatch => synonym_match(message, &rule.keywords),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn word_match_requires_word_boundaries() {
        assert_eq!(word_match("the cat sat", &kw(&["cat"])), 1.0);
        assert_eq!(word_match("please concatenate these", &kw(&["cat"])), 0.0);
        assert_eq!(word_match("cat", &kw(&["cat"])), 1.0);
        assert_eq!(word_match("cat!", &kw(&["cat"])), 1.0);
    }

    #[test]
    fn word_match_is_case_insensitive() {
        assert_eq!(word_match("HELLO there", &kw(&["hello"])), 1.0);
        assert_eq!(word_match("say Hello.", &kw(&["HELLO"])), 1.0);
    }

    #[test]
    fn word_match_supports_multiword_keywords() {
        assert_eq!(word_match("I want a real person now", &kw(&["real person"])), 1.0);
        assert_eq!(word_match("surreal personal", &kw(&["real person"])), 0.0);
    }

    #[test]
    fn fuzzy_match_scores_transpositions_above_threshold() {
        let score = fuzzy_match("what is your prcing", &kw(&["pricing"]));
        assert!(score > 0.8, "expected > 0.8, got {score}");
    }

    #[test]
    fn fuzzy_match_scores_garbage_near_zero() {
        let score = fuzzy_match("dog", &kw(&["pricing"]));
        assert!(score < 0.3, "expected near zero, got {score}");
    }

    #[test]
    fn fuzzy_match_identical_token_scores_one() {
        assert_eq!(fuzzy_match("pricing please", &kw(&["pricing"])), 1.0);
    }

    #[test]
    fn fuzzy_match_strips_punctuation_from_tokens() {
        assert_eq!(fuzzy_match("pricing?", &kw(&["pricing"])), 1.0);
    }

    #[test]
    fn regex_match_searches_anywhere() {
        assert_eq!(regex_match("order #12345 status", &kw(&[r"#\d+"])), 1.0);
        assert_eq!(regex_match("no digits here", &kw(&[r"\d+"])), 0.0);
    }

    #[test]
    fn regex_match_skips_invalid_patterns() {
        assert_eq!(regex_match("anything", &kw(&["("])), 0.0);
        // A bad pattern before a good one must not mask the good one.
        assert_eq!(regex_match("order 42", &kw(&["(", r"\d+"])), 1.0);
    }

    #[test]
    fn synonym_match_expands_keywords() {
        assert_eq!(synonym_match("hi there", &kw(&["hello"])), 1.0);
        assert_eq!(synonym_match("what does it cost", &kw(&["price"])), 1.0);
        assert_eq!(synonym_match("nothing relevant", &kw(&["hello"])), 0.0);
    }

    #[test]
    fn synonym_match_still_matches_the_keyword_itself() {
        assert_eq!(synonym_match("hello there", &kw(&["hello"])), 1.0);
    }

    #[test]
    fn empty_keywords_never_match() {
        assert_eq!(word_match("hello", &[]), 0.0);
        assert_eq!(fuzzy_match("hello", &[]), 0.0);
        assert_eq!(synonym_match("hello", &[]), 0.0);
    }
}
