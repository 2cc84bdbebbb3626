//! Rule-based entity extraction.
//!
//! Four passes over chunk text, in order: the configured product
//! abbreviation table, institution codes from the hierarchy config,
//! currency amounts, and capitalized multi-word terms. Output is a set of
//! `(canonical_text, type)` mentions per chunk — duplicates within a chunk
//! collapse here, cross-chunk uniqueness is enforced by the store's
//! entity upsert.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{Config, HierarchyConfig};
use crate::model::EntityType;

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\$[\d,]+(?:\.\d{2})?|\b\d{1,3}(?:,\d{3})+(?:\.\d+)?\b|\b\d+(?:\.\d+)?\s*(?:dollars?|aud|usd|nzd)\b")
            .unwrap()
    })
}

fn capitalized_term_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").unwrap())
}

/// Leading words that mark an ordinary sentence rather than a proper term.
const SENTENCE_STARTERS: &[&str] = &[
    "The", "This", "That", "These", "Those", "A", "An", "If", "In", "On", "For", "You", "Your",
    "We", "Our", "It", "Please", "See",
];

/// A canonicalized mention found in one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMention {
    /// Lowercased, trimmed.
    pub text: String,
    pub entity_type: EntityType,
}

/// Extractor configured from the product table and hierarchy codes.
pub struct EntityExtractor {
    /// abbreviation → canonical product name.
    products: BTreeMap<String, String>,
    /// Institution and division codes, lowercased.
    institution_codes: Vec<String>,
}

impl EntityExtractor {
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.products.clone(), &config.hierarchy)
    }

    pub fn new(products: BTreeMap<String, String>, hierarchy: &HierarchyConfig) -> Self {
        let mut institution_codes: Vec<String> = Vec::new();
        if let Some(inst) = &hierarchy.institution {
            institution_codes.push(inst.to_lowercase());
        }
        for division in &hierarchy.divisions {
            institution_codes.push(division.code.to_lowercase());
        }
        Self {
            products,
            institution_codes,
        }
    }

    /// Extracts the deduplicated mention set for one chunk of text.
    pub fn extract(&self, text: &str) -> Vec<EntityMention> {
        let lower = text.to_lowercase();
        let mut out: Vec<EntityMention> = Vec::new();
        let mut push = |text: String, entity_type: EntityType| {
            let text = text.trim().to_lowercase();
            if text.len() > 1 && !out.iter().any(|m| m.text == text) {
                out.push(EntityMention { text, entity_type });
            }
        };

        // Product abbreviations and canonical names.
        for (abbrev, canonical) in &self.products {
            if contains_word(&lower, abbrev) || lower.contains(canonical.as_str()) {
                push(canonical.clone(), EntityType::Product);
            }
        }

        // Institution codes.
        for code in &self.institution_codes {
            if contains_word(&lower, code) {
                push(code.clone(), EntityType::Institution);
            }
        }

        // Currency amounts.
        for m in amount_re().find_iter(text) {
            push(m.as_str().to_string(), EntityType::Amount);
        }

        // Capitalized multi-word terms. A leading sentence starter is
        // stripped rather than discarding the whole span ("The Quarterly
        // Review" still yields "quarterly review").
        for cap in capitalized_term_re().captures_iter(text) {
            let mut term = &cap[1];
            let first_word = term.split_whitespace().next().unwrap_or("");
            if SENTENCE_STARTERS.contains(&first_word) {
                term = term[first_word.len()..].trim_start();
                if !term.contains(' ') {
                    continue;
                }
            }
            if term.len() > 60 {
                continue;
            }
            push(term.to_string(), EntityType::Term);
        }

        out
    }
}

/// Word-boundary containment on lowercase text.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after = abs + needle.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + needle.len();
        if start >= haystack.len() {
            break;
        }
    }
    false
}
