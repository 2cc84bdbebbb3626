//! Division / category / product classification for documents.
//!
//! Scores a document against the configured Institution → Division →
//! Category → Products taxonomy using keyword hits over the filename, the
//! leading slice of document text, and the surface category from the
//! inventory. Low-confidence results leave the hierarchy attributes empty;
//! every retrieval path tolerates missing hierarchy.

use crate::config::HierarchyConfig;

/// The classifier's verdict for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HierarchyAssignment {
    pub division: Option<String>,
    pub category: Option<String>,
    pub products: Vec<String>,
}

impl HierarchyAssignment {
    pub fn is_empty(&self) -> bool {
        self.division.is_none() && self.category.is_none() && self.products.is_empty()
    }
}

/// Runs once per document. `text` should be the full extracted text; only
/// the first `config.classify_chars` characters are read.
pub fn classify_document(
    filename: &str,
    text: &str,
    surface_category: Option<&str>,
    config: &HierarchyConfig,
) -> HierarchyAssignment {
    if config.divisions.is_empty() {
        return HierarchyAssignment::default();
    }

    let head: String = text.chars().take(config.classify_chars).collect();
    let haystack = format!(
        "{} {} {}",
        filename.to_lowercase(),
        surface_category.unwrap_or("").to_lowercase(),
        head.to_lowercase()
    );

    let mut best: Option<(&crate::config::DivisionConfig, u32)> = None;
    for division in &config.divisions {
        let mut score = keyword_hits(&haystack, &division.keywords);
        // Category keywords count toward their division.
        for category in &division.categories {
            score += keyword_hits(&haystack, &category.keywords);
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ if score > 0 => best = Some((division, score)),
            _ => {}
        }
    }

    let Some((division, division_score)) = best else {
        return HierarchyAssignment::default();
    };
    if division_score < config.min_confidence {
        return HierarchyAssignment::default();
    }

    let mut best_category: Option<(&crate::config::CategoryConfig, u32)> = None;
    for category in &division.categories {
        let score = keyword_hits(&haystack, &category.keywords);
        match best_category {
            Some((_, best_score)) if score <= best_score => {}
            _ if score > 0 => best_category = Some((category, score)),
            _ => {}
        }
    }

    let mut products = Vec::new();
    if let Some((category, _)) = best_category {
        for product in &category.products {
            if haystack.contains(&product.to_lowercase()) {
                products.push(product.clone());
            }
        }
    }

    HierarchyAssignment {
        division: Some(division.code.clone()),
        category: best_category.map(|(c, _)| c.name.clone()),
        products,
    }
}

fn keyword_hits(haystack: &str, keywords: &[String]) -> u32 {
    keywords
        .iter()
        .filter(|kw| haystack.contains(&kw.to_lowercase()))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategoryConfig, DivisionConfig};

    fn taxonomy() -> HierarchyConfig {
        HierarchyConfig {
            institution: Some("WBC".into()),
            classify_chars: 5000,
            min_confidence: 2,
            divisions: vec![
                DivisionConfig {
                    code: "WIB".into(),
                    keywords: vec!["institutional".into(), "wholesale".into()],
                    categories: vec![CategoryConfig {
                        name: "markets".into(),
                        keywords: vec!["swap".into(), "hedging".into()],
                        products: vec!["interest rate swap".into(), "fx option".into()],
                    }],
                },
                DivisionConfig {
                    code: "RETAIL".into(),
                    keywords: vec!["personal".into(), "everyday".into()],
                    categories: vec![CategoryConfig {
                        name: "accounts".into(),
                        keywords: vec!["savings".into(), "transaction".into()],
                        products: vec!["savings account".into()],
                    }],
                },
            ],
        }
    }

    #[test]
    fn classifies_into_best_division_and_category() {
        let got = classify_document(
            "irs_pds.pdf",
            "This wholesale product is an interest rate swap used for hedging exposure.",
            Some("institutional"),
            &taxonomy(),
        );
        assert_eq!(got.division.as_deref(), Some("WIB"));
        assert_eq!(got.category.as_deref(), Some("markets"));
        assert_eq!(got.products, vec!["interest rate swap".to_string()]);
    }

    #[test]
    fn low_confidence_leaves_fields_empty() {
        let got = classify_document(
            "misc.pdf",
            "Completely unrelated content about gardening.",
            None,
            &taxonomy(),
        );
        assert!(got.is_empty());
    }

    #[test]
    fn single_weak_hit_is_below_threshold() {
        // One keyword hit < min_confidence of 2.
        let got = classify_document("doc.pdf", "a personal note", None, &taxonomy());
        assert!(got.is_empty());
    }

    #[test]
    fn empty_taxonomy_never_assigns() {
        let got = classify_document(
            "doc.pdf",
            "swap hedging institutional",
            None,
            &HierarchyConfig::default(),
        );
        assert!(got.is_empty());
    }
}
