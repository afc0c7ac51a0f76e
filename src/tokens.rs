//! Token Utilities
//!
//! Cheap lexical helpers shared by the classifier, the schema retriever and
//! the exemplar selector. Everything here is lowercase, ASCII-insensitive and
//! allocation-light; none of it tries to be a real NLP tokenizer.

use std::collections::BTreeSet;

lazy_static::lazy_static! {
    static ref STOP_WORDS: BTreeSet<&'static str> = [
        "a", "an", "the", "of", "in", "on", "for", "to", "and", "or", "by", "with",
        "is", "are", "was", "were", "be", "me", "my", "our", "we", "what", "which",
        "who", "how", "show", "list", "give", "get", "all", "from", "per", "each",
        "that", "this", "these", "those", "do", "does", "did", "it", "its", "as",
        "at", "than", "then", "there", "their", "please",
    ]
    .into_iter()
    .collect();
}

/// Lowercase words made of alphanumerics and underscores.
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Strip the most common English plural endings so `customers` meets `customer`.
pub fn stem(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 4 && (word.ends_with("ses") || word.ends_with("xes")) {
        word[..word.len() - 2].to_string()
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Content-bearing, stemmed tokens of a piece of text.
pub fn content_tokens(text: &str) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| !STOP_WORDS.contains(w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

/// Tokens of a schema identifier such as `order_items` or `orderDate`.
pub fn identifier_tokens(identifier: &str) -> BTreeSet<String> {
    let mut spaced = String::with_capacity(identifier.len() + 4);
    let mut prev_lower = false;
    for c in identifier.chars() {
        if c.is_uppercase() && prev_lower {
            spaced.push(' ');
        }
        prev_lower = c.is_lowercase();
        spaced.push(if c == '_' || c == '.' { ' ' } else { c });
    }
    words(&spaced).into_iter().map(|w| stem(&w)).collect()
}

/// Jaccard overlap between two token sets.
pub fn overlap_score(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    shared / union
}

/// Text normalized for phrase matching: lowercase words joined by single
/// spaces and padded so `" phrase "` lookups respect word boundaries.
pub fn phrase_haystack(text: &str) -> String {
    let joined = text
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-' || c == '\''))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!(" {} ", joined)
}

/// True when `phrase` occurs in a haystack built by [`phrase_haystack`].
pub fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.contains(&format!(" {} ", phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_plurals() {
        assert_eq!(stem("customers"), "customer");
        assert_eq!(stem("categories"), "category");
        assert_eq!(stem("addresses"), "address");
        assert_eq!(stem("class"), "class");
    }

    #[test]
    fn test_identifier_tokens_split_snake_and_camel() {
        let tokens = identifier_tokens("order_items");
        assert!(tokens.contains("order"));
        assert!(tokens.contains("item"));

        let tokens = identifier_tokens("orderDate");
        assert!(tokens.contains("order"));
        assert!(tokens.contains("date"));
    }

    #[test]
    fn test_phrase_matching_respects_word_boundaries() {
        let hay = phrase_haystack("Is this the highest total?");
        assert!(contains_phrase(&hay, "highest"));
        assert!(!contains_phrase(&hay, "hi"));
    }

    #[test]
    fn test_overlap_score() {
        let a = content_tokens("top customers by sales");
        let b = content_tokens("customers with the most sales");
        assert!(overlap_score(&a, &b) > 0.3);
        assert_eq!(overlap_score(&a, &BTreeSet::new()), 0.0);
    }
}
