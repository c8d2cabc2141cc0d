//! Body refinement used to strip dynamic content from not-found pages.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").expect("invalid non-word regex"));

/// Splits `text` on runs of non-word characters.
pub fn words(text: &str) -> impl Iterator<Item = &str> {
    NON_WORD.split(text).filter(|word| !word.is_empty())
}

/// Keeps the words of `reference` that also occur in `other`, in reference
/// order. Identical bodies refine to themselves.
pub fn refine(reference: &str, other: &str) -> String {
    if reference == other {
        return reference.to_string();
    }
    let present: HashSet<&str> = words(other).collect();
    // Space-joined so adjacent words cannot merge into a different diff.
    words(reference)
        .filter(|word| present.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

pub fn word_hashes(text: &str) -> HashSet<u64> {
    words(text).map(hash_text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bodies_refine_to_themselves() {
        let body = "<html>Not found, sorry!</html>";
        assert_eq!(refine(body, body), body);
    }

    #[test]
    fn keeps_common_words_in_reference_order() {
        let reference = "Page /abc123 was not found on this server";
        let other = "server: page /zzz999 not found";
        assert_eq!(refine(reference, other), "not found server");
    }

    #[test]
    fn word_boundaries_survive_refinement() {
        let joined = refine("ab c x", "ab c");
        let split = refine("a bc x", "a bc");
        assert_eq!(joined, "ab c");
        assert_ne!(hash_text(&joined), hash_text(&split));
    }

    #[test]
    fn word_hashes_ignore_punctuation_and_duplicates() {
        let hashes = word_hashes("a, b; a!! c");
        assert_eq!(hashes.len(), 3);
        assert!(hashes.contains(&hash_text("b")));
    }
}
