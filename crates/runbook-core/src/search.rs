//! Search-term normalization and normalized substring matching.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Folds case and strips diacritics so that `"Ziggürat"` and `"ziggurat"`
/// compare equal. Idempotent.
#[must_use]
pub fn normalize(value: &str) -> String {
    value
        .to_lowercase()
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .nfc()
        .collect()
}

/// Substring containment after normalization. Not fuzzy: `"sbsm"` does not
/// match `"stapler battery shotgun mouse"`.
#[must_use]
pub fn matches(haystack: &str, term: &str) -> bool {
    normalize(haystack).contains(&normalize(term))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn diacritics_and_case_fold_together() {
        assert_eq!(normalize("Ziggürat"), normalize("ziggurat"));
        assert_eq!(normalize("ÉCOLE"), "ecole");
        assert!(matches("Crème Brûlée incident", "creme brulee"));
    }

    #[test]
    fn acronyms_do_not_match() {
        assert!(!matches("stapler battery shotgun mouse", "sbsm"));
        assert!(matches("stapler battery shotgun mouse", "battery shot"));
    }

    #[test]
    fn decomposed_input_matches_precomposed() {
        assert_eq!(normalize("Zigg\u{0075}\u{0308}rat"), normalize("Ziggürat"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn normalize_is_idempotent(value in "[a-zA-Z0-9 àáâäçèéêëìíîïñòóôöùúûüÀÉÖÜßøæ\u{0301}\u{0308}]{0,24}") {
            let once = normalize(&value);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn every_string_matches_itself(value in "[a-zA-Z àéöü]{0,16}") {
            prop_assert!(matches(&value, &value));
        }
    }
}
