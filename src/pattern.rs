use regex::Regex;
use serde::Deserialize;

/// Prefix that negates the remainder of a pattern source.
pub const NEGATE_PREFIX: &str = "_";

/// A compiled match expression used throughout the rule tree.
///
/// The empty source compiles to a pattern that matches every string. A source
/// beginning with `_` strips that sentinel and negates the remainder. Matching
/// is unanchored: the regex may match anywhere in the input unless the source
/// anchors it explicitly.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct Pattern {
    re: Regex,
    negate: bool,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, regex::Error> {
        let (source, negate) = match source.strip_prefix(NEGATE_PREFIX) {
            Some(rest) => (rest, true),
            None => (source, false),
        };
        Ok(Self {
            re: Regex::new(source)?,
            negate,
        })
    }

    pub fn matches(&self, s: &str) -> bool {
        self.re.is_match(s) != self.negate
    }
}

impl Default for Pattern {
    /// The always-match pattern, so an omitted rule field matches anything.
    fn default() -> Self {
        Self::compile("").expect("empty pattern is always valid")
    }
}

impl TryFrom<String> for Pattern {
    type Error = regex::Error;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::compile(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sources here must not start with the negation sentinel: the negation
    // test prefixes each entry with `_`, and double negation is unsupported.
    const TABLE: &[(&str, &str, bool)] = &[
        ("", "", true),
        ("", "x", true),
        ("", " ", true),
        ("", " x", true),
        ("abc", "abc", true),
        ("abc", "abcd", true),
        ("abc", "ab", false),
        (".*", "", true),
        (".*", "x", true),
        (".*", "xx", true),
        (".?", "", true),
        (".?", "xx", true),
        ("^Exists$", "Exists", true),
        ("^Exists$", "Exist", false),
        ("^Exists$", "Exists2", false),
        ("^$", "", true),
        ("^$", " ", false),
        ("^$", "a", false),
        ("^daemonset-", "daemonset-fluentd", true),
        ("^daemonset-", "pod-1", false),
    ];

    #[test]
    fn pattern_table() {
        for (expr, input, expected) in TABLE {
            let p = Pattern::compile(expr).unwrap();
            assert_eq!(
                p.matches(input),
                *expected,
                "expr={expr:?} input={input:?}"
            );
        }
    }

    #[test]
    fn negated_pattern_table() {
        for (expr, input, expected) in TABLE {
            let negated = format!("{NEGATE_PREFIX}{expr}");
            let p = Pattern::compile(&negated).unwrap();
            assert_eq!(
                p.matches(input),
                !*expected,
                "expr={negated:?} input={input:?}"
            );
        }
    }

    #[test]
    fn negation_round_trip() {
        for (expr, input, _) in TABLE {
            let plain = Pattern::compile(expr).unwrap();
            let negated = Pattern::compile(&format!("{NEGATE_PREFIX}{expr}")).unwrap();
            assert_eq!(plain.matches(input), !negated.matches(input));
        }
    }

    #[test]
    fn bare_sentinel_matches_nothing() {
        let p = Pattern::compile("_").unwrap();
        assert!(!p.matches(""));
        assert!(!p.matches("anything"));
    }

    #[test]
    fn default_matches_everything() {
        let p = Pattern::default();
        assert!(p.matches(""));
        assert!(p.matches("x"));
    }

    #[test]
    fn bad_regex_fails_to_compile() {
        assert!(Pattern::compile("[unclosed").is_err());
        assert!(Pattern::compile("_[unclosed").is_err());
    }
}
