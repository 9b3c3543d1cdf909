//! Property map for `Key: value` header blocks.
//!
//! Request and response headers are loaded into a map once and then read
//! through typed accessors that fall back to a caller-supplied default when a
//! key is absent or its value does not parse.

use std::collections::HashMap;
use std::str::FromStr;

/// A parsed header block.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    /// Creates an empty property map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `key<separator>value` lines. Lines without the separator are
    /// skipped and a later duplicate key wins.
    ///
    /// Keys and values are trimmed, so leading or trailing whitespace in a
    /// value (a file name such as `" a "`) is not preserved.
    pub fn load(text: &str, separator: char) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(separator) {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                values.insert(key.to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    /// Returns the parsed value for `key`, or `default` when the key is
    /// missing or the value does not parse as `T`.
    pub fn get<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.values.get(key) {
            Some(v) => v.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Returns the raw value for `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the raw value for `key`, or `default` when absent.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_string()
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of loaded keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was loaded.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_skips_lines_without_separator() {
        let props = Properties::load("OK\r\nCseq: 7\r\nStatus: 0\r\n\r\n", ':');
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("Cseq", -1i64), 7);
        assert_eq!(props.get("Status", -1i32), 0);
    }

    #[test]
    fn test_keys_with_spaces() {
        let props = Properties::load("Parent File-handle: 42\r\n", ':');
        assert_eq!(props.get("Parent File-handle", -1i64), 42);
    }

    #[test]
    fn test_value_keeps_inner_colons() {
        let props = Properties::load("New-path: /a:b/c\n", ':');
        assert_eq!(props.get_str("New-path"), Some("/a:b/c"));
    }

    #[test]
    fn test_defaults_on_missing_and_malformed() {
        let props = Properties::load("Size: lots\n", ':');
        assert_eq!(props.get("Size", 0i64), 0);
        assert_eq!(props.get("Missing", -1i64), -1);
        assert_eq!(props.get_string("Type", ""), "");
        assert!(!props.contains("Type"));
    }

    #[test]
    fn test_empty_value_is_present() {
        let props = Properties::load("Replicas:\r\n", ':');
        assert_eq!(props.get_str("Replicas"), Some(""));
    }

    proptest::proptest! {
        #[test]
        fn prop_load_recovers_every_pair(
            pairs in proptest::collection::btree_map("[A-Za-z][A-Za-z -]{0,15}[a-z]", "[!-~]{0,20}", 0..8)
        ) {
            let text: String = pairs
                .iter()
                .map(|(k, v)| format!("{}: {}\r\n", k, v))
                .collect();
            let props = Properties::load(&text, ':');
            proptest::prop_assert_eq!(props.len(), pairs.len());
            for (k, v) in &pairs {
                proptest::prop_assert_eq!(props.get_str(k), Some(v.as_str()));
            }
        }
    }
}
