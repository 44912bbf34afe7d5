//! Decimal, time and string helpers used across the engine

pub mod dates;
pub mod decimal;
pub mod formula;

use std::collections::BTreeMap;

use crate::constants::{ANY, CONCATENATED_KEY_SEP};

/// Set of identifiers with polarity: `true` includes, `false` excludes
pub type StringMap = BTreeMap<String, bool>;

/// Build an including string map from a list of identifiers
///
/// Identifiers prefixed with `!` are stored as exclusions.
///
/// # Example
///
/// ```
/// use apolo_core::utils::string_map;
///
/// let m = string_map(&["NAT", "!RET"]);
/// assert_eq!(m.get("NAT"), Some(&true));
/// assert_eq!(m.get("RET"), Some(&false));
/// ```
pub fn string_map<S: AsRef<str>>(items: &[S]) -> StringMap {
    items
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('!') {
            Some(excluded) => (excluded.to_string(), false),
            None => (s.to_string(), true),
        })
        .collect()
}

/// Parse a separator delimited list into a string map
pub fn string_map_from_str(s: &str, sep: char) -> StringMap {
    let items: Vec<&str> = s.split(sep).collect();
    string_map(&items)
}

/// True when the map is empty or carries the `*any` wildcard
pub fn is_unrestricted(map: &StringMap) -> bool {
    map.is_empty() || map.get(ANY).copied().unwrap_or(false)
}

/// True when `key` is explicitly included
pub fn includes(map: &StringMap, key: &str) -> bool {
    map.get(key).copied().unwrap_or(false)
}

/// Included identifiers in key order
pub fn included_keys(map: &StringMap) -> Vec<String> {
    map.iter()
        .filter(|(_, included)| **included)
        .map(|(k, _)| k.clone())
        .collect()
}

/// Join identifier parts with the standard separator
pub fn concat_key(parts: &[&str]) -> String {
    parts.join(CONCATENATED_KEY_SEP)
}

/// Generate a new unique identifier
pub fn gen_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Prefixes of `number` from longest down to `min_len` characters
///
/// # Example
///
/// ```
/// use apolo_core::utils::split_prefix;
///
/// assert_eq!(split_prefix("0723", 2), vec!["0723", "072", "07"]);
/// ```
pub fn split_prefix(number: &str, min_len: usize) -> Vec<&str> {
    let boundaries: Vec<usize> = number
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .collect();
    boundaries
        .iter()
        .enumerate()
        .rev()
        .filter(|(count, _)| count + 1 >= min_len.max(1))
        .map(|(_, end)| &number[..*end])
        .collect()
}
