//! Cache key helpers.
//!
//! Keys must be unique across every query in the gateway, and each query must
//! be able to map its keys back to payloads. Building keys as
//! `"{prefix}/{part}/{part}"` with a distinct prefix per query and parsing them
//! with the same prefix gives both properties.

use std::fmt::Display;
use std::str::FromStr;

/// Separator between key segments.
pub const SEPARATOR: char = '/';

/// Builder and parser for `/`-separated cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// `prefix/id`
    pub fn build(prefix: &str, id: &dyn Display) -> String {
        format!("{}{}{}", prefix, SEPARATOR, id)
    }

    /// Join arbitrary parts with the separator.
    pub fn build_composite(parts: &[&str]) -> String {
        parts.join("/")
    }

    /// The remainder of `key` after `prefix/`, or `None` if the key belongs to
    /// another prefix.
    pub fn strip_prefix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
        key.strip_prefix(prefix)?.strip_prefix(SEPARATOR)
    }

    /// Parse the single segment after `prefix/`.
    ///
    /// Returns `None` for foreign keys, keys with extra segments and ids that
    /// do not parse (`"license/01"` for numeric ids is rejected so that the
    /// key for a payload is unique).
    pub fn parse_id<T>(key: &str, prefix: &str) -> Option<T>
    where
        T: FromStr + Display,
    {
        let rest = Self::strip_prefix(key, prefix)?;
        if rest.is_empty() || rest.contains(SEPARATOR) {
            return None;
        }
        let id: T = rest.parse().ok()?;
        (id.to_string() == rest).then_some(id)
    }

    /// Split a key into its segments.
    pub fn parse(key: &str) -> Vec<&str> {
        key.split(SEPARATOR).collect()
    }
}
