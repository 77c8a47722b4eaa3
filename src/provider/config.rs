//! Flat key/value configuration for provider backends.

use std::collections::BTreeMap;

/// Flat string configuration map; every provider-specific tunable lives
/// here. Keys are conventionally `SCREAMING_SNAKE_CASE`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProviderConfig {
    values: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Builds a config from key/value pairs.
    #[must_use]
    pub fn from_map<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Builds a config from environment variables starting with `prefix`,
    /// with the prefix stripped.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self {
            values: std::env::vars()
                .filter_map(|(key, value)| {
                    key.strip_prefix(prefix)
                        .map(|stripped| (stripped.to_owned(), value))
                })
                .collect(),
        }
    }

    /// Returns `true` when `key` is present.
    #[must_use]
    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the value for `key`, or the empty string when absent.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map_or("", String::as_str)
    }
}
