//! Node configuration lookup.
//!
//! Every configuration key (`PS_ROLE`, `PS_SCHEDULER_URI`, ...) is resolved
//! against an in-process table first and the process environment second, so
//! several nodes with different configurations can coexist inside one
//! process (which is how the integration tests spin up whole clusters).

use std::collections::HashMap;

use crate::utils::PsError;

/// Per-node configuration table layered over the process environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    table: HashMap<String, String>,
}

impl Environment {
    /// Creates an empty table; every lookup falls through to `std::env`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table from `(key, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Environment {
            table: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Sets one key in the in-process table.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.table.insert(key.into(), value.into());
    }

    /// Looks a key up, in-process table first, process env second.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.table.get(key) {
            return Some(v.clone());
        }
        std::env::var(key).ok()
    }

    /// Looks a key up, substituting a default when absent.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.into())
    }

    /// Looks a required key up; absence is a configuration error.
    pub fn get_or_fail(&self, key: &str) -> Result<String, PsError> {
        match self.get(key) {
            Some(v) => Ok(v),
            None => logged_err!("required config key '{}' not set", key),
        }
    }

    /// Integer lookup; absent keys read as 0, malformed values error out.
    pub fn get_int(&self, key: &str) -> Result<i32, PsError> {
        self.get_int_or(key, 0)
    }

    /// Integer lookup with an explicit default for absent keys.
    pub fn get_int_or(&self, key: &str, default: i32) -> Result<i32, PsError> {
        match self.get(key) {
            Some(v) => v.parse::<i32>().map_err(|e| {
                PsError(format!("config key '{}' = '{}': {}", key, v, e))
            }),
            None => Ok(default),
        }
    }

    /// Integer lookup for a required key.
    pub fn get_int_or_fail(&self, key: &str) -> Result<i32, PsError> {
        let v = self.get_or_fail(key)?;
        v.parse::<i32>()
            .map_err(|e| PsError(format!("config key '{}' = '{}': {}", key, v, e)))
    }
}

#[cfg(test)]
mod env_tests {
    use super::*;

    #[test]
    fn table_beats_process_env() {
        std::env::set_var("PSKIT_TEST_KEY", "from_process");
        let mut env = Environment::new();
        assert_eq!(env.get("PSKIT_TEST_KEY").unwrap(), "from_process");
        env.insert("PSKIT_TEST_KEY", "from_table");
        assert_eq!(env.get("PSKIT_TEST_KEY").unwrap(), "from_table");
        std::env::remove_var("PSKIT_TEST_KEY");
    }

    #[test]
    fn int_parsing() {
        let env = Environment::from_pairs([("A", "42"), ("B", "nope")]);
        assert_eq!(env.get_int("A").unwrap(), 42);
        assert_eq!(env.get_int("MISSING").unwrap(), 0);
        assert_eq!(env.get_int_or("MISSING", 7).unwrap(), 7);
        assert!(env.get_int("B").is_err());
    }

    #[test]
    fn required_key_missing() {
        let env = Environment::new();
        assert!(env.get_or_fail("PSKIT_SURELY_UNSET").is_err());
    }
}
