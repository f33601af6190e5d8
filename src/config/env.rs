//! Dotenv-style environment reader with typed getters.
//!
//! Values come from the process environment plus an optional dotenv file;
//! the process environment wins on conflicting keys. Missing keys return
//! the caller's default unchanged, with no coercion applied to it.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

const DEFAULT_DOTENV_FILE: &str = ".env";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to read environment file: {0}")]
    Read(#[from] dotenvy::Error),
    #[error("missing required environment keys: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

/// Key/value source over process environment and a dotenv file.
#[derive(Debug, Default)]
pub struct EnvReader {
    values: HashMap<String, String>,
    required: Vec<String>,
}

impl EnvReader {
    /// Load from the process environment, merging a dotenv file underneath.
    ///
    /// When `dotenv_path` is `None`, `./.env` is used if it exists. A missing
    /// file is not an error; a malformed one is.
    pub fn load(dotenv_path: Option<&Path>) -> Result<Self, EnvError> {
        let mut values = HashMap::new();

        match dotenv_path {
            Some(path) => {
                for item in dotenvy::from_path_iter(path)? {
                    let (key, value) = item?;
                    values.insert(key, value);
                }
            }
            None => {
                let fallback = Path::new(DEFAULT_DOTENV_FILE);
                if fallback.exists() {
                    for item in dotenvy::from_path_iter(fallback)? {
                        let (key, value) = item?;
                        values.insert(key, value);
                    }
                }
            }
        }

        // Process environment wins over file values.
        for (key, value) in std::env::vars() {
            values.insert(key, value);
        }

        Ok(Self {
            values,
            required: Vec::new(),
        })
    }

    /// Build a reader from explicit pairs. Used by tests and embedding callers.
    pub fn from_iter<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            required: Vec::new(),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, raw, "environment value is not an integer, using default");
                default
            }),
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, raw, "environment value is not a float, using default");
                default
            }),
        }
    }

    /// Accepts `1/0`, `true/false`, `yes/no`, `on/off`, case-insensitively.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    warn!(key, raw, "environment value is not a boolean, using default");
                    default
                }
            },
        }
    }

    /// Comma-split list with each item trimmed; empty items are dropped.
    pub fn get_array(&self, key: &str, default: Vec<String>) -> Vec<String> {
        match self.get(key) {
            None => default,
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn get_json(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        match self.get(key) {
            None => default,
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                warn!(key, %err, "environment value is not valid JSON, using default");
                default
            }),
        }
    }

    /// Record keys that `validate` must find present.
    pub fn require<I, K>(&mut self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.required.extend(keys.into_iter().map(Into::into));
    }

    /// Check every required key at once.
    ///
    /// In strict mode a single error lists all missing keys. In non-strict
    /// (production) mode the failure is logged and boot continues degraded.
    pub fn validate(&self, strict: bool) -> Result<(), EnvError> {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|key| !self.has(key))
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        if strict {
            return Err(EnvError::MissingRequired(missing));
        }

        warn!(
            missing = missing.join(", "),
            "required environment keys are absent, continuing degraded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn reader() -> EnvReader {
        EnvReader::from_iter([
            ("APP_NAME", "vetrina"),
            ("APP_PORT", "8080"),
            ("APP_RATIO", "0.75"),
            ("APP_DEBUG", "Yes"),
            ("APP_TAGS", " rust, web , , cache "),
            ("APP_META", r#"{"owner": "nina", "year": 2025}"#),
            ("APP_BAD_INT", "eight"),
        ])
    }

    #[test]
    fn typed_getters_coerce_present_values() {
        let env = reader();
        assert_eq!(env.get_or("APP_NAME", "fallback"), "vetrina");
        assert_eq!(env.get_int("APP_PORT", 0), 8080);
        assert_eq!(env.get_float("APP_RATIO", 0.0), 0.75);
        assert!(env.get_bool("APP_DEBUG", false));
        assert_eq!(
            env.get_array("APP_TAGS", vec![]),
            vec!["rust".to_string(), "web".to_string(), "cache".to_string()]
        );
        assert_eq!(
            env.get_json("APP_META", serde_json::Value::Null)["owner"],
            "nina"
        );
    }

    #[test]
    fn missing_key_returns_default_unchanged() {
        let env = reader();
        assert_eq!(env.get_or("NOPE", "default"), "default");
        assert_eq!(env.get_int("NOPE", -3), -3);
        assert!(!env.get_bool("NOPE", false));
        assert_eq!(env.get_array("NOPE", vec!["x".to_string()]), vec!["x"]);
    }

    #[test]
    fn unparsable_value_falls_back_to_default() {
        let env = reader();
        assert_eq!(env.get_int("APP_BAD_INT", 42), 42);
        assert!(env.get_bool("APP_BAD_INT", true));
        assert_eq!(
            env.get_json("APP_BAD_INT", serde_json::json!([])),
            serde_json::json!([])
        );
    }

    #[test]
    fn validate_strict_lists_every_missing_key() {
        let mut env = reader();
        env.require(["APP_NAME", "APP_SECRET", "APP_DSN"]);

        let err = env.validate(true).expect_err("missing keys");
        match err {
            EnvError::MissingRequired(keys) => {
                assert_eq!(keys, vec!["APP_SECRET".to_string(), "APP_DSN".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_lax_logs_and_continues() {
        let mut env = reader();
        env.require(["APP_SECRET"]);
        assert!(env.validate(false).is_ok());
    }

    #[test]
    fn dotenv_file_is_merged_under_process_env() {
        let mut file = tempfile::NamedTempFile::new().expect("temp dotenv");
        writeln!(file, "VETRINA_DOTENV_ONLY=from-file").expect("write dotenv");
        writeln!(file, "VETRINA_DOTENV_QUOTED=\"hello world\"").expect("write dotenv");

        let env = EnvReader::load(Some(file.path())).expect("load dotenv");
        assert_eq!(env.get("VETRINA_DOTENV_ONLY"), Some("from-file"));
        assert_eq!(env.get("VETRINA_DOTENV_QUOTED"), Some("hello world"));
    }
}
