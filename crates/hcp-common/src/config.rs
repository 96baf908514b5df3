// SPDX-License-Identifier: MIT OR Apache-2.0
//! The JSON config world.
//!
//! Every HCP process is handed one JSON document (`HCP_CONFIG_FILE`) and
//! a scope path within it (`HCP_CONFIG_SCOPE`, default `"."`). All
//! configuration lookups are expressed as jq-style paths relative to the
//! scope, so a service config can be nested anywhere in a larger world
//! document and remain oblivious to its surroundings.

use hcp_json::{PathError, extract_path};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Name of the environment variable carrying the world file path.
pub const CONFIG_FILE_ENV: &str = "HCP_CONFIG_FILE";

/// Name of the environment variable carrying the current scope.
pub const CONFIG_SCOPE_ENV: &str = "HCP_CONFIG_SCOPE";

/// Errors from loading or traversing the config world.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `HCP_CONFIG_FILE` is not set.
    #[error("no {CONFIG_FILE_ENV} in the environment")]
    NoConfigFile,

    /// The world file could not be read.
    #[error("failed to read config file '{path}'")]
    Read {
        /// Path that was requested.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The world file is not valid JSON.
    #[error("config file '{path}' is not valid JSON")]
    Parse {
        /// Path that was requested.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A config path was malformed.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A required config field is missing.
    #[error("missing config field: {0}")]
    Missing(String),

    /// A config field has the wrong JSON type.
    #[error("config field {path} has the wrong type (wanted {wanted})")]
    WrongType {
        /// Scope-relative path of the field.
        path: String,
        /// Expected JSON type.
        wanted: &'static str,
    },
}

/// A loaded config world plus the current scope within it.
#[derive(Debug, Clone)]
pub struct Config {
    world: Value,
    scope: String,
}

impl Config {
    /// Load the world named by `HCP_CONFIG_FILE`, scoped by
    /// `HCP_CONFIG_SCOPE` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_FILE_ENV).map_err(|_| ConfigError::NoConfigFile)?;
        let scope = std::env::var(CONFIG_SCOPE_ENV).unwrap_or_else(|_| ".".to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.scope_set(&scope)?;
        Ok(cfg)
    }

    /// Load a world file with scope `"."`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let world = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            world,
            scope: ".".to_string(),
        })
    }

    /// Build a config from an in-memory world (tests, embedded configs).
    pub fn from_value(world: Value) -> Self {
        Self {
            world,
            scope: ".".to_string(),
        }
    }

    /// The current scope path.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Re-anchor the scope at an absolute path within the world. The
    /// target must exist.
    pub fn scope_set(&mut self, path: &str) -> Result<(), ConfigError> {
        let path = normalize(path);
        if extract_path(&self.world, &path)?.is_none() {
            return Err(ConfigError::Missing(path));
        }
        self.scope = path;
        Ok(())
    }

    /// Narrow the scope by a relative sub-path.
    pub fn scope_shrink(&mut self, sub: &str) -> Result<(), ConfigError> {
        let full = self.resolve(sub);
        self.scope_set(&full)
    }

    fn resolve(&self, path: &str) -> String {
        let path = normalize(path);
        if self.scope == "." {
            path
        } else if path == "." {
            self.scope.clone()
        } else {
            format!("{}{}", self.scope, path)
        }
    }

    /// Extract the value at a scope-relative path, `None` on a miss.
    pub fn extract(&self, path: &str) -> Result<Option<Value>, ConfigError> {
        let full = self.resolve(path);
        Ok(extract_path(&self.world, &full)?.cloned())
    }

    /// Extract a value that must exist.
    pub fn extract_must(&self, path: &str) -> Result<Value, ConfigError> {
        self.extract(path)?
            .ok_or_else(|| ConfigError::Missing(self.resolve(path)))
    }

    /// Extract a value, falling back to a default on a miss.
    pub fn extract_or(&self, path: &str, default: Value) -> Result<Value, ConfigError> {
        Ok(self.extract(path)?.unwrap_or(default))
    }

    /// Extract an optional string field, erroring on a non-string.
    pub fn extract_str(&self, path: &str) -> Result<Option<String>, ConfigError> {
        match self.extract(path)? {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ConfigError::WrongType {
                path: self.resolve(path),
                wanted: "string",
            }),
        }
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('.') {
        path.to_string()
    } else {
        format!(".{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn world() -> Value {
        json!({
            "id": "emgmt",
            "enrollsvc": {
                "state": "/srv/enroll",
                "db_add": {"preclient": {}, "postclient": {}}
            }
        })
    }

    #[test]
    fn extracts_relative_to_scope() {
        let mut cfg = Config::from_value(world());
        assert_eq!(cfg.extract_must(".id").unwrap(), json!("emgmt"));
        cfg.scope_shrink("enrollsvc").unwrap();
        assert_eq!(cfg.extract_must(".state").unwrap(), json!("/srv/enroll"));
        assert_eq!(cfg.scope(), ".enrollsvc");
    }

    #[test]
    fn paths_without_leading_dot_are_accepted() {
        let cfg = Config::from_value(world());
        assert_eq!(cfg.extract_must("id").unwrap(), json!("emgmt"));
    }

    #[test]
    fn scope_must_exist() {
        let mut cfg = Config::from_value(world());
        assert!(cfg.scope_set(".nope").is_err());
    }

    #[test]
    fn missing_fields_and_wrong_types_are_distinct() {
        let cfg = Config::from_value(world());
        assert!(matches!(
            cfg.extract_must(".missing"),
            Err(ConfigError::Missing(_))
        ));
        assert!(matches!(
            cfg.extract_str(".enrollsvc"),
            Err(ConfigError::WrongType { .. })
        ));
        assert_eq!(cfg.extract(".missing").unwrap(), None);
        assert_eq!(
            cfg.extract_or(".missing", json!(41)).unwrap(),
            json!(41)
        );
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", world()).unwrap();
        let cfg = Config::from_file(f.path()).unwrap();
        assert_eq!(cfg.extract_must(".id").unwrap(), json!("emgmt"));
    }
}
