//! Module descriptor metadata.
//!
//! Modules are addressed by a three-part path `category.module.function`.
//! The callable itself lives in `stepflow-core`; this module holds the
//! serializable parts shared with the CLI and validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a module path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModulePathError {
    #[error("module path '{path}' must have exactly three dot-separated segments, found {found}")]
    SegmentCount { path: String, found: usize },

    #[error("module path '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("module path '{path}' has invalid segment '{segment}'")]
    InvalidSegment { path: String, segment: String },
}

/// Parsed `category.module.function` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModulePath {
    pub category: String,
    pub module: String,
    pub function: String,
}

impl ModulePath {
    /// Parse a path, requiring exactly three non-empty segments made of
    /// ASCII alphanumerics, `_` or `-`.
    pub fn parse(path: &str) -> Result<Self, ModulePathError> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.len() != 3 {
            return Err(ModulePathError::SegmentCount {
                path: path.to_string(),
                found: parts.len(),
            });
        }
        for part in &parts {
            if part.is_empty() {
                return Err(ModulePathError::EmptySegment(path.to_string()));
            }
            if !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(ModulePathError::InvalidSegment {
                    path: path.to_string(),
                    segment: part.to_string(),
                });
            }
        }
        Ok(Self {
            category: parts[0].to_string(),
            module: parts[1].to_string(),
            function: parts[2].to_string(),
        })
    }
}

impl std::fmt::Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.category, self.module, self.function)
    }
}

impl std::str::FromStr for ModulePath {
    type Err = ModulePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// JSON type accepted by a module parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

/// One declared module parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: false,
            description: description.to_string(),
        }
    }
}

/// Display/listing view of a registered module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub path: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_path() {
        let path = ModulePath::parse("crm.contacts.get").unwrap();
        assert_eq!(path.category, "crm");
        assert_eq!(path.module, "contacts");
        assert_eq!(path.function, "get");
        assert_eq!(path.to_string(), "crm.contacts.get");
    }

    #[test]
    fn test_parse_rejects_wrong_segment_count() {
        let err = ModulePath::parse("crm.contacts").unwrap_err();
        assert!(matches!(err, ModulePathError::SegmentCount { found: 2, .. }));

        let err = ModulePath::parse("a.b.c.d").unwrap_err();
        assert!(matches!(err, ModulePathError::SegmentCount { found: 4, .. }));
    }

    #[test]
    fn test_parse_rejects_empty_segment() {
        let err = ModulePath::parse("crm..get").unwrap_err();
        assert!(matches!(err, ModulePathError::EmptySegment(_)));
        assert!(ModulePath::parse(".a.b").is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_characters() {
        let err = ModulePath::parse("crm.con tacts.get").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("con tacts"), "got: {msg}");
    }

    #[test]
    fn test_param_spec_serde_defaults() {
        let spec: ParamSpec = serde_json::from_str(r#"{"name":"url"}"#).unwrap();
        assert_eq!(spec.param_type, ParamType::Any);
        assert!(!spec.required);
    }
}
