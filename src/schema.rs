//! Schema validation for payloads entering the pipeline from outside.
//!
//! Schemas are JSON Schema documents compiled with the `jsonschema` crate and
//! kept in a [`SchemaRegistry`] under a name. A shared document whose
//! top-level `definitions` object holds several schemas registers each
//! definition under its own name, with `#/definitions/...` references
//! between them still resolving.
//!
//! Validation is a pure check: it reports every violated constraint and
//! leaves it to the caller to drop, retry or dead-letter the message.

use jsonschema::Validator;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the built-in metadata message schema.
pub const METADATA_SCHEMA: &str = "metadata";

const BUILTIN_METADATA_SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "id": { "type": "string", "minLength": 1 },
        "attributeName": { "type": "string", "enum": ["Caption", "Date", "Photographer"] },
        "attributeValue": { "type": "string" }
    },
    "required": ["id", "attributeName", "attributeValue"]
}"#;

/// A single violated constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON pointer of the offending value (`/` is the root)
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from schema registration and validation.
#[derive(Error, Debug)]
pub enum SchemaFailure {
    #[error("payload violates schema '{schema}': {}", format_violations(.violations))]
    Violations {
        schema: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("unknown schema '{0}'")]
    UnknownSchema(String),

    #[error("invalid schema document '{name}': {reason}")]
    InvalidDocument { name: String, reason: String },

    #[error("failed to read schema: {0}")]
    Io(#[from] std::io::Error),
}

impl SchemaFailure {
    /// Violations reported, empty for non-validation failures.
    pub fn violations(&self) -> &[SchemaViolation] {
        match self {
            SchemaFailure::Violations { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Named, compiled schema documents.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Validator>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SchemaRegistry").field("schemas", &names).finish()
    }
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in [`METADATA_SCHEMA`].
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register_str(METADATA_SCHEMA, BUILTIN_METADATA_SCHEMA)
            .expect("built-in metadata schema is valid");
        registry
    }

    /// Compile and register (or replace) a schema document under `name`.
    pub fn register(&mut self, name: impl Into<String>, document: &Value) -> Result<(), SchemaFailure> {
        let name = name.into();
        let validator = jsonschema::validator_for(document).map_err(|e| SchemaFailure::InvalidDocument {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        debug!(schema = %name, "Registered schema");
        self.schemas.insert(name, validator);
        Ok(())
    }

    /// Register a schema from its JSON text.
    pub fn register_str(&mut self, name: impl Into<String>, document: &str) -> Result<(), SchemaFailure> {
        let name = name.into();
        let value: Value = serde_json::from_str(document).map_err(|e| SchemaFailure::InvalidDocument {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        self.register(name, &value)
    }

    /// Load every `*.json` document in `dir`.
    ///
    /// A document with a top-level `definitions` object registers each
    /// definition under its own name; any other document registers under
    /// its file stem. Returns the number of schemas registered.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize, SchemaFailure> {
        let dir = dir.as_ref();
        let mut loaded = 0;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let content = fs::read_to_string(&path)?;
            let document: Value = serde_json::from_str(&content).map_err(|e| SchemaFailure::InvalidDocument {
                name: stem.clone(),
                reason: e.to_string(),
            })?;

            let names: Vec<String> = match document.get("definitions").and_then(Value::as_object) {
                Some(definitions) => definitions.keys().cloned().collect(),
                None => {
                    self.register(stem, &document)?;
                    loaded += 1;
                    continue;
                }
            };

            for name in names {
                self.register(name.clone(), &definition_root(&document, &name))?;
                loaded += 1;
            }
        }

        info!(dir = %dir.display(), schemas = loaded, "Loaded schema documents");
        Ok(loaded)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Check `payload` against the schema registered as `name`.
    ///
    /// Violations are sorted by path.
    pub fn validate(&self, payload: &Value, name: &str) -> Result<(), SchemaFailure> {
        let validator = self
            .schemas
            .get(name)
            .ok_or_else(|| SchemaFailure::UnknownSchema(name.to_string()))?;

        let mut violations: Vec<SchemaViolation> = validator
            .iter_errors(payload)
            .map(|error| {
                let pointer = error.instance_path.to_string();
                SchemaViolation {
                    path: if pointer.is_empty() { "/".to_string() } else { pointer },
                    message: error.to_string(),
                }
            })
            .collect();

        if violations.is_empty() {
            return Ok(());
        }

        violations.sort_by(|a, b| a.path.cmp(&b.path));
        Err(SchemaFailure::Violations {
            schema: name.to_string(),
            violations,
        })
    }
}

/// The shared `document` rooted at one of its definitions, so references to
/// sibling definitions keep resolving.
fn definition_root(document: &Value, name: &str) -> Value {
    let pointer = name.replace('~', "~0").replace('/', "~1");
    let mut root = json!({
        "$ref": format!("#/definitions/{}", pointer),
        "definitions": document["definitions"].clone(),
    });
    if let Some(dialect) = document.get("$schema") {
        root["$schema"] = dialect.clone();
    }
    root
}
