// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed schema for change-stream events.
//!
//! Transports hand over documents as plain JSON field maps. Anything the
//! engine relies on is validated here, at the stream boundary, so a bad
//! document turns into a [`DocumentError`] for one event instead of failing
//! deeper in reconciliation.

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DocumentError;
use crate::version::parse_version;

/// Kind of change reported for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// One document change inside a delivered batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub change_type: ChangeType,
    /// Document id within its collection (service name or version string).
    pub id: String,
    /// Plain JSON fields of the document after the change.
    pub fields: Map<String, Value>,
}

impl DocumentChange {
    pub fn new(change_type: ChangeType, id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            change_type,
            id: id.into(),
            fields,
        }
    }

    pub fn added(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self::new(ChangeType::Added, id, fields)
    }

    pub fn modified(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self::new(ChangeType::Modified, id, fields)
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self::new(ChangeType::Removed, id, Map::new())
    }
}

/// An installed-services document: `{version: string, env?: object}`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledService {
    pub name: String,
    pub version: Version,
    /// Opaque environment metadata attached by the installer.
    pub env: Map<String, Value>,
}

impl InstalledService {
    pub fn from_change(change: &DocumentChange) -> Result<Self, DocumentError> {
        Self::from_fields(&change.id, &change.fields)
    }

    pub fn from_fields(name: &str, fields: &Map<String, Value>) -> Result<Self, DocumentError> {
        let raw_version = match fields.get("version") {
            None | Some(Value::Null) => {
                return Err(DocumentError::MissingField {
                    id: name.to_string(),
                    field: "version",
                })
            }
            Some(Value::String(version)) => version,
            Some(other) => {
                return Err(DocumentError::InvalidField {
                    id: name.to_string(),
                    field: "version",
                    reason: format!("expected a string, found {}", json_kind(other)),
                })
            }
        };
        let version = parse_version(raw_version).map_err(|err| DocumentError::InvalidField {
            id: name.to_string(),
            field: "version",
            reason: err.to_string(),
        })?;
        let env = match fields.get("env") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(env)) => env.clone(),
            Some(other) => {
                return Err(DocumentError::InvalidField {
                    id: name.to_string(),
                    field: "env",
                    reason: format!("expected an object, found {}", json_kind(other)),
                })
            }
        };
        Ok(Self {
            name: name.to_string(),
            version,
            env,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
