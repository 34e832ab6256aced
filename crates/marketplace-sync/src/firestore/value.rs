// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion between Firestore REST typed values and plain JSON.

use serde::Deserialize;
use serde_json::{json, Map, Number, Value};

use crate::transport::UpdatableServices;

/// A document as returned by the Firestore REST API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Full resource name, ending in `/{collection}/{id}`.
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub update_time: Option<String>,
}

impl Document {
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(self.name.as_str())
    }

    /// Fields converted to plain JSON.
    pub fn plain_fields(&self) -> Result<Map<String, Value>, String> {
        decode_fields(&self.fields)
    }
}

/// Converts a `fields` object of typed values.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    fields
        .iter()
        .map(|(key, value)| {
            decode_value(value)
                .map(|decoded| (key.clone(), decoded))
                .map_err(|reason| format!("{key}: {reason}"))
        })
        .collect()
}

/// Converts one typed value such as `{"stringValue": "x"}` to plain JSON.
pub fn decode_value(value: &Value) -> Result<Value, String> {
    let Some(object) = value.as_object() else {
        return Err(format!("expected a typed value object, found {value}"));
    };
    let Some((kind, inner)) = object.iter().next() else {
        return Err("empty typed value".to_string());
    };
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| format!("invalid booleanValue {inner}")),
        "integerValue" => match inner {
            // int64 values travel as decimal strings.
            Value::String(raw) => raw
                .parse::<i64>()
                .map(|int| Value::Number(int.into()))
                .map_err(|err| format!("invalid integerValue {raw:?}: {err}")),
            Value::Number(number) => Ok(Value::Number(number.clone())),
            other => Err(format!("invalid integerValue {other}")),
        },
        "doubleValue" => match inner {
            Value::Number(number) => Ok(Value::Number(number.clone())),
            // NaN and the infinities have no JSON number form.
            Value::String(raw) => Ok(raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map_or_else(|| Value::String(raw.clone()), Value::Number)),
            other => Err(format!("invalid doubleValue {other}")),
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|text| Value::String(text.to_string()))
            .ok_or_else(|| format!("invalid {kind} {inner}")),
        "geoPointValue" => Ok(json!({
            "latitude": inner.get("latitude").cloned().unwrap_or(json!(0.0)),
            "longitude": inner.get("longitude").cloned().unwrap_or(json!(0.0)),
        })),
        "mapValue" => match inner.get("fields") {
            None => Ok(Value::Object(Map::new())),
            Some(Value::Object(fields)) => decode_fields(fields).map(Value::Object),
            Some(other) => Err(format!("invalid mapValue fields {other}")),
        },
        "arrayValue" => match inner.get("values") {
            None => Ok(Value::Array(Vec::new())),
            Some(Value::Array(values)) => values
                .iter()
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Some(other) => Err(format!("invalid arrayValue values {other}")),
        },
        other => Err(format!("unsupported value type `{other}`")),
    }
}

/// Encodes the index as a `mapValue` of `stringValue`s.
pub fn encode_string_map(services: &UpdatableServices) -> Value {
    let fields: Map<String, Value> = services
        .iter()
        .map(|(name, version)| (name.clone(), json!({ "stringValue": version })))
        .collect();
    json!({ "mapValue": { "fields": fields } })
}
