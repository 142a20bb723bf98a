//! Object payloads moved through the pipeline

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Marker of payloads the loader does not materialize
pub const RAW_ENCODING_MARKER: &str = "Objects.Other.RawEncoding";

/// A downloaded object: a JSON object carrying at least a string `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base {
    /// Object id
    pub id: String,
    /// Type tag of the object, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speckle_type: Option<String>,
    /// Ids of every descendant with its depth below this object
    #[serde(rename = "__closure__", default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<BTreeMap<String, u64>>,
    /// All remaining fields, preserved as sent
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Base {
    /// Interpret a parsed JSON value as a base
    ///
    /// Fails with [`Error::NotABase`] unless the value is an object with a
    /// string `id`.
    pub fn from_value(base_id: &str, value: Value) -> Result<Self> {
        let has_id = value.get("id").map(Value::is_string).unwrap_or(false);
        if !has_id {
            return Err(Error::NotABase(base_id.to_string()));
        }
        serde_json::from_value(value).map_err(|_| Error::NotABase(base_id.to_string()))
    }
}

/// An object keyed by id, or a placeholder when the object was not found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Id the object was requested by
    pub base_id: String,
    /// The object; `None` marks a placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Base>,
    /// Size of the raw payload in bytes, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl Item {
    /// Wrap a base under its own id
    pub fn new(base: Base) -> Self {
        Self {
            base_id: base.id.clone(),
            base: Some(base),
            size: None,
        }
    }

    /// Placeholder for an id that was requested but not found
    pub fn placeholder(base_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            base: None,
            size: None,
        }
    }

    /// Whether this item carries no object
    pub fn is_placeholder(&self) -> bool {
        self.base.is_none()
    }

    /// Parse a JSON payload downloaded for `base_id`
    pub fn parse(base_id: &str, json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json).map_err(|e| Error::InvalidJson {
            base_id: base_id.to_string(),
            message: e.to_string(),
        })?;
        let base = Base::from_value(base_id, value)?;

        Ok(Self {
            base_id: base_id.to_string(),
            base: Some(base),
            size: Some(json.len()),
        })
    }
}
