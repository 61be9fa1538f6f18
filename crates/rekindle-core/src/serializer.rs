// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pluggable payload serialization.
//!
//! The core never looks inside parameters, results or messages. Values are
//! converted to `serde_json::Value` and handed to a [`Serializer`], which owns
//! the on-store representation.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::types::StoredPayload;

/// Converts values to and from their stored representation.
pub trait Serializer: Send + Sync {
    /// Encode a value tagged with `type_name`.
    fn serialize_value(&self, value: serde_json::Value, type_name: &str) -> Result<StoredPayload>;

    /// Decode a previously stored payload.
    fn deserialize_value(&self, payload: &StoredPayload) -> Result<serde_json::Value>;
}

/// Plain JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_value(&self, value: serde_json::Value, type_name: &str) -> Result<StoredPayload> {
        Ok(StoredPayload::new(serde_json::to_string(&value)?, type_name))
    }

    fn deserialize_value(&self, payload: &StoredPayload) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&payload.data)?)
    }
}

impl<'a> dyn Serializer + 'a {
    /// Serialize a typed value, tagging it with its Rust type name.
    pub fn to_payload<T: Serialize>(&self, value: &T) -> Result<StoredPayload> {
        let json = serde_json::to_value(value)?;
        self.serialize_value(json, std::any::type_name::<T>())
    }

    /// Deserialize a stored payload into a typed value.
    pub fn from_payload<T: DeserializeOwned>(&self, payload: &StoredPayload) -> Result<T> {
        let json = self.deserialize_value(payload)?;
        Ok(serde_json::from_value(json)?)
    }
}
