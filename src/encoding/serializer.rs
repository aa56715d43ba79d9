// src/encoding/serializer.rs

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{PubSubError, Result};

/// Converts typed values to and from a text encoding.
///
/// The provider consults the serializer only for non-text messages; plain
/// strings never reach it. Implementations should report failures as
/// [`PubSubError::Encode`] / [`PubSubError::Decode`].
pub trait TextSerializer: Send + Sync + 'static {
    /// Render `value` as text.
    fn serialize<T>(&self, value: &T) -> Result<String>
    where
        T: Serialize + ?Sized;

    /// Parse `text` into a `T`.
    fn deserialize<T>(&self, text: &str) -> Result<T>
    where
        T: DeserializeOwned;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl TextSerializer for JsonSerializer {
    fn serialize<T>(&self, value: &T) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_string(value).map_err(|err| PubSubError::Encode {
            type_name: std::any::type_name::<T>(),
            reason: err.to_string(),
        })
    }

    fn deserialize<T>(&self, text: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_str(text).map_err(|err| PubSubError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: err.to_string(),
        })
    }
}
