// src/encoding/mod.rs

//! Encoding policy.
//!
//! Decides how a typed message becomes a wire payload and back. Text is the
//! common case and travels verbatim; every other type goes through the
//! provider's [`TextSerializer`]. The decision is made once per call by
//! [`PayloadKind::of`] and applies identically to every broker.
//!
//! Wire payloads are always UTF-8 text, whichever branch produced them.

mod serializer;

pub use serializer::{JsonSerializer, TextSerializer};

use std::any::{Any, TypeId};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{PubSubError, Result};

/// How a message of a given type is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Raw text, no serializer involved.
    Text,
    /// Text produced by the serializer.
    Encoded,
}

impl PayloadKind {
    /// Resolve the payload kind for `T`.
    ///
    /// `String` and `&'static str` are text; everything else is encoded.
    pub fn of<T: ?Sized + 'static>() -> Self {
        let id = TypeId::of::<T>();
        if id == TypeId::of::<String>() || id == TypeId::of::<&'static str>() {
            PayloadKind::Text
        } else {
            PayloadKind::Encoded
        }
    }
}

/// Render `message` into wire bytes.
pub(crate) fn encode<T, S>(message: T, serializer: &S) -> Result<Bytes>
where
    T: Serialize + 'static,
    S: TextSerializer,
{
    // ---
    match PayloadKind::of::<T>() {
        PayloadKind::Text => {
            let boxed: Box<dyn Any> = Box::new(message);
            let boxed = match boxed.downcast::<String>() {
                Ok(text) => return Ok(Bytes::from(*text)),
                Err(other) => other,
            };
            match boxed.downcast::<&'static str>() {
                Ok(text) => Ok(Bytes::from_static(text.as_bytes())),
                Err(_) => Err(PubSubError::Encode {
                    type_name: std::any::type_name::<T>(),
                    reason: "text payload is neither String nor &str".into(),
                }),
            }
        }
        PayloadKind::Encoded => serializer.serialize(&message).map(Bytes::from),
    }
}

/// Turn wire bytes back into a `T`.
pub(crate) fn decode<T, S>(payload: &[u8], serializer: &S) -> Result<T>
where
    T: DeserializeOwned + 'static,
    S: TextSerializer,
{
    // ---
    let type_name = std::any::type_name::<T>();

    let text = std::str::from_utf8(payload).map_err(|err| PubSubError::Decode {
        type_name,
        reason: format!("payload is not valid UTF-8: {err}"),
    })?;

    match PayloadKind::of::<T>() {
        PayloadKind::Text => {
            let boxed: Box<dyn Any> = Box::new(text.to_owned());
            boxed
                .downcast::<T>()
                .map(|message| *message)
                .map_err(|_| PubSubError::Decode {
                    type_name,
                    reason: "text payload can only be delivered as String".into(),
                })
        }
        PayloadKind::Encoded => serializer.deserialize::<T>(text),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderDto {
        id: u32,
    }

    #[derive(Default)]
    struct CountingSerializer {
        encodes: AtomicUsize,
        decodes: AtomicUsize,
    }

    impl TextSerializer for CountingSerializer {
        fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            JsonSerializer.serialize(value)
        }

        fn deserialize<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            JsonSerializer.deserialize(text)
        }
    }

    #[test]
    fn payload_kind_resolution() {
        // ---
        assert_eq!(PayloadKind::of::<String>(), PayloadKind::Text);
        assert_eq!(PayloadKind::of::<&'static str>(), PayloadKind::Text);
        assert_eq!(PayloadKind::of::<OrderDto>(), PayloadKind::Encoded);
        assert_eq!(PayloadKind::of::<u64>(), PayloadKind::Encoded);
        assert_eq!(PayloadKind::of::<Vec<String>>(), PayloadKind::Encoded);
    }

    #[test]
    fn text_is_sent_verbatim_without_serializer() {
        // ---
        let serializer = CountingSerializer::default();

        let owned = encode("héllo \"quoted\"".to_string(), &serializer).unwrap();
        let borrowed = encode("plain", &serializer).unwrap();

        assert_eq!(&owned[..], "héllo \"quoted\"".as_bytes());
        assert_eq!(&borrowed[..], b"plain");
        assert_eq!(serializer.encodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn structs_are_serialized_exactly_once() {
        // ---
        let serializer = CountingSerializer::default();

        let bytes = encode(OrderDto { id: 1 }, &serializer).unwrap();

        assert_eq!(&bytes[..], br#"{"id":1}"#);
        assert_eq!(serializer.encodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn text_is_received_verbatim_without_serializer() {
        // ---
        let serializer = CountingSerializer::default();

        let text: String = decode(br#"{"id":1}"#, &serializer).unwrap();

        assert_eq!(text, r#"{"id":1}"#);
        assert_eq!(serializer.decodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn structs_are_deserialized() {
        // ---
        let serializer = CountingSerializer::default();

        let order: OrderDto = decode(br#"{"id":1}"#, &serializer).unwrap();

        assert_eq!(order, OrderDto { id: 1 });
        assert_eq!(serializer.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        // ---
        let err = decode::<String, _>(&[0xff, 0xfe], &JsonSerializer).unwrap_err();
        assert!(matches!(err, PubSubError::Decode { .. }));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        // ---
        let err = decode::<OrderDto, _>(b"hello", &JsonSerializer).unwrap_err();
        match err {
            PubSubError::Decode { type_name, .. } => assert!(type_name.ends_with("OrderDto")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unencodable_value_is_an_encode_error() {
        // ---
        use std::collections::HashMap;

        // JSON object keys must be strings.
        let mut map = HashMap::new();
        map.insert(vec![1u8], 1u8);

        let err = encode(map, &JsonSerializer).unwrap_err();
        assert!(matches!(err, PubSubError::Encode { .. }));
    }
}
