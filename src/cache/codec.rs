//! Value encoding at the cache boundary
//!
//! Stores only ever see opaque bytes. The facade turns typed values into bytes
//! on the way in and back on the way out, using the codec picked in config.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Value encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueCodec {
  /// JSON text (default, readable with redis-cli)
  #[default]
  Json,
  /// MessagePack, with struct fields encoded by name
  #[serde(rename = "msgpack")]
  MessagePack,
}

impl std::fmt::Display for ValueCodec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ValueCodec::Json => write!(f, "json"),
      ValueCodec::MessagePack => write!(f, "msgpack"),
    }
  }
}

impl std::str::FromStr for ValueCodec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "json" => Ok(ValueCodec::Json),
      "msgpack" | "messagepack" | "rmp" => Ok(ValueCodec::MessagePack),
      _ => Err(format!("Unknown cache codec: {}", s)),
    }
  }
}

/// Encoding or decoding failure
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
  #[error("failed to encode value as {codec}: {message}")]
  Encode { codec: ValueCodec, message: String },
  #[error("failed to decode {codec} value: {message}")]
  Decode { codec: ValueCodec, message: String },
}

impl ValueCodec {
  pub fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
  where
    T: Serialize + ?Sized,
  {
    let encoded = match self {
      ValueCodec::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
      ValueCodec::MessagePack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
    };
    encoded.map_err(|message| CodecError::Encode {
      codec: *self,
      message,
    })
  }

  pub fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
  where
    T: DeserializeOwned,
  {
    let decoded = match self {
      ValueCodec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
      ValueCodec::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
    };
    decoded.map_err(|message| CodecError::Decode {
      codec: *self,
      message,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::HashMap;

  #[test]
  fn test_codec_parse() {
    assert_eq!("json".parse::<ValueCodec>().unwrap(), ValueCodec::Json);
    assert_eq!(
      "MsgPack".parse::<ValueCodec>().unwrap(),
      ValueCodec::MessagePack
    );
    assert!("yaml".parse::<ValueCodec>().is_err());
    assert_eq!(ValueCodec::MessagePack.to_string(), "msgpack");
  }

  #[test]
  fn test_json_payload_is_plain_json() {
    let bytes = ValueCodec::Json.encode(&json!({"x": 1})).unwrap();
    assert_eq!(bytes, br#"{"x":1}"#.to_vec());
  }

  #[test]
  fn test_msgpack_preserves_struct_fields() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Product {
      sku: String,
      price_cents: u64,
    }

    let product = Product {
      sku: "KENTE-001".to_string(),
      price_cents: 12_500,
    };
    let bytes = ValueCodec::MessagePack.encode(&product).unwrap();
    let back: Product = ValueCodec::MessagePack.decode(&bytes).unwrap();
    assert_eq!(back, product);
  }

  #[test]
  fn test_json_rejects_non_string_map_keys() {
    let mut map = HashMap::new();
    map.insert(vec![1u8, 2], "v");
    let err = ValueCodec::Json.encode(&map).unwrap_err();
    assert!(matches!(err, CodecError::Encode { .. }));
  }

  #[test]
  fn test_decode_garbage() {
    let err = ValueCodec::Json
      .decode::<serde_json::Value>(b"{not json")
      .unwrap_err();
    assert!(matches!(err, CodecError::Decode { .. }));
  }
}
