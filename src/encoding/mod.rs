//! Wire encodings.
//!
//! A connection uses exactly one encoding, chosen when it is established:
//! WebSocket connections by the negotiated subprotocol, HTTP connections by
//! the version probe.

pub mod json;
pub mod protobuf;

use serde::{de::DeserializeOwned, Serialize};

use crate::Result;
use protobuf::{ProtoDecode, ProtoEncode};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Json,
    Protobuf,
}

impl Encoding {
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
            Encoding::Protobuf => "application/x-protobuf",
        }
    }

    pub fn encode<T: Serialize + ProtoEncode>(self, msg: &T) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => json::encode(msg),
            Encoding::Protobuf => Ok(protobuf::encode(msg)),
        }
    }

    pub fn decode<T: DeserializeOwned + ProtoDecode>(self, data: &[u8]) -> Result<T> {
        match self {
            Encoding::Json => json::decode(data),
            Encoding::Protobuf => protobuf::decode(data),
        }
    }
}
