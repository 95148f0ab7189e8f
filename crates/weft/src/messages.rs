// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in message types.
//!
//! A small set of plain payloads used by the examples and the test
//! suites. Real deployments bring their own [`Message`] implementations;
//! these exist so the fabric is usable out of the box.

use crate::error::{Error, Result};
use crate::message::Message;

/// A UTF-8 string payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMsg {
    pub data: String,
}

impl StringMsg {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl Message for StringMsg {
    fn type_name() -> &'static str {
        "weft.msgs.StringMsg"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.data.as_bytes().to_vec())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let data = std::str::from_utf8(data)
            .map_err(|e| Error::TypeMismatch(format!("StringMsg: {}", e)))?
            .to_string();
        Ok(Self { data })
    }
}

/// A single 32-bit signed integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int32 {
    pub data: i32,
}

impl Int32 {
    pub fn new(data: i32) -> Self {
        Self { data }
    }
}

impl Message for Int32 {
    fn type_name() -> &'static str {
        "weft.msgs.Int32"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.data.to_le_bytes().to_vec())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| Error::TypeMismatch(format!("Int32: expected 4 bytes, got {}", data.len())))?;
        Ok(Self {
            data: i32::from_le_bytes(bytes),
        })
    }
}

/// A 3D vector of doubles.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Message for Vector3d {
    fn type_name() -> &'static str {
        "weft.msgs.Vector3d"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.x.to_le_bytes());
        buf.extend_from_slice(&self.y.to_le_bytes());
        buf.extend_from_slice(&self.z.to_le_bytes());
        Ok(buf)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 24 {
            return Err(Error::TypeMismatch(format!(
                "Vector3d: expected 24 bytes, got {}",
                data.len()
            )));
        }
        let field = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[i * 8..i * 8 + 8]);
            f64::from_le_bytes(bytes)
        };
        Ok(Self {
            x: field(0),
            y: field(1),
            z: field(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_msg_roundtrip() {
        let msg = StringMsg::new("hello fabric");
        let bytes = msg.encode().expect("encode");
        assert_eq!(StringMsg::decode(&bytes).expect("decode"), msg);
    }

    #[test]
    fn int32_roundtrip_and_bad_length() {
        let msg = Int32::new(-123_456);
        let bytes = msg.encode().expect("encode");
        assert_eq!(Int32::decode(&bytes).expect("decode"), msg);

        assert!(matches!(
            Int32::decode(&[1, 2, 3]),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn vector3d_roundtrip() {
        let msg = Vector3d {
            x: 1.5,
            y: -2.25,
            z: 1e9,
        };
        let bytes = msg.encode().expect("encode");
        assert_eq!(Vector3d::decode(&bytes).expect("decode"), msg);
    }

    #[test]
    fn type_names_are_distinct() {
        assert_ne!(StringMsg::type_name(), Int32::type_name());
        assert_ne!(Int32::type_name(), Vector3d::type_name());
    }
}
