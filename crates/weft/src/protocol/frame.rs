// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data-plane frames carried over TCP.
//!
//! The stream codec (see `transport::codec`) delimits frames with a
//! `u32` little-endian length prefix; this module encodes and parses the
//! frame bodies. Every body starts with a kind byte followed by `u32`
//! length-prefixed parts:
//!
//! ```text
//! MSG: [topic, sender_process_uuid, type_name, payload]
//! REQ: [topic, request_id, reply_address, sender_process_uuid,
//!       req_type, rep_type, request_bytes]
//! REP: [topic, request_id, sender_process_uuid, response_bytes, result]
//! ```

use super::wire::{put_bytes32, Cursor};
use super::WireError;
use uuid::Uuid;

const KIND_MSG: u8 = 0x01;
const KIND_REQ: u8 = 0x02;
const KIND_REP: u8 = 0x03;

/// A parsed data-plane frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    /// A published topic message.
    Message {
        topic: String,
        process_uuid: Uuid,
        type_name: String,
        payload: Vec<u8>,
    },
    /// A service request.
    Request {
        topic: String,
        request_id: String,
        reply_address: String,
        process_uuid: Uuid,
        req_type: String,
        rep_type: String,
        payload: Vec<u8>,
    },
    /// A service response correlated by request id.
    Response {
        topic: String,
        request_id: String,
        process_uuid: Uuid,
        payload: Vec<u8>,
        result: bool,
    },
}

impl DataFrame {
    /// Serialize the frame body (the stream codec adds the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            DataFrame::Message {
                topic,
                process_uuid,
                type_name,
                payload,
            } => {
                buf.push(KIND_MSG);
                put_bytes32(&mut buf, topic.as_bytes());
                put_bytes32(&mut buf, process_uuid.as_bytes());
                put_bytes32(&mut buf, type_name.as_bytes());
                put_bytes32(&mut buf, payload);
            }
            DataFrame::Request {
                topic,
                request_id,
                reply_address,
                process_uuid,
                req_type,
                rep_type,
                payload,
            } => {
                buf.push(KIND_REQ);
                put_bytes32(&mut buf, topic.as_bytes());
                put_bytes32(&mut buf, request_id.as_bytes());
                put_bytes32(&mut buf, reply_address.as_bytes());
                put_bytes32(&mut buf, process_uuid.as_bytes());
                put_bytes32(&mut buf, req_type.as_bytes());
                put_bytes32(&mut buf, rep_type.as_bytes());
                put_bytes32(&mut buf, payload);
            }
            DataFrame::Response {
                topic,
                request_id,
                process_uuid,
                payload,
                result,
            } => {
                buf.push(KIND_REP);
                put_bytes32(&mut buf, topic.as_bytes());
                put_bytes32(&mut buf, request_id.as_bytes());
                put_bytes32(&mut buf, process_uuid.as_bytes());
                put_bytes32(&mut buf, payload);
                buf.push(u8::from(*result));
            }
        }
        buf
    }

    /// Parse a frame body.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(data);
        let kind = cur.u8()?;
        match kind {
            KIND_MSG => Ok(DataFrame::Message {
                topic: cur.string32()?,
                process_uuid: read_uuid(&mut cur)?,
                type_name: cur.string32()?,
                payload: cur.bytes32()?.to_vec(),
            }),
            KIND_REQ => Ok(DataFrame::Request {
                topic: cur.string32()?,
                request_id: cur.string32()?,
                reply_address: cur.string32()?,
                process_uuid: read_uuid(&mut cur)?,
                req_type: cur.string32()?,
                rep_type: cur.string32()?,
                payload: cur.bytes32()?.to_vec(),
            }),
            KIND_REP => Ok(DataFrame::Response {
                topic: cur.string32()?,
                request_id: cur.string32()?,
                process_uuid: read_uuid(&mut cur)?,
                payload: cur.bytes32()?.to_vec(),
                result: cur.u8()? != 0,
            }),
            other => Err(WireError::UnknownType(other)),
        }
    }

    /// Topic the frame concerns.
    pub fn topic(&self) -> &str {
        match self {
            DataFrame::Message { topic, .. }
            | DataFrame::Request { topic, .. }
            | DataFrame::Response { topic, .. } => topic,
        }
    }
}

fn read_uuid(cur: &mut Cursor<'_>) -> Result<Uuid, WireError> {
    let raw = cur.bytes32()?;
    let bytes: [u8; 16] = raw.try_into().map_err(|_| WireError::BadLength)?;
    Ok(Uuid::from_bytes(bytes))
}
