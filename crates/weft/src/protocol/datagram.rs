// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery datagram codec.
//!
//! Every datagram starts with the fixed header
//!
//! ```text
//! version:u16 | process_uuid:16B | type:u8 | flags:u16 | topic_len:u16 | topic
//! ```
//!
//! followed by a type-specific body. The topic field carries the
//! partition-qualified name (`partition@/topic`), or the bare partition
//! for process-level messages (`HEARTBEAT`, `BYE`).

use super::wire::{put_bytes16, put_u16, Cursor};
use super::{Scope, WireError};
use uuid::Uuid;

/// Discovery message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Topic advertisement (carries the publisher record).
    Advertise = 0x01,
    /// Interest in a topic; advertisers respond with `Advertise`.
    Subscribe = 0x02,
    /// Withdrawal of a topic advertisement.
    Unadvertise = 0x03,
    /// Per-process liveness refresh.
    Heartbeat = 0x04,
    /// Process is leaving; drop everything it announced.
    Bye = 0x05,
    /// Service advertisement (carries the responder record).
    AdvertiseSrv = 0x06,
    /// Interest in a service.
    SubscribeSrv = 0x07,
    /// Withdrawal of a service advertisement.
    UnadvertiseSrv = 0x08,
    /// A subscriber connected to a publisher endpoint.
    NewConnection = 0x09,
    /// A subscriber or publisher dropped a connection.
    EndConnection = 0x0A,
}

impl MsgType {
    pub fn from_wire(raw: u8) -> Result<Self, WireError> {
        match raw {
            0x01 => Ok(Self::Advertise),
            0x02 => Ok(Self::Subscribe),
            0x03 => Ok(Self::Unadvertise),
            0x04 => Ok(Self::Heartbeat),
            0x05 => Ok(Self::Bye),
            0x06 => Ok(Self::AdvertiseSrv),
            0x07 => Ok(Self::SubscribeSrv),
            0x08 => Ok(Self::UnadvertiseSrv),
            0x09 => Ok(Self::NewConnection),
            0x0A => Ok(Self::EndConnection),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Body of an `Advertise` datagram: the publisher record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseData {
    /// Data endpoint subscribers connect to (`ip:port`).
    pub address: String,
    /// Control/reply endpoint of the announcing process.
    pub ctrl_address: String,
    /// Announcing node UUID (string form).
    pub node_uuid: String,
    /// Visibility of the advertisement.
    pub scope: Scope,
}

/// Body of an `AdvertiseSrv` datagram: the responder record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSrvData {
    /// Reply endpoint requesters connect to (`ip:port`).
    pub address: String,
    /// Secondary control endpoint (unused by responders, kept symmetric).
    pub ctrl_address: String,
    /// Announcing node UUID (string form).
    pub node_uuid: String,
    /// Visibility of the advertisement.
    pub scope: Scope,
    /// Request payload type name.
    pub req_type: String,
    /// Response payload type name.
    pub rep_type: String,
}

/// Type-specific datagram body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramBody {
    /// `Subscribe`, `SubscribeSrv`, `Heartbeat`, `Bye`.
    Empty,
    Advertise(AdvertiseData),
    AdvertiseSrv(AdvertiseSrvData),
    /// `Unadvertise`, `UnadvertiseSrv`: which node withdraws.
    NodeRef { node_uuid: String },
    /// `NewConnection`, `EndConnection`: the publisher endpoint the
    /// connection concerns (empty address means "all of them").
    Connection { address: String, node_uuid: String },
}

/// A parsed (or to-be-encoded) discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub version: u16,
    pub process_uuid: Uuid,
    pub msg_type: MsgType,
    pub flags: u16,
    /// Partition-qualified topic, or bare partition for process-level
    /// messages.
    pub topic: String,
    pub body: DatagramBody,
}

impl Datagram {
    /// Build a header-only datagram.
    pub fn new(version: u16, process_uuid: Uuid, msg_type: MsgType, topic: String) -> Self {
        Self {
            version,
            process_uuid,
            msg_type,
            flags: 0,
            topic,
            body: DatagramBody::Empty,
        }
    }

    /// Attach a body (builder style).
    pub fn with_body(mut self, body: DatagramBody) -> Self {
        self.body = body;
        self
    }

    /// Serialize to datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.topic.len());

        put_u16(&mut buf, self.version);
        buf.extend_from_slice(self.process_uuid.as_bytes());
        buf.push(self.msg_type as u8);
        put_u16(&mut buf, self.flags);
        put_bytes16(&mut buf, self.topic.as_bytes());

        match &self.body {
            DatagramBody::Empty => {}
            DatagramBody::Advertise(adv) => {
                put_bytes16(&mut buf, adv.address.as_bytes());
                put_bytes16(&mut buf, adv.ctrl_address.as_bytes());
                put_bytes16(&mut buf, adv.node_uuid.as_bytes());
                buf.push(adv.scope.to_wire());
            }
            DatagramBody::AdvertiseSrv(adv) => {
                put_bytes16(&mut buf, adv.address.as_bytes());
                put_bytes16(&mut buf, adv.ctrl_address.as_bytes());
                put_bytes16(&mut buf, adv.node_uuid.as_bytes());
                buf.push(adv.scope.to_wire());
                put_bytes16(&mut buf, adv.req_type.as_bytes());
                put_bytes16(&mut buf, adv.rep_type.as_bytes());
            }
            DatagramBody::NodeRef { node_uuid } => {
                put_bytes16(&mut buf, node_uuid.as_bytes());
            }
            DatagramBody::Connection { address, node_uuid } => {
                put_bytes16(&mut buf, address.as_bytes());
                put_bytes16(&mut buf, node_uuid.as_bytes());
            }
        }

        buf
    }

    /// Parse a datagram. Version filtering is the caller's concern; the
    /// parsed version is returned as-is.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(data);

        let version = cur.u16()?;
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(cur.bytes(16)?);
        let process_uuid = Uuid::from_bytes(uuid_bytes);
        let msg_type = MsgType::from_wire(cur.u8()?)?;
        let flags = cur.u16()?;
        let topic = cur.string16()?;

        let body = match msg_type {
            MsgType::Subscribe | MsgType::SubscribeSrv | MsgType::Heartbeat | MsgType::Bye => {
                DatagramBody::Empty
            }
            MsgType::Advertise => DatagramBody::Advertise(AdvertiseData {
                address: cur.string16()?,
                ctrl_address: cur.string16()?,
                node_uuid: cur.string16()?,
                scope: Scope::from_wire(cur.u8()?)?,
            }),
            MsgType::AdvertiseSrv => DatagramBody::AdvertiseSrv(AdvertiseSrvData {
                address: cur.string16()?,
                ctrl_address: cur.string16()?,
                node_uuid: cur.string16()?,
                scope: Scope::from_wire(cur.u8()?)?,
                req_type: cur.string16()?,
                rep_type: cur.string16()?,
            }),
            MsgType::Unadvertise | MsgType::UnadvertiseSrv => DatagramBody::NodeRef {
                node_uuid: cur.string16()?,
            },
            MsgType::NewConnection | MsgType::EndConnection => DatagramBody::Connection {
                address: cur.string16()?,
                node_uuid: cur.string16()?,
            },
        };

        Ok(Self {
            version,
            process_uuid,
            msg_type,
            flags,
            topic,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WIRE_VERSION;

    fn puuid() -> Uuid {
        Uuid::from_bytes([7u8; 16])
    }

    #[test]
    fn header_only_roundtrip() {
        for msg_type in [
            MsgType::Subscribe,
            MsgType::SubscribeSrv,
            MsgType::Heartbeat,
            MsgType::Bye,
        ] {
            let dgram = Datagram::new(WIRE_VERSION, puuid(), msg_type, "part@/foo".to_string());
            let parsed = Datagram::parse(&dgram.encode()).expect("parse");
            assert_eq!(parsed, dgram);
        }
    }

    #[test]
    fn advertise_roundtrip() {
        let dgram = Datagram::new(
            WIRE_VERSION,
            puuid(),
            MsgType::Advertise,
            "part@/sensors/imu".to_string(),
        )
        .with_body(DatagramBody::Advertise(AdvertiseData {
            address: "192.168.1.5:41231".to_string(),
            ctrl_address: "192.168.1.5:41232".to_string(),
            node_uuid: "0f8fad5b-d9cb-469f-a165-70867728950e".to_string(),
            scope: Scope::Host,
        }));

        let parsed = Datagram::parse(&dgram.encode()).expect("parse");
        assert_eq!(parsed, dgram);
    }

    #[test]
    fn advertise_srv_roundtrip() {
        let dgram = Datagram::new(
            WIRE_VERSION,
            puuid(),
            MsgType::AdvertiseSrv,
            "part@/echo".to_string(),
        )
        .with_body(DatagramBody::AdvertiseSrv(AdvertiseSrvData {
            address: "10.0.0.2:55000".to_string(),
            ctrl_address: String::new(),
            node_uuid: "0f8fad5b-d9cb-469f-a165-70867728950e".to_string(),
            scope: Scope::All,
            req_type: "weft.msgs.Int32".to_string(),
            rep_type: "weft.msgs.Int32".to_string(),
        }));

        let parsed = Datagram::parse(&dgram.encode()).expect("parse");
        assert_eq!(parsed, dgram);
    }

    #[test]
    fn unadvertise_and_connection_roundtrip() {
        let dgram = Datagram::new(
            WIRE_VERSION,
            puuid(),
            MsgType::Unadvertise,
            "part@/foo".to_string(),
        )
        .with_body(DatagramBody::NodeRef {
            node_uuid: "abc".to_string(),
        });
        assert_eq!(Datagram::parse(&dgram.encode()).expect("parse"), dgram);

        let dgram = Datagram::new(
            WIRE_VERSION,
            puuid(),
            MsgType::EndConnection,
            "part@/foo".to_string(),
        )
        .with_body(DatagramBody::Connection {
            address: "10.0.0.9:1234".to_string(),
            node_uuid: String::new(),
        });
        assert_eq!(Datagram::parse(&dgram.encode()).expect("parse"), dgram);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Datagram::new(
            WIRE_VERSION,
            puuid(),
            MsgType::Subscribe,
            "part@/foo".to_string(),
        )
        .encode();
        bytes[18] = 0x7F; // type byte sits after version + uuid
        assert_eq!(Datagram::parse(&bytes), Err(WireError::UnknownType(0x7F)));
    }

    #[test]
    fn truncated_rejected() {
        let bytes = Datagram::new(
            WIRE_VERSION,
            puuid(),
            MsgType::Subscribe,
            "part@/foo".to_string(),
        )
        .encode();
        for cut in [0, 5, 18, bytes.len() - 1] {
            assert!(Datagram::parse(&bytes[..cut]).is_err(), "cut={}", cut);
        }
    }
}
