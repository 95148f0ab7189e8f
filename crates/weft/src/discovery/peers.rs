// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer records and TTL-tracked peer tables.

use crate::protocol::Scope;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A remote (or local) topic publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publisher {
    /// Topic being published.
    pub topic: String,
    /// Visibility of the advertisement.
    pub scope: Scope,
    /// Data endpoint subscribers connect to (`ip:port`).
    pub address: String,
    /// Control/reply endpoint of the publishing process.
    pub ctrl_address: String,
    /// Publishing process UUID.
    pub process_uuid: Uuid,
    /// Publishing node UUID (string form).
    pub node_uuid: String,
}

/// A remote (or local) service responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Responder {
    /// Service topic.
    pub topic: String,
    /// Visibility of the advertisement.
    pub scope: Scope,
    /// Reply endpoint requesters connect to (`ip:port`).
    pub reply_address: String,
    /// Request payload type name.
    pub req_type: String,
    /// Response payload type name.
    pub rep_type: String,
    /// Responding process UUID.
    pub process_uuid: Uuid,
    /// Responding node UUID (string form).
    pub node_uuid: String,
}

/// Common identity accessors so one table implementation serves both
/// record kinds.
pub trait PeerRecord: Clone {
    fn topic(&self) -> &str;
    fn process_uuid(&self) -> Uuid;
    fn node_uuid(&self) -> &str;
}

impl PeerRecord for Publisher {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn process_uuid(&self) -> Uuid {
        self.process_uuid
    }
    fn node_uuid(&self) -> &str {
        &self.node_uuid
    }
}

impl PeerRecord for Responder {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn process_uuid(&self) -> Uuid {
        self.process_uuid
    }
    fn node_uuid(&self) -> &str {
        &self.node_uuid
    }
}

struct Timed<T> {
    record: T,
    deadline: Instant,
}

/// Remote peer table with per-entry leases.
///
/// Entries are keyed by `(topic, process_uuid, node_uuid)`; duplicate
/// announcements refresh the lease instead of duplicating the entry.
pub struct PeerTable<T: PeerRecord> {
    entries: HashMap<String, Vec<Timed<T>>>,
}

impl<T: PeerRecord> Default for PeerTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: PeerRecord> PeerTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record or refresh its lease. Returns true when the
    /// record is a first observation.
    pub fn insert_or_refresh(&mut self, record: T, ttl: Duration) -> bool {
        let deadline = Instant::now() + ttl;
        let bucket = self.entries.entry(record.topic().to_string()).or_default();

        for entry in bucket.iter_mut() {
            if entry.record.process_uuid() == record.process_uuid()
                && entry.record.node_uuid() == record.node_uuid()
            {
                entry.record = record;
                entry.deadline = deadline;
                return false;
            }
        }

        bucket.push(Timed { record, deadline });
        true
    }

    /// Refresh the lease of every entry owned by a process.
    pub fn refresh_process(&mut self, process_uuid: Uuid, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        for bucket in self.entries.values_mut() {
            for entry in bucket.iter_mut() {
                if entry.record.process_uuid() == process_uuid {
                    entry.deadline = deadline;
                }
            }
        }
    }

    /// Remove one entry. Returns it when present.
    pub fn remove(&mut self, topic: &str, process_uuid: Uuid, node_uuid: &str) -> Option<T> {
        let bucket = self.entries.get_mut(topic)?;
        let idx = bucket.iter().position(|e| {
            e.record.process_uuid() == process_uuid && e.record.node_uuid() == node_uuid
        })?;
        let removed = bucket.swap_remove(idx).record;
        if bucket.is_empty() {
            self.entries.remove(topic);
        }
        Some(removed)
    }

    /// Remove every entry a process announced. Returns the removed
    /// records.
    pub fn remove_process(&mut self, process_uuid: Uuid) -> Vec<T> {
        let mut removed = Vec::new();
        self.entries.retain(|_, bucket| {
            bucket.retain(|e| {
                if e.record.process_uuid() == process_uuid {
                    removed.push(e.record.clone());
                    false
                } else {
                    true
                }
            });
            !bucket.is_empty()
        });
        removed
    }

    /// Remove entries whose lease expired. Returns the removed records.
    pub fn purge_expired(&mut self) -> Vec<T> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.entries.retain(|_, bucket| {
            bucket.retain(|e| {
                if e.deadline <= now {
                    removed.push(e.record.clone());
                    false
                } else {
                    true
                }
            });
            !bucket.is_empty()
        });
        removed
    }

    /// Snapshot the records for a topic.
    pub fn get(&self, topic: &str) -> Vec<T> {
        self.entries
            .get(topic)
            .map(|bucket| bucket.iter().map(|e| e.record.clone()).collect())
            .unwrap_or_default()
    }

    /// All known topics.
    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Deterministic responder selection: lowest `(process_uuid, node_uuid)`
/// in byte-lex order. Every requester on the network picks the same
/// responder for the same candidate set.
pub fn pick_responder(mut responders: Vec<Responder>) -> Option<Responder> {
    responders.sort_by(|a, b| {
        a.process_uuid
            .as_bytes()
            .cmp(b.process_uuid.as_bytes())
            .then_with(|| a.node_uuid.cmp(&b.node_uuid))
    });
    responders.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(topic: &str, puuid: u8, nuuid: &str) -> Publisher {
        Publisher {
            topic: topic.to_string(),
            scope: Scope::All,
            address: "127.0.0.1:1234".to_string(),
            ctrl_address: "127.0.0.1:1235".to_string(),
            process_uuid: Uuid::from_bytes([puuid; 16]),
            node_uuid: nuuid.to_string(),
        }
    }

    fn responder(topic: &str, puuid: u8, nuuid: &str) -> Responder {
        Responder {
            topic: topic.to_string(),
            scope: Scope::All,
            reply_address: "127.0.0.1:9000".to_string(),
            req_type: "Req".to_string(),
            rep_type: "Rep".to_string(),
            process_uuid: Uuid::from_bytes([puuid; 16]),
            node_uuid: nuuid.to_string(),
        }
    }

    #[test]
    fn duplicate_announcements_are_idempotent() {
        let mut table = PeerTable::new();
        let ttl = Duration::from_secs(3);

        assert!(table.insert_or_refresh(publisher("/foo", 1, "n1"), ttl));
        assert!(!table.insert_or_refresh(publisher("/foo", 1, "n1"), ttl));
        assert_eq!(table.get("/foo").len(), 1);

        assert!(table.insert_or_refresh(publisher("/foo", 2, "n1"), ttl));
        assert_eq!(table.get("/foo").len(), 2);
    }

    #[test]
    fn expired_entries_are_purged() {
        let mut table = PeerTable::new();
        table.insert_or_refresh(publisher("/foo", 1, "n1"), Duration::from_millis(0));
        table.insert_or_refresh(publisher("/bar", 2, "n2"), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(5));
        let removed = table.purge_expired();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].topic, "/foo");
        assert!(table.get("/foo").is_empty());
        assert_eq!(table.get("/bar").len(), 1);
    }

    #[test]
    fn heartbeat_extends_lease() {
        let mut table = PeerTable::new();
        let puuid = Uuid::from_bytes([1; 16]);
        table.insert_or_refresh(publisher("/foo", 1, "n1"), Duration::from_millis(10));
        table.refresh_process(puuid, Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(20));
        assert!(table.purge_expired().is_empty());
        assert_eq!(table.get("/foo").len(), 1);
    }

    #[test]
    fn remove_process_sweeps_all_topics() {
        let mut table = PeerTable::new();
        let ttl = Duration::from_secs(3);
        table.insert_or_refresh(publisher("/foo", 1, "n1"), ttl);
        table.insert_or_refresh(publisher("/bar", 1, "n2"), ttl);
        table.insert_or_refresh(publisher("/bar", 2, "n3"), ttl);

        let removed = table.remove_process(Uuid::from_bytes([1; 16]));
        assert_eq!(removed.len(), 2);
        assert!(table.get("/foo").is_empty());
        assert_eq!(table.get("/bar").len(), 1);
    }

    #[test]
    fn responder_pick_is_deterministic() {
        let a = responder("/echo", 3, "bbb");
        let b = responder("/echo", 1, "zzz");
        let c = responder("/echo", 1, "aaa");

        // Same winner regardless of candidate order.
        let pick1 = pick_responder(vec![a.clone(), b.clone(), c.clone()]).expect("pick");
        let pick2 = pick_responder(vec![c.clone(), a.clone(), b.clone()]).expect("pick");
        assert_eq!(pick1, pick2);
        assert_eq!(pick1.node_uuid, "aaa");

        assert!(pick_responder(Vec::new()).is_none());
    }
}
