// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic name validation and partition scoping.
//!
//! A topic is a slash-prefixed identifier: the character after the
//! leading `/` must be a letter or underscore, and every later character
//! must be alphanumeric, underscore, or `/`. Double slashes and trailing
//! slashes are rejected.
//!
//! On the wire every datagram topic is qualified with the sender's
//! partition as `<partition>@<topic>` so that unrelated deployments can
//! be filtered out at the receive layer. The `@/` boundary is unambiguous
//! because a valid topic always starts with `/` and never contains `@`.

use crate::error::{Error, Result};

/// Validate a topic (or service) name.
pub fn validate(topic: &str) -> Result<()> {
    let bytes = topic.as_bytes();

    if bytes.len() < 2 || bytes[0] != b'/' {
        return Err(Error::InvalidTopic(topic.to_string()));
    }
    if !(bytes[1].is_ascii_alphabetic() || bytes[1] == b'_') {
        return Err(Error::InvalidTopic(topic.to_string()));
    }
    if bytes[bytes.len() - 1] == b'/' {
        return Err(Error::InvalidTopic(topic.to_string()));
    }

    let mut prev = bytes[0];
    for &b in &bytes[1..] {
        let ok = b.is_ascii_alphanumeric() || b == b'_' || b == b'/';
        if !ok || (b == b'/' && prev == b'/') {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        prev = b;
    }

    Ok(())
}

/// Qualify a topic with a partition for the wire.
pub fn scope_with_partition(partition: &str, topic: &str) -> String {
    format!("{}@{}", partition, topic)
}

/// Split a wire topic back into `(partition, topic)`.
///
/// Returns `None` when the field has no `@/` boundary (malformed or a
/// process-level datagram whose field carries only the partition).
pub fn split_partition(scoped: &str) -> Option<(&str, &str)> {
    let idx = scoped.find("@/")?;
    Some((&scoped[..idx], &scoped[idx + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        for topic in ["/foo", "/foo/bar", "/_private", "/a1/b2_c3", "/f"] {
            assert!(validate(topic).is_ok(), "expected '{}' to be valid", topic);
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for topic in [
            "", "/", "foo", "//foo", "/foo/", "/foo//bar", "/1foo", "/foo bar", "/foo@bar",
            "/foo-bar",
        ] {
            assert!(validate(topic).is_err(), "expected '{}' to be invalid", topic);
        }
    }

    #[test]
    fn partition_roundtrip() {
        let scoped = scope_with_partition("host:alice", "/foo/bar");
        assert_eq!(scoped, "host:alice@/foo/bar");
        assert_eq!(split_partition(&scoped), Some(("host:alice", "/foo/bar")));
    }

    #[test]
    fn partition_containing_at_sign() {
        let scoped = scope_with_partition("user@host", "/foo");
        assert_eq!(split_partition(&scoped), Some(("user@host", "/foo")));
    }

    #[test]
    fn bare_partition_has_no_topic() {
        assert_eq!(split_partition("host:alice"), None);
    }
}
