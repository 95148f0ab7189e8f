// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The serialization seam between the fabric and user payloads.
//!
//! Payload serialization is owned by an external structured-message
//! library; the fabric only needs a textual type name and a byte-stream
//! encode/decode. [`Message`] is that seam. The wire carries the type
//! name next to the payload so receivers can skip handlers whose
//! expected type disagrees.

use crate::error::Result;

/// A typed payload that can travel through the fabric.
///
/// Implementations must be cheap to construct from bytes; decode errors
/// surface as [`crate::Error::TypeMismatch`].
pub trait Message: Send + Sized + 'static {
    /// Fully-qualified textual type name (e.g. `weft.msgs.StringMsg`).
    fn type_name() -> &'static str;

    /// Serialize the payload to bytes.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Parse a payload from bytes.
    fn decode(data: &[u8]) -> Result<Self>;
}
