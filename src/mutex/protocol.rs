// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Wire frames of the lock service.
//!
//! One JSON object per line in each direction. Every request carries a
//! client-chosen `request_id` that the matching response echoes back, so a
//! single connection can have several lock requests outstanding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest accepted frame, in bytes.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024;

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Lock { request_id: u64, mutex: String },
    Unlock { request_id: u64, lease_id: u64 },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Granted { request_id: u64, lease_id: u64 },
    Unlocked { request_id: u64, ok: bool },
    Error { request_id: u64, message: String },
}

impl ServerFrame {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Granted { request_id, .. }
            | Self::Unlocked { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }
}

/// Digest a mutex name into the key sent on the wire.
pub fn mutex_key(name: &str) -> String {
    alloy::hex::encode(Sha256::digest(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_type_tag() {
        let frame = ClientFrame::Lock {
            request_id: 3,
            mutex: mutex_key("mtx1"),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "lock");
        assert_eq!(value["request_id"], 3);

        let parsed: ServerFrame =
            serde_json::from_value(json!({"type": "unlocked", "request_id": 9, "ok": true}))
                .unwrap();
        assert_eq!(parsed.request_id(), 9);
    }

    #[test]
    fn mutex_key_is_stable_sha256_hex() {
        let key = mutex_key("callback:42");
        assert_eq!(key.len(), 64);
        assert_eq!(key, mutex_key("callback:42"));
        assert_ne!(key, mutex_key("callback:43"));
        assert_eq!(
            mutex_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
