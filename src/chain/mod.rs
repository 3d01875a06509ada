// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blockchain integration consumed by the dequeue engine.
//!
//! The engine only needs four things from a chain: a read-only preflight
//! call, a signed send that yields a transaction hash immediately, a receipt
//! lookup, and the signer's address. [`ChainClient`] captures exactly that so
//! the engine can be driven against a real node or an in-memory double.

pub mod client;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::AlloyChainClient;

/// Options attached to a send.
///
/// Fields left `None` are resolved by the client at broadcast time. The
/// resolved values are returned in [`Broadcast`] and persisted with the job,
/// so a later re-broadcast reproduces the identical transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Native value in wei, decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<u128>,
}

/// A contract call or value transfer on behalf of `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub from: String,
    /// `None` for a plain value transfer
    pub to: Option<String>,
    /// Function signature, e.g. `transfer(address,uint256)`
    pub method: String,
    /// JSON array of arguments matching the signature
    pub args: serde_json::Value,
    pub options: SendOptions,
}

/// Result of a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub txid: String,
    /// Options with nonce and fees resolved
    pub options: SendOptions,
}

/// Mined transaction outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub txid: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
}

impl Receipt {
    pub fn reverted(&self) -> bool {
        !self.success
    }
}

/// Access to the chain the relay submits to.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Read-only execution of `request` against the latest state.
    async fn call(&self, request: &CallRequest) -> Result<Vec<u8>, ChainError>;

    /// Sign and broadcast `request`, returning as soon as the hash is known.
    async fn send(&self, request: &CallRequest) -> Result<Broadcast, ChainError>;

    /// Receipt of `txid`, `None` while unmined or unknown.
    async fn get_receipt(&self, txid: &str) -> Result<Option<Receipt>, ChainError>;

    /// Address of the signer used by [`ChainClient::send`].
    fn signer_address(&self) -> String;

    /// Whether [`ChainClient::send`] can sign on behalf of `account`.
    fn can_sign(&self, account: &str) -> bool {
        self.signer_address().eq_ignore_ascii_case(account)
    }
}

/// Errors that can occur during blockchain operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid call: {0}")]
    InvalidCall(String),

    /// Node unreachable or returned a transport-level failure
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Transport failure while preparing a send; nothing reached the node
    #[error("Not submitted: {0}")]
    NotSubmitted(String),

    /// Execution reverted or the node rejected the transaction
    #[error("Execution reverted: {0}")]
    Reverted(String),
}

impl ChainError {
    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::NotSubmitted(_))
    }

    /// Turn a transport failure into [`ChainError::NotSubmitted`]; used for
    /// every RPC a send makes before handing the transaction to the node.
    pub fn before_submission(self) -> Self {
        match self {
            Self::Rpc(message) => Self::NotSubmitted(message),
            other => other,
        }
    }

    /// The node already holds an identical transaction in its pool.
    pub fn is_already_known(&self) -> bool {
        match self {
            Self::Reverted(message) | Self::Rpc(message) => {
                let message = message.to_lowercase();
                message.contains("already known") || message.contains("known transaction")
            }
            _ => false,
        }
    }
}

/// Validate a `0x`-prefixed 20-byte hex address.
pub fn validate_address(raw: &str) -> Result<(), ChainError> {
    raw.parse::<alloy::primitives::Address>()
        .map(|_| ())
        .map_err(|e| ChainError::InvalidAddress(format!("{raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rpc_errors_are_transient() {
        assert!(ChainError::Rpc("timeout".into()).is_transient());
        assert!(!ChainError::Reverted("out of gas".into()).is_transient());
        assert!(!ChainError::InvalidCall("bad".into()).is_transient());
        assert!(ChainError::NotSubmitted("nonce lookup".into()).is_transient());
    }

    #[test]
    fn pre_submission_failures_keep_node_rejections() {
        assert_eq!(
            ChainError::Rpc("timeout".into()).before_submission(),
            ChainError::NotSubmitted("timeout".into())
        );
        assert_eq!(
            ChainError::Reverted("execution reverted".into()).before_submission(),
            ChainError::Reverted("execution reverted".into())
        );
    }

    #[test]
    fn recognizes_duplicate_pool_submissions() {
        assert!(ChainError::Reverted("already known".into()).is_already_known());
        assert!(ChainError::Rpc("Known transaction: 0xab".into()).is_already_known());
        assert!(!ChainError::Reverted("nonce too low".into()).is_already_known());
    }

    #[test]
    fn validate_address_accepts_checksummed_and_lowercase() {
        assert!(validate_address("0x5425890298aed601595a70AB815c96711a31Bc65").is_ok());
        assert!(validate_address("0x1111111111111111111111111111111111111111").is_ok());
        assert!(validate_address("not-an-address").is_err());
        assert!(validate_address("0x1234").is_err());
    }

    #[test]
    fn send_options_omit_unset_fields() {
        let json = serde_json::to_value(SendOptions {
            nonce: Some(7),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"nonce": 7}));
    }
}
