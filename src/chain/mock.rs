// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory chain used by engine tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Broadcast, CallRequest, ChainClient, ChainError, Receipt};

#[derive(Default)]
struct MockState {
    preflight_error: Option<ChainError>,
    send_error: Option<ChainError>,
    receipt_error: Option<ChainError>,
    /// txid -> receipt once "mined"
    mined: HashMap<String, Receipt>,
    /// Receipts handed out automatically for every new broadcast
    auto_mine: Option<bool>,
    /// Hash returned for the next broadcasts instead of the derived one
    forced_txid: Option<String>,
    /// Accounts this chain signs for, `None` for any
    signers: Option<Vec<String>>,
    calls: usize,
    sends: Vec<CallRequest>,
    next_nonce: u64,
}

/// Scriptable [`ChainClient`] that records every interaction.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mine every subsequent broadcast immediately with the given outcome.
    pub fn auto_mine(&self, success: bool) {
        self.state.lock().unwrap().auto_mine = Some(success);
    }

    pub fn fail_preflight(&self, error: ChainError) {
        self.state.lock().unwrap().preflight_error = Some(error);
    }

    pub fn fail_send(&self, error: ChainError) {
        self.state.lock().unwrap().send_error = Some(error);
    }

    pub fn fail_receipts(&self, error: Option<ChainError>) {
        self.state.lock().unwrap().receipt_error = error;
    }

    /// Node back to healthy: drop every scripted failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.preflight_error = None;
        state.send_error = None;
        state.receipt_error = None;
    }

    /// Only sign for the given accounts.
    pub fn sign_only_for(&self, accounts: &[&str]) {
        self.state.lock().unwrap().signers =
            Some(accounts.iter().map(|a| a.to_lowercase()).collect());
    }

    pub fn force_txid(&self, txid: &str) {
        self.state.lock().unwrap().forced_txid = Some(txid.to_string());
    }

    /// Record a receipt for `txid` as if it had been mined.
    pub fn mine(&self, txid: &str, success: bool) {
        self.state.lock().unwrap().mined.insert(
            txid.to_string(),
            Receipt {
                txid: txid.to_string(),
                block_number: 100,
                gas_used: 21_000,
                success,
            },
        );
    }

    pub fn preflight_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn sends(&self) -> Vec<CallRequest> {
        self.state.lock().unwrap().sends.clone()
    }
}

/// Deterministic hash for a (sender, nonce) pair, like a real signed tx.
fn derive_txid(from: &str, nonce: u64) -> String {
    let mut tag = from.trim_start_matches("0x").to_lowercase();
    tag.truncate(8);
    format!("0x{tag:0>8}{nonce:056x}")
}

#[async_trait]
impl ChainClient for MockChain {
    async fn call(&self, _request: &CallRequest) -> Result<Vec<u8>, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        match &state.preflight_error {
            Some(error) => Err(error.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn send(&self, request: &CallRequest) -> Result<Broadcast, ChainError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.send_error {
            return Err(error.clone());
        }
        state.sends.push(request.clone());

        let mut options = request.options.clone();
        let nonce = match options.nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = state.next_nonce;
                state.next_nonce += 1;
                nonce
            }
        };
        options.nonce = Some(nonce);
        options.gas_limit.get_or_insert(21_000);
        options.max_fee_per_gas.get_or_insert(50_000_000_000);
        options.max_priority_fee_per_gas.get_or_insert(1_500_000_000);

        let txid = state
            .forced_txid
            .clone()
            .unwrap_or_else(|| derive_txid(&request.from, nonce));

        if let Some(success) = state.auto_mine {
            state.mined.insert(
                txid.clone(),
                Receipt {
                    txid: txid.clone(),
                    block_number: 100,
                    gas_used: 21_000,
                    success,
                },
            );
        }

        Ok(Broadcast { txid, options })
    }

    async fn get_receipt(&self, txid: &str) -> Result<Option<Receipt>, ChainError> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.receipt_error {
            return Err(error.clone());
        }
        Ok(state.mined.get(txid).cloned())
    }

    fn signer_address(&self) -> String {
        let state = self.state.lock().unwrap();
        state
            .signers
            .as_ref()
            .and_then(|signers| signers.first().cloned())
            .unwrap_or_else(|| "0x1111111111111111111111111111111111111111".to_string())
    }

    fn can_sign(&self, account: &str) -> bool {
        match &self.state.lock().unwrap().signers {
            Some(signers) => signers.contains(&account.to_lowercase()),
            None => true,
        }
    }
}
