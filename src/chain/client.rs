// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! EVM JSON-RPC client backed by alloy.
//!
//! Calls are encoded from a human-readable function signature and JSON
//! arguments, so jobs can target any contract without compiled bindings.

use std::str::FromStr;

use alloy::{
    dyn_abi::{DynSolValue, JsonAbiExt, Specifier},
    json_abi::Function,
    network::EthereumWallet,
    primitives::{Address, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    transports::TransportError,
};
use async_trait::async_trait;

use super::{Broadcast, CallRequest, ChainClient, ChainError, Receipt};

/// Fallback base fee when the latest block carries none (25 gwei).
const DEFAULT_BASE_FEE: u128 = 25_000_000_000;

/// Priority fee used when the job does not pin one (1.5 gwei).
const DEFAULT_PRIORITY_FEE: u128 = 1_500_000_000;

/// Chain client signing with locally held keys.
pub struct AlloyChainClient {
    provider: DynProvider,
    default_signer: Address,
}

impl AlloyChainClient {
    /// Connect to `rpc_url`, signing with `signer`.
    pub fn new(rpc_url: &str, signer: PrivateKeySigner) -> Result<Self, ChainError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainError::InvalidRpcUrl(e.to_string()))?;

        let default_signer = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url)
            .erased();

        Ok(Self {
            provider,
            default_signer,
        })
    }

    /// Create a signer from a hex private key, with or without `0x`.
    pub fn signer_from_hex(private_key_hex: &str) -> Result<PrivateKeySigner, ChainError> {
        let trimmed = private_key_hex.trim().trim_start_matches("0x");
        let key_bytes = alloy::hex::decode(trimmed)
            .map_err(|e| ChainError::InvalidPrivateKey(e.to_string()))?;

        PrivateKeySigner::from_slice(&key_bytes)
            .map_err(|e| ChainError::InvalidPrivateKey(e.to_string()))
    }

    /// Build the unsigned request without nonce or fee fields.
    fn build_transaction(&self, request: &CallRequest) -> Result<TransactionRequest, ChainError> {
        let from = parse_address(&request.from)?;
        if from != self.default_signer {
            return Err(ChainError::InvalidCall(format!(
                "account {} is not managed by this signer",
                request.from
            )));
        }

        let mut tx = TransactionRequest::default().from(from);

        match request.to.as_deref() {
            Some(contract) => {
                let data = encode_input(&request.method, &request.args)?;
                tx = tx.to(parse_address(contract)?).input(data.into());
            }
            None => {
                // Plain value transfer: the recipient is the first argument
                let recipient = request
                    .args
                    .get(0)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ChainError::InvalidCall("value transfer needs a recipient".to_string())
                    })?;
                tx = tx.to(parse_address(recipient)?);
            }
        }

        if let Some(value) = request.options.value.as_deref() {
            let value = U256::from_str(value)
                .map_err(|e| ChainError::InvalidCall(format!("invalid value {value}: {e}")))?;
            tx = tx.value(value);
        }

        Ok(tx)
    }

    /// Current (max fee, priority fee) pair.
    async fn gas_prices(&self) -> Result<(u128, u128), ChainError> {
        let block = self
            .provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await
            .map_err(map_rpc_error)?
            .ok_or_else(|| ChainError::Rpc("No latest block".to_string()))?;

        let base_fee: u128 = block
            .header
            .base_fee_per_gas
            .map(|f| f as u128)
            .unwrap_or(DEFAULT_BASE_FEE);

        // Max fee = 2 * base_fee + priority_fee (allows for base fee increase)
        let max_fee = base_fee
            .saturating_mul(2)
            .saturating_add(DEFAULT_PRIORITY_FEE);

        Ok((max_fee, DEFAULT_PRIORITY_FEE))
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn call(&self, request: &CallRequest) -> Result<Vec<u8>, ChainError> {
        let tx = self.build_transaction(request)?;
        let output = self.provider.call(tx).await.map_err(map_rpc_error)?;
        Ok(output.to_vec())
    }

    async fn send(&self, request: &CallRequest) -> Result<Broadcast, ChainError> {
        let mut options = request.options.clone();
        let mut tx = self.build_transaction(request)?;

        // Nonce is taken from the pending count at broadcast time, never at
        // enqueue time, so aborted preflights leave no gaps.
        let nonce = match options.nonce {
            Some(nonce) => nonce,
            None => self
                .provider
                .get_transaction_count(self.default_signer)
                .pending()
                .await
                .map_err(|e| map_rpc_error(e).before_submission())?,
        };

        let (max_fee, priority_fee) =
            match (options.max_fee_per_gas, options.max_priority_fee_per_gas) {
                (Some(max), Some(priority)) => (max, priority),
                (max, priority) => {
                    let (default_max, default_priority) = self
                        .gas_prices()
                        .await
                        .map_err(ChainError::before_submission)?;
                    (
                        max.unwrap_or(default_max),
                        priority.unwrap_or(default_priority),
                    )
                }
            };

        tx = tx
            .nonce(nonce)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(priority_fee);

        let gas_limit = match options.gas_limit {
            Some(limit) => limit,
            None => self
                .provider
                .estimate_gas(tx.clone())
                .await
                .map_err(|e| map_rpc_error(e).before_submission())?,
        };
        tx = tx.gas_limit(gas_limit);

        options.nonce = Some(nonce);
        options.gas_limit = Some(gas_limit);
        options.max_fee_per_gas = Some(max_fee);
        options.max_priority_fee_per_gas = Some(priority_fee);

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(map_rpc_error)?;

        Ok(Broadcast {
            txid: format!("{:#x}", pending.tx_hash()),
            options,
        })
    }

    async fn get_receipt(&self, txid: &str) -> Result<Option<Receipt>, ChainError> {
        let hash: TxHash = txid
            .parse()
            .map_err(|e| ChainError::InvalidCall(format!("Invalid tx hash: {e}")))?;

        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(map_rpc_error)?;

        Ok(receipt.map(|r| Receipt {
            txid: txid.to_string(),
            block_number: r.block_number.unwrap_or(0),
            gas_used: r.gas_used as u64,
            success: r.status(),
        }))
    }

    fn signer_address(&self) -> String {
        format!("{:#x}", self.default_signer)
    }
}

fn parse_address(raw: &str) -> Result<Address, ChainError> {
    Address::from_str(raw).map_err(|e| ChainError::InvalidAddress(format!("{raw}: {e}")))
}

/// Node-side rejections become [`ChainError::Reverted`]; everything else is
/// treated as a transport failure worth retrying.
fn map_rpc_error(err: TransportError) -> ChainError {
    match err.as_error_resp() {
        Some(payload) => ChainError::Reverted(payload.message.to_string()),
        None => ChainError::Rpc(err.to_string()),
    }
}

/// ABI-encode `signature` applied to the JSON `args` array.
///
/// Each argument is coerced from its string form into the parameter type,
/// so numbers may be given as JSON numbers or decimal strings.
pub fn encode_input(signature: &str, args: &serde_json::Value) -> Result<Vec<u8>, ChainError> {
    let function = Function::parse(signature)
        .map_err(|e| ChainError::InvalidCall(format!("invalid signature {signature}: {e}")))?;

    let empty = Vec::new();
    let args = match args {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => &empty,
        _ => return Err(ChainError::InvalidCall("args must be a JSON array".to_string())),
    };

    if args.len() != function.inputs.len() {
        return Err(ChainError::InvalidCall(format!(
            "{} expects {} arguments, got {}",
            function.name,
            function.inputs.len(),
            args.len()
        )));
    }

    let values = function
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            let ty = param
                .resolve()
                .map_err(|e| ChainError::InvalidCall(e.to_string()))?;
            let raw = match arg {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            ty.coerce_str(&raw)
                .map_err(|e| ChainError::InvalidCall(format!("argument {}: {e}", param.name)))
        })
        .collect::<Result<Vec<DynSolValue>, ChainError>>()?;

    function
        .abi_encode_input(&values)
        .map_err(|e| ChainError::InvalidCall(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn encodes_erc20_transfer() {
        let data = encode_input(
            "transfer(address,uint256)",
            &json!(["0x1111111111111111111111111111111111111111", "1000"]),
        )
        .unwrap();

        // transfer(address,uint256) selector
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data.len(), 4 + 32 * 2);
        assert_eq!(data[data.len() - 2..], [0x03, 0xe8]);
    }

    #[test]
    fn accepts_numeric_json_arguments() {
        let from_number = encode_input("approve(address,uint256)", &json!([
            "0x2222222222222222222222222222222222222222",
            42
        ]))
        .unwrap();
        let from_string = encode_input("approve(address,uint256)", &json!([
            "0x2222222222222222222222222222222222222222",
            "42"
        ]))
        .unwrap();
        assert_eq!(from_number, from_string);
    }

    #[test]
    fn rejects_argument_count_mismatch() {
        let err = encode_input("transfer(address,uint256)", &json!(["0x1111"])).unwrap_err();
        assert!(matches!(err, ChainError::InvalidCall(_)));
    }

    #[test]
    fn rejects_non_array_args() {
        let err = encode_input("pause()", &json!({"a": 1})).unwrap_err();
        assert!(err.to_string().contains("JSON array"));
        assert_eq!(encode_input("pause()", &json!(null)).unwrap().len(), 4);
    }

    #[test]
    fn signer_from_hex_accepts_prefixed_keys() {
        let plain = AlloyChainClient::signer_from_hex(TEST_KEY).unwrap();
        let prefixed = AlloyChainClient::signer_from_hex(&format!("0x{TEST_KEY}")).unwrap();
        assert_eq!(plain.address(), prefixed.address());
        assert!(AlloyChainClient::signer_from_hex("zz").is_err());
    }

    #[test]
    fn rejects_foreign_accounts() {
        let signer = AlloyChainClient::signer_from_hex(TEST_KEY).unwrap();
        let client = AlloyChainClient::new("http://127.0.0.1:8545", signer).unwrap();
        let request = CallRequest {
            from: "0x1111111111111111111111111111111111111111".to_string(),
            to: None,
            method: String::new(),
            args: json!(["0x2222222222222222222222222222222222222222"]),
            options: Default::default(),
        };
        let err = client.build_transaction(&request).unwrap_err();
        assert!(matches!(err, ChainError::InvalidCall(_)));
    }

    #[test]
    fn can_sign_only_for_own_address() {
        let signer = AlloyChainClient::signer_from_hex(TEST_KEY).unwrap();
        let client = AlloyChainClient::new("http://127.0.0.1:8545", signer).unwrap();
        let own = client.signer_address();
        assert!(client.can_sign(&own));
        assert!(client.can_sign(&own.to_uppercase().replacen("0X", "0x", 1)));
        assert!(!client.can_sign("0x1111111111111111111111111111111111111111"));
    }

    #[tokio::test]
    async fn unreachable_node_fails_send_before_submission() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let signer = AlloyChainClient::signer_from_hex(TEST_KEY).unwrap();
        let client = AlloyChainClient::new(&format!("http://127.0.0.1:{port}"), signer).unwrap();
        let request = CallRequest {
            from: client.signer_address(),
            to: None,
            method: String::new(),
            args: json!(["0x2222222222222222222222222222222222222222"]),
            options: Default::default(),
        };
        let err = client.send(&request).await.unwrap_err();
        assert!(matches!(err, ChainError::NotSubmitted(_)), "{err:?}");
    }

    #[test]
    fn builds_value_transfer_for_own_account() {
        let signer = AlloyChainClient::signer_from_hex(TEST_KEY).unwrap();
        let client = AlloyChainClient::new("http://127.0.0.1:8545", signer).unwrap();
        let request = CallRequest {
            from: client.signer_address(),
            to: None,
            method: String::new(),
            args: json!(["0x2222222222222222222222222222222222222222"]),
            options: super::super::SendOptions {
                value: Some("1000".to_string()),
                ..Default::default()
            },
        };
        let tx = client.build_transaction(&request).unwrap();
        assert_eq!(tx.value, Some(U256::from(1000u64)));
    }
}
