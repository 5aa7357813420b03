//! Production EVM chain client.
//!
//! Typed contract traffic (event filters, callback sends, escrow views)
//! goes through the `sol!`-generated bindings; receipt, block, proof, and
//! nonce reads go through raw JSON-RPC so the verifier sees the node's
//! fields exactly as served.
//!
//! # Transaction building
//!
//! Sends carry an explicit nonce and gas limit from the submitter; the
//! recommended fillers only discover fees (EIP-1559 fee history). Without
//! the fillers, transactions fail with missing property errors.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::chain::{BlockInfo, ChainClient, ProofStatus, ReceiptLog, TimeRequestEvent, TxReceipt};
use crate::contracts::{OracleCall, PaymentView, SwapEscrow, TradeState, TradeView};
use crate::error::{classify_send_error, ChainError};

/// Chain client over one EVM JSON-RPC endpoint with a signing key.
pub struct EvmChainClient {
    rpc_url: String,
    contract_address: Address,
    signer: PrivateKeySigner,
}

impl EvmChainClient {
    pub fn new(rpc_url: &str, contract_address: &str, signer_key: &str) -> Result<Self> {
        let contract_address =
            Address::from_str(contract_address).wrap_err("Invalid escrow contract address")?;
        let signer: PrivateKeySigner = signer_key.parse().wrap_err("Invalid signer key")?;

        info!(
            oracle_address = %signer.address(),
            escrow = %contract_address,
            rpc = %rpc_url,
            "EVM chain client initialized"
        );

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            contract_address,
            signer,
        })
    }

    fn read_provider(&self) -> Result<impl Provider<Http<Client>>, ChainError> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|_| ChainError::RpcUnavailable("invalid RPC URL".to_string()))?;
        Ok(ProviderBuilder::new().on_http(url))
    }

    fn write_provider(&self) -> Result<impl Provider<Http<Client>>, ChainError> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|_| ChainError::RpcUnavailable("invalid RPC URL".to_string()))?;
        let wallet = EthereumWallet::from(self.signer.clone());
        Ok(ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(url))
    }

    async fn raw_request(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let provider = self.read_provider()?;
        provider
            .client()
            .request::<_, serde_json::Value>(method, params)
            .await
            .map_err(|e| ChainError::RpcUnavailable(e.to_string()))
    }
}

fn parse_hex_u64(value: &serde_json::Value) -> Option<u64> {
    let s = value.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn parse_b256(value: &serde_json::Value) -> Option<B256> {
    B256::from_str(value.as_str()?).ok()
}

fn parse_address(value: &serde_json::Value) -> Option<Address> {
    Address::from_str(value.as_str()?).ok()
}

fn receipt_from_json(tx_hash: B256, json: &serde_json::Value) -> Option<TxReceipt> {
    // No block number means the node is still gossiping it; treat as unmined.
    let block_number = parse_hex_u64(&json["blockNumber"])?;
    let block_hash = parse_b256(&json["blockHash"])?;
    let status = json["status"].as_str() == Some("0x1");

    let logs = json["logs"]
        .as_array()
        .map(|logs| {
            logs.iter()
                .filter_map(|log| {
                    Some(ReceiptLog {
                        address: parse_address(&log["address"])?,
                        topics: log["topics"]
                            .as_array()?
                            .iter()
                            .filter_map(parse_b256)
                            .collect(),
                        data: log["data"]
                            .as_str()
                            .and_then(|d| hex::decode(d.trim_start_matches("0x")).ok())
                            .unwrap_or_default()
                            .into(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(TxReceipt {
        tx_hash,
        status,
        block_number,
        block_hash,
        logs,
    })
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let provider = self.read_provider()?;
        provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::RpcUnavailable(e.to_string()))
    }

    async fn time_request_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TimeRequestEvent>, ChainError> {
        let provider = self.read_provider()?;
        let contract = SwapEscrow::new(self.contract_address, &provider);

        let logs = contract
            .TimeRequestSent_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(|e| ChainError::RpcUnavailable(e.to_string()))?;

        let mut events: Vec<(u64, u64, TimeRequestEvent)> = logs
            .into_iter()
            .map(|(event, log)| {
                let block_number = log.block_number.unwrap_or_default();
                let duration: u64 = event.duration.try_into().unwrap_or_else(|_| {
                    warn!(
                        trade_id = %event.tradeId,
                        duration = %event.duration,
                        "Event duration exceeds u64::MAX, clamping"
                    );
                    u64::MAX
                });
                (
                    block_number,
                    log.log_index.unwrap_or_default(),
                    TimeRequestEvent {
                        request_id: event.requestId,
                        trade_id: event.tradeId,
                        duration,
                        block_number,
                        block_timestamp: 0,
                    },
                )
            })
            .collect();

        events.sort_by_key(|(block, index, _)| (*block, *index));
        Ok(events.into_iter().map(|(_, _, ev)| ev).collect())
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let json = self
            .raw_request("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        if json.is_null() {
            return Ok(None);
        }
        Ok(receipt_from_json(tx_hash, &json))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockInfo>, ChainError> {
        let json = self
            .raw_request(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{:x}", number), false]),
            )
            .await?;
        if json.is_null() {
            return Ok(None);
        }

        let hash = match parse_b256(&json["hash"]) {
            Some(h) => h,
            None => return Ok(None),
        };
        let timestamp = parse_hex_u64(&json["timestamp"]).unwrap_or_default();
        let transactions = json["transactions"]
            .as_array()
            .map(|txs| txs.iter().filter_map(parse_b256).collect())
            .unwrap_or_default();

        Ok(Some(BlockInfo {
            number,
            hash,
            timestamp,
            transactions,
        }))
    }

    async fn send(
        &self,
        call: &OracleCall,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<B256, ChainError> {
        let provider = self.write_provider()?;
        let contract = SwapEscrow::new(self.contract_address, &provider);

        debug!(
            call = call.label(),
            nonce,
            gas_limit,
            escrow = %self.contract_address,
            "Submitting oracle callback"
        );

        let pending = match call {
            OracleCall::FulfillTime {
                request_id,
                timestamp,
            } => {
                contract
                    .fulfillTime(*request_id, U256::from(*timestamp))
                    .nonce(nonce)
                    .gas(gas_limit)
                    .send()
                    .await
            }
            OracleCall::HandleFailedConfirmation { id } => {
                contract
                    .handleFailedConfirmation(*id)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .send()
                    .await
            }
            OracleCall::HandleExecutionTimeout { id } => {
                contract
                    .handleExecutionTimeout(*id)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .send()
                    .await
            }
        }
        .map_err(|e| classify_send_error(&e.to_string()))?;

        Ok(*pending.tx_hash())
    }

    async fn get_proof(
        &self,
        address: Address,
        block_number: u64,
    ) -> Result<ProofStatus, ChainError> {
        let result = self
            .raw_request(
                "eth_getProof",
                serde_json::json!([address, [], format!("0x{:x}", block_number)]),
            )
            .await;

        match result {
            Ok(json) if !json.is_null() => Ok(ProofStatus::Validated),
            Ok(_) => Ok(ProofStatus::Unsupported),
            Err(ChainError::RpcUnavailable(msg))
                if msg.to_lowercase().contains("method not found")
                    || msg.to_lowercase().contains("not supported")
                    || msg.to_lowercase().contains("does not exist") =>
            {
                Ok(ProofStatus::Unsupported)
            }
            Err(e) => Err(e),
        }
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        let provider = self.read_provider()?;
        provider
            .get_balance(address)
            .await
            .map_err(|e| ChainError::RpcUnavailable(e.to_string()))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let json = self
            .raw_request(
                "eth_getTransactionCount",
                serde_json::json!([address, "pending"]),
            )
            .await?;
        parse_hex_u64(&json)
            .ok_or_else(|| ChainError::RpcUnavailable("malformed transaction count".to_string()))
    }

    async fn get_trade(&self, trade_id: U256) -> Result<Option<TradeView>, ChainError> {
        let provider = self.read_provider()?;
        let contract = SwapEscrow::new(self.contract_address, &provider);

        let view = contract
            .getTrade(trade_id)
            .call()
            .await
            .map_err(|e| classify_send_error(&e.to_string()))?;

        if view.id.is_zero() {
            return Ok(None);
        }

        let state = TradeState::from_u8(view.state).ok_or_else(|| {
            ChainError::RpcUnavailable(format!("unknown trade state {}", view.state))
        })?;

        Ok(Some(TradeView {
            id: view.id,
            amount: view.amount,
            buyer: view.buyer,
            seller: view.seller,
            state,
            inception_time: view.inceptionTime.try_into().unwrap_or_default(),
            confirmation_time: view.confirmationTime.try_into().unwrap_or_default(),
            duration: view.duration.try_into().unwrap_or_default(),
        }))
    }

    async fn get_payment(&self, payment_id: U256) -> Result<Option<PaymentView>, ChainError> {
        let provider = self.read_provider()?;
        let contract = SwapEscrow::new(self.contract_address, &provider);

        let view = contract
            .getPayment(payment_id)
            .call()
            .await
            .map_err(|e| classify_send_error(&e.to_string()))?;

        if view.id.is_zero() {
            return Ok(None);
        }

        let state = TradeState::from_u8(view.state).ok_or_else(|| {
            ChainError::RpcUnavailable(format!("unknown payment state {}", view.state))
        })?;

        Ok(Some(PaymentView {
            id: view.id,
            amount: view.amount,
            buyer: view.buyer,
            seller: view.seller,
            state,
            inception_time: view.inceptionTime.try_into().unwrap_or_default(),
            confirmation_time: view.confirmationTime.try_into().unwrap_or_default(),
            duration: view.duration.try_into().unwrap_or_default(),
            asset_trade_id: view.assetTradeId,
        }))
    }

    fn signer_address(&self) -> Address {
        self.signer.address()
    }

    fn contract_address(&self) -> Address {
        self.contract_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_json_parses_logs() {
        let tx = B256::repeat_byte(0xaa);
        let json = serde_json::json!({
            "blockNumber": "0x10",
            "blockHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "status": "0x1",
            "logs": [{
                "address": "0x2222222222222222222222222222222222222222",
                "topics": ["0x3333333333333333333333333333333333333333333333333333333333333333"],
                "data": "0xdeadbeef"
            }]
        });

        let receipt = receipt_from_json(tx, &json).expect("receipt should parse");
        assert!(receipt.status);
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].data.as_ref(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn unmined_receipt_is_none() {
        let json = serde_json::json!({ "blockNumber": null, "status": null });
        assert!(receipt_from_json(B256::ZERO, &json).is_none());
    }

    #[test]
    fn failed_status_parses_false() {
        let json = serde_json::json!({
            "blockNumber": "0x1",
            "blockHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "status": "0x0",
            "logs": []
        });
        let receipt = receipt_from_json(B256::ZERO, &json).unwrap();
        assert!(!receipt.status);
    }
}
