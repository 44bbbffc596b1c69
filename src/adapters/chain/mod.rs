//! Chain RPC Adapter
//!
//! A shared wrapper around the blocking Solana RPC client. Requests run on
//! the blocking pool; the orchestrator hands one instance to every live
//! bot. The retrying sender applies a priority fee, resubmits on transient
//! failures with linear backoff, and captures the actual network fee from
//! the confirmed transaction.

pub mod wallet;

use async_trait::async_trait;
use solana_client::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    compute_budget::ComputeBudgetInstruction,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::Signature,
    transaction::Transaction,
};
use solana_transaction_status::UiTransactionEncoding;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::ports::dlmm::{ChainReader, DlmmError};
use wallet::WalletManager;

/// Fallback network fee when the confirmed transaction meta is unavailable
pub const DEFAULT_TX_FEE_LAMPORTS: u64 = 5_000;

/// Send attempts before a transaction is declared failed
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Base backoff between send attempts; grows linearly
const SEND_BACKOFF: Duration = Duration::from_millis(750);

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("Transaction send failed: {0}")]
    SendFailed(String),

    #[error("Invalid public key: {0}")]
    InvalidPubkey(String),
}

impl From<ChainError> for DlmmError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::SendFailed(m) => DlmmError::SendFailed(m),
            other => DlmmError::Rpc(other.to_string()),
        }
    }
}

/// Shared RPC connection
#[derive(Clone)]
pub struct RpcChainClient {
    client: Arc<RpcClient>,
}

impl RpcChainClient {
    pub fn new(rpc_url: String) -> Self {
        let client = Arc::new(RpcClient::new_with_commitment(
            rpc_url,
            CommitmentConfig::confirmed(),
        ));
        Self { client }
    }

    pub async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64, ChainError> {
        let client = Arc::clone(&self.client);
        let pubkey = *pubkey;
        tokio::task::spawn_blocking(move || {
            client
                .get_balance(&pubkey)
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?
    }

    /// Sign and send instructions as one transaction, prefixed with a
    /// priority-fee instruction, retrying on transient failures. Returns
    /// the signature and the actual fee paid.
    pub async fn send_instructions(
        &self,
        instructions: Vec<Instruction>,
        wallet: &WalletManager,
        priority_fee_microlamports: u64,
    ) -> Result<(Signature, u64), ChainError> {
        let mut all_instructions =
            vec![ComputeBudgetInstruction::set_compute_unit_price(priority_fee_microlamports)];
        all_instructions.extend(instructions);

        let payer = wallet.pubkey();
        let mut last_err = ChainError::SendFailed("no attempts made".to_string());

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let blockhash = {
                let client = Arc::clone(&self.client);
                tokio::task::spawn_blocking(move || {
                    client
                        .get_latest_blockhash()
                        .map_err(|e| ChainError::Rpc(e.to_string()))
                })
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))??
            };

            let mut tx = Transaction::new_with_payer(&all_instructions, Some(&payer));
            tx.message.recent_blockhash = blockhash;
            wallet
                .sign_transaction(&mut tx)
                .map_err(|e| ChainError::SendFailed(e.to_string()))?;

            let client = Arc::clone(&self.client);
            let tx_clone = tx.clone();
            let sent = tokio::task::spawn_blocking(move || {
                client
                    .send_and_confirm_transaction(&tx_clone)
                    .map_err(|e| ChainError::SendFailed(e.to_string()))
            })
            .await
            .map_err(|e| ChainError::SendFailed(e.to_string()))?;

            match sent {
                Ok(signature) => {
                    let fee = self.transaction_fee(&signature).await;
                    return Ok((signature, fee));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Transaction send failed");
                    last_err = e;
                    if attempt < MAX_SEND_ATTEMPTS {
                        tokio::time::sleep(SEND_BACKOFF * attempt).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Fee taken by a confirmed transaction, from its meta. Falls back to
    /// the flat default when the lookup fails.
    pub async fn transaction_fee(&self, signature: &Signature) -> u64 {
        let client = Arc::clone(&self.client);
        let signature = *signature;
        let fee = tokio::task::spawn_blocking(move || {
            client
                .get_transaction(&signature, UiTransactionEncoding::Base64)
                .ok()
                .and_then(|tx| tx.transaction.meta.map(|m| m.fee))
        })
        .await
        .ok()
        .flatten();

        match fee {
            Some(fee) => fee,
            None => {
                tracing::debug!(%signature, "Fee lookup failed, using default");
                DEFAULT_TX_FEE_LAMPORTS
            }
        }
    }
}

#[async_trait]
impl ChainReader for RpcChainClient {
    async fn balance_lamports(&self, pubkey: &str) -> Result<u64, DlmmError> {
        let pubkey =
            Pubkey::from_str(pubkey).map_err(|e| DlmmError::Rpc(format!("bad pubkey: {}", e)))?;
        self.get_balance(&pubkey).await.map_err(DlmmError::from)
    }

    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64, DlmmError> {
        let owner =
            Pubkey::from_str(owner).map_err(|e| DlmmError::Rpc(format!("bad owner: {}", e)))?;
        let mint =
            Pubkey::from_str(mint).map_err(|e| DlmmError::Rpc(format!("bad mint: {}", e)))?;

        let client = Arc::clone(&self.client);
        let accounts = tokio::task::spawn_blocking(move || {
            client
                .get_token_accounts_by_owner(
                    &owner,
                    solana_client::rpc_request::TokenAccountsFilter::Mint(mint),
                )
                .map_err(|e| DlmmError::Rpc(e.to_string()))
        })
        .await
        .map_err(|e| DlmmError::Rpc(e.to_string()))??;

        let total = accounts
            .iter()
            .filter_map(|keyed| {
                // Parsed token account: ui_amount lives under account.data
                serde_json::to_value(&keyed.account.data)
                    .ok()
                    .and_then(|v| {
                        v.pointer("/parsed/info/tokenAmount/amount")
                            .and_then(|a| a.as_str())
                            .and_then(|s| s.parse::<u64>().ok())
                    })
            })
            .sum();

        Ok(total)
    }
}
