//! Swap Aggregator Client
//!
//! Quote-then-swap flow against the route aggregator, used to convert
//! leftover non-SOL token balance back to SOL after a live close. The
//! aggregator returns a serialised transaction; we re-sign it with the
//! wallet key and submit through the shared RPC connection.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use solana_client::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::chain::wallet::WalletManager;
use crate::domain::bot_config::WRAPPED_SOL_MINT;
use crate::ports::swap::{SwapClient, SwapError, SwapReceipt};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_SLIPPAGE_BPS: u16 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    out_amount: String,
    #[serde(flatten)]
    rest: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest {
    user_public_key: String,
    quote_response: serde_json::Value,
    dynamic_compute_unit_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
}

pub struct AggregatorClient {
    base_url: String,
    client: reqwest::Client,
    rpc: Arc<RpcClient>,
    wallet: Arc<WalletManager>,
    slippage_bps: u16,
}

impl AggregatorClient {
    pub fn new(
        base_url: impl Into<String>,
        rpc_url: String,
        wallet: Arc<WalletManager>,
    ) -> Result<Self, SwapError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SwapError::Build(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            rpc: Arc::new(RpcClient::new_with_commitment(
                rpc_url,
                CommitmentConfig::confirmed(),
            )),
            wallet,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
        })
    }

    async fn get_quote(&self, mint: &str, amount: u64) -> Result<QuoteResponse, SwapError> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, mint, WRAPPED_SOL_MINT, amount, self.slippage_bps
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SwapError::Quote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SwapError::Quote(format!(
                "quote returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SwapError::Quote(e.to_string()))
    }

    async fn build_swap_transaction(
        &self,
        quote: &QuoteResponse,
    ) -> Result<VersionedTransaction, SwapError> {
        let mut quote_value = quote.rest.clone();
        if let Some(obj) = quote_value.as_object_mut() {
            obj.insert(
                "outAmount".to_string(),
                serde_json::Value::String(quote.out_amount.clone()),
            );
        }

        let request = SwapRequest {
            user_public_key: self.wallet.public_key(),
            quote_response: quote_value,
            dynamic_compute_unit_limit: true,
        };

        let url = format!("{}/swap", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SwapError::Build(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SwapError::Build(format!(
                "swap returned {}",
                response.status()
            )));
        }

        let swap: SwapResponse = response
            .json()
            .await
            .map_err(|e| SwapError::Build(e.to_string()))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&swap.swap_transaction)
            .map_err(|e| SwapError::Build(format!("transaction decode: {}", e)))?;

        bincode::deserialize(&bytes)
            .map_err(|e| SwapError::Build(format!("transaction deserialise: {}", e)))
    }
}

#[async_trait]
impl SwapClient for AggregatorClient {
    async fn swap_to_sol(&self, mint: &str, amount: u64) -> Result<SwapReceipt, SwapError> {
        let quote = self.get_quote(mint, amount).await?;
        let out_lamports = quote
            .out_amount
            .parse::<u64>()
            .map_err(|e| SwapError::Quote(format!("bad outAmount: {}", e)))?;

        let mut tx = self.build_swap_transaction(&quote).await?;

        // Re-sign with the wallet key; the aggregator leaves the payer
        // signature slot empty.
        let message_bytes = tx.message.serialize();
        let signature = self.wallet.sign_message(&message_bytes);
        if tx.signatures.is_empty() {
            tx.signatures.push(signature);
        } else {
            tx.signatures[0] = signature;
        }

        let rpc = Arc::clone(&self.rpc);
        let sent = tokio::task::spawn_blocking(move || {
            rpc.send_and_confirm_transaction(&tx)
                .map_err(|e| SwapError::Execution(e.to_string()))
        })
        .await
        .map_err(|e| SwapError::Execution(e.to_string()))??;

        tracing::info!(mint, amount, signature = %sent, "Leftover token swapped to SOL");

        Ok(SwapReceipt {
            signature: sent.to_string(),
            out_lamports,
        })
    }
}
