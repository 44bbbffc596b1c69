//! Recording mock implementations of the ports, shared by unit and
//! integration tests. Each mock records calls and serves scripted
//! responses; none touches the network.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::position::EntryFeatures;
use crate::ports::dlmm::{
    ChainReader, CreatePositionReceipt, CreatePositionRequest, DlmmClient, DlmmError,
    RemoveLiquidityReceipt,
};
use crate::ports::pool_api::{ActiveBin, PoolApi, PoolApiError, PoolInfo};
use crate::ports::predictor::{BatchPrediction, Predictor, PredictorHealth};
use crate::ports::swap::{SwapClient, SwapError, SwapReceipt};

/// Scripted pool API with call counting and failure injection
#[derive(Default)]
pub struct MockPoolApi {
    pools: Mutex<Vec<PoolInfo>>,
    all_calls: AtomicUsize,
    pool_calls: Mutex<Vec<String>>,
    fail_remaining: AtomicUsize,
    fail_always: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl MockPoolApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pools(pools: Vec<PoolInfo>) -> Self {
        let api = Self::new();
        *api.pools.lock().unwrap() = pools;
        api
    }

    pub fn set_pools(&self, pools: Vec<PoolInfo>) {
        *self.pools.lock().unwrap() = pools;
    }

    /// Fail the next `n` requests before recovering
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        *self.fail_always.lock().unwrap() = fail;
    }

    /// Hold each upstream request open for `d` before answering
    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock().unwrap() = Some(d);
    }

    pub fn all_pool_calls(&self) -> usize {
        self.all_calls.load(Ordering::SeqCst)
    }

    pub fn pool_calls(&self) -> Vec<String> {
        self.pool_calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.all_pool_calls() + self.pool_calls.lock().unwrap().len()
    }

    async fn simulate_latency(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    fn should_fail(&self) -> bool {
        if *self.fail_always.lock().unwrap() {
            return true;
        }
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

#[async_trait]
impl PoolApi for MockPoolApi {
    async fn fetch_all_pools(&self) -> Result<Vec<PoolInfo>, PoolApiError> {
        self.all_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.should_fail() {
            return Err(PoolApiError::Http("mock failure".to_string()));
        }
        Ok(self.pools.lock().unwrap().clone())
    }

    async fn fetch_pool(&self, address: &str) -> Result<PoolInfo, PoolApiError> {
        self.pool_calls.lock().unwrap().push(address.to_string());
        self.simulate_latency().await;
        if self.should_fail() {
            return Err(PoolApiError::Http("mock failure".to_string()));
        }
        self.pools
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.address == address)
            .cloned()
            .ok_or_else(|| PoolApiError::NotFound(address.to_string()))
    }
}

/// DLMM client serving scripted per-pool price sequences. Each
/// `active_bin` call consumes the next price; the last one repeats.
#[derive(Default)]
pub struct MockDlmmClient {
    prices: Mutex<HashMap<String, VecDeque<f64>>>,
    bin_step: u16,
    fail_bins: Mutex<bool>,
    create_calls: Mutex<Vec<CreatePositionRequest>>,
    close_calls: Mutex<Vec<String>>,
    fees: Mutex<HashMap<String, (u64, u64)>>,
    fail_create: Mutex<bool>,
    fail_close: Mutex<bool>,
    next_fee_lamports: AtomicU64,
}

impl MockDlmmClient {
    pub fn new(bin_step: u16) -> Self {
        Self {
            bin_step,
            next_fee_lamports: AtomicU64::new(5_000),
            ..Self::default()
        }
    }

    /// Script the price sequence `active_bin` walks through for a pool
    pub fn set_price_sequence(&self, pool: &str, prices: Vec<f64>) {
        self.prices
            .lock()
            .unwrap()
            .insert(pool.to_string(), prices.into());
    }

    pub fn set_position_fees(&self, position: &str, fees: (u64, u64)) {
        self.fees.lock().unwrap().insert(position.to_string(), fees);
    }

    pub fn fail_active_bin(&self, fail: bool) {
        *self.fail_bins.lock().unwrap() = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        *self.fail_close.lock().unwrap() = fail;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.lock().unwrap().len()
    }

    pub fn close_calls(&self) -> Vec<String> {
        self.close_calls.lock().unwrap().clone()
    }

    fn bin_for_price(&self, price: f64) -> i32 {
        let step = 1.0 + self.bin_step as f64 / 10_000.0;
        (price.ln() / step.ln()).round() as i32
    }
}

#[async_trait]
impl DlmmClient for MockDlmmClient {
    async fn active_bin(&self, pool_address: &str) -> Result<ActiveBin, DlmmError> {
        if *self.fail_bins.lock().unwrap() {
            return Err(DlmmError::Rpc("mock bin failure".to_string()));
        }
        let mut prices = self.prices.lock().unwrap();
        let queue = prices
            .get_mut(pool_address)
            .ok_or_else(|| DlmmError::Rpc(format!("no price script for {}", pool_address)))?;
        let price = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            *queue
                .front()
                .ok_or_else(|| DlmmError::Rpc("empty price script".to_string()))?
        };
        Ok(ActiveBin {
            bin_id: self.bin_for_price(price),
            price,
        })
    }

    async fn create_position(
        &self,
        request: &CreatePositionRequest,
    ) -> Result<CreatePositionReceipt, DlmmError> {
        if *self.fail_create.lock().unwrap() {
            return Err(DlmmError::SendFailed("mock create failure".to_string()));
        }
        let mut calls = self.create_calls.lock().unwrap();
        calls.push(request.clone());
        Ok(CreatePositionReceipt {
            position_address: format!("mock-position-{}", calls.len()),
            signature: format!("mock-sig-{}", calls.len()),
            fee_lamports: self.next_fee_lamports.load(Ordering::SeqCst),
        })
    }

    async fn remove_liquidity_and_close(
        &self,
        _pool_address: &str,
        position_address: &str,
    ) -> Result<RemoveLiquidityReceipt, DlmmError> {
        if *self.fail_close.lock().unwrap() {
            return Err(DlmmError::SendFailed("mock close failure".to_string()));
        }
        self.close_calls
            .lock()
            .unwrap()
            .push(position_address.to_string());
        let (fx, fy) = self
            .fees
            .lock()
            .unwrap()
            .get(position_address)
            .copied()
            .unwrap_or((0, 0));
        Ok(RemoveLiquidityReceipt {
            signatures: vec![format!("mock-close-{}", position_address)],
            total_fee_lamports: self.next_fee_lamports.load(Ordering::SeqCst),
            fees_claimed_x: fx,
            fees_claimed_y: fy,
            withdrawn_x: 0,
            withdrawn_y: 0,
        })
    }

    async fn position_fees(&self, position_address: &str) -> Result<(u64, u64), DlmmError> {
        Ok(self
            .fees
            .lock()
            .unwrap()
            .get(position_address)
            .copied()
            .unwrap_or((0, 0)))
    }
}

/// Fixed-balance chain reader
pub struct MockChainReader {
    balance: AtomicU64,
    token_balances: Mutex<HashMap<String, u64>>,
}

impl MockChainReader {
    pub fn new(balance_lamports: u64) -> Self {
        Self {
            balance: AtomicU64::new(balance_lamports),
            token_balances: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_balance(&self, lamports: u64) {
        self.balance.store(lamports, Ordering::SeqCst);
    }

    pub fn set_token_balance(&self, mint: &str, amount: u64) {
        self.token_balances
            .lock()
            .unwrap()
            .insert(mint.to_string(), amount);
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn balance_lamports(&self, _pubkey: &str) -> Result<u64, DlmmError> {
        Ok(self.balance.load(Ordering::SeqCst))
    }

    async fn token_balance(&self, _owner: &str, mint: &str) -> Result<u64, DlmmError> {
        Ok(self
            .token_balances
            .lock()
            .unwrap()
            .get(mint)
            .copied()
            .unwrap_or(0))
    }
}

/// Predictor serving a scripted batch response, or nothing at all
#[derive(Default)]
pub struct MockPredictor {
    response: Mutex<Option<BatchPrediction>>,
    health: Mutex<Option<PredictorHealth>>,
    predict_calls: AtomicUsize,
}

impl MockPredictor {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_response(response: BatchPrediction) -> Self {
        let mock = Self::default();
        *mock.response.lock().unwrap() = Some(response.clone());
        *mock.health.lock().unwrap() = Some(PredictorHealth {
            status: "ok".to_string(),
            model: response.model.clone(),
            version: "test".to_string(),
            threshold: response.threshold,
            feature_names: Vec::new(),
        });
        mock
    }

    pub fn predict_calls(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    async fn health(&self) -> Option<PredictorHealth> {
        self.health.lock().unwrap().clone()
    }

    async fn predict(
        &self,
        features: &[EntryFeatures],
        _pool_addresses: &[String],
    ) -> Option<BatchPrediction> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        let BatchPrediction {
            mut predictions,
            model,
            threshold,
        } = self.response.lock().unwrap().clone()?;
        // Serve exactly as many rows as were asked for
        predictions.truncate(features.len());
        Some(BatchPrediction {
            predictions,
            model,
            threshold,
        })
    }
}

/// Swap client that records requested swaps
#[derive(Default)]
pub struct MockSwapClient {
    swaps: Mutex<Vec<(String, u64)>>,
    fail: Mutex<bool>,
}

impl MockSwapClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn swaps(&self) -> Vec<(String, u64)> {
        self.swaps.lock().unwrap().clone()
    }
}

#[async_trait]
impl SwapClient for MockSwapClient {
    async fn swap_to_sol(&self, mint: &str, amount: u64) -> Result<SwapReceipt, SwapError> {
        if *self.fail.lock().unwrap() {
            return Err(SwapError::Execution("mock swap failure".to_string()));
        }
        self.swaps.lock().unwrap().push((mint.to_string(), amount));
        Ok(SwapReceipt {
            signature: "mock-swap-sig".to_string(),
            out_lamports: amount,
        })
    }
}

/// A plausible SOL-paired test pool
pub fn test_pool(address: &str, price: f64) -> PoolInfo {
    PoolInfo {
        address: address.to_string(),
        name: format!("{}-SOL", address),
        mint_x: format!("mint-{}", address),
        mint_y: crate::domain::bot_config::WRAPPED_SOL_MINT.to_string(),
        bin_step: 25,
        current_price: price,
        liquidity_usd: 200_000.0,
        volume_30m: 10_000.0,
        volume_1h: 25_000.0,
        volume_2h: 45_000.0,
        volume_4h: 90_000.0,
        volume_24h: 600_000.0,
        fees_30m: 50.0,
        fees_1h: 120.0,
        fees_24h: 2_500.0,
        apr: 180.0,
        blacklisted: false,
    }
}
