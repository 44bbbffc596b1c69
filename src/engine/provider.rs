//! Per-Bot Market-Data Provider
//!
//! A thin facade each engine sees: eligible pools filtered for its config,
//! market scores, and active-bin lookups. Active bins prefer the shared
//! cache, then the chain; if the chain read fails, a bin is synthesised
//! from the API-reported price and bin step, and cached like a real one.

use std::sync::Arc;

use crate::adapters::cache::SharedPoolCache;
use crate::domain::bot_config::{BotConfig, WRAPPED_SOL_MINT};
use crate::domain::scoring::{MarketScore, MarketScorer};
use crate::ports::dlmm::DlmmClient;
use crate::ports::pool_api::{ActiveBin, PoolApiError, PoolInfo};

pub struct MarketDataProvider {
    cache: Arc<SharedPoolCache>,
    dlmm: Option<Arc<dyn DlmmClient>>,
    scorer: MarketScorer,
}

impl MarketDataProvider {
    pub fn new(
        cache: Arc<SharedPoolCache>,
        dlmm: Option<Arc<dyn DlmmClient>>,
        scorer: MarketScorer,
    ) -> Self {
        Self {
            cache,
            dlmm,
            scorer,
        }
    }

    /// Pools eligible for this bot: not API-blacklisted, SOL-paired when
    /// required, no blacklisted mints, enough volume, liquidity in range.
    pub async fn list_eligible_pools(
        &self,
        config: &BotConfig,
    ) -> Result<Vec<PoolInfo>, PoolApiError> {
        let pools = self.cache.get_all_pools().await?;
        let total = pools.len();

        let eligible: Vec<PoolInfo> = pools
            .into_iter()
            .filter(|p| !p.blacklisted)
            .filter(|p| {
                !config.sol_pairs_only
                    || p.mint_x == WRAPPED_SOL_MINT
                    || p.mint_y == WRAPPED_SOL_MINT
            })
            .filter(|p| {
                !config.mint_blacklist.contains(&p.mint_x)
                    && !config.mint_blacklist.contains(&p.mint_y)
            })
            .filter(|p| p.volume_24h >= config.min_volume_24h_usd)
            .filter(|p| {
                p.liquidity_usd >= config.min_liquidity_usd
                    && p.liquidity_usd <= config.max_liquidity_usd
            })
            .collect();

        tracing::debug!(
            bot_id = %config.bot_id,
            total,
            eligible = eligible.len(),
            "Pool eligibility filter"
        );

        Ok(eligible)
    }

    pub async fn get_pool(&self, address: &str) -> Result<PoolInfo, PoolApiError> {
        self.cache.get_pool(address).await
    }

    pub fn score(&self, pool: &PoolInfo) -> MarketScore {
        self.scorer.score(pool)
    }

    /// Active bin for a pool: cache, then chain, then synthetic fallback.
    pub async fn active_bin(&self, pool: &PoolInfo) -> Result<ActiveBin, PoolApiError> {
        if let Some(bin) = self.cache.get_cached_active_bin(&pool.address).await {
            return Ok(bin);
        }

        if let Some(dlmm) = &self.dlmm {
            match dlmm.active_bin(&pool.address).await {
                Ok(bin) => {
                    self.cache.cache_active_bin(&pool.address, bin).await;
                    return Ok(bin);
                }
                Err(e) => {
                    tracing::warn!(
                        pool = %pool.address,
                        error = %e,
                        "On-chain active-bin lookup failed, synthesising from price"
                    );
                }
            }
        }

        let bin = Self::synthesize_bin(pool)?;
        self.cache.cache_active_bin(&pool.address, bin).await;
        Ok(bin)
    }

    /// `bin_id = round(ln(price) / ln(1 + bin_step/10000))`
    fn synthesize_bin(pool: &PoolInfo) -> Result<ActiveBin, PoolApiError> {
        if pool.current_price <= 0.0 {
            return Err(PoolApiError::Decode(format!(
                "cannot synthesise bin for {} with price {}",
                pool.address, pool.current_price
            )));
        }
        let step = 1.0 + pool.bin_step as f64 / 10_000.0;
        let bin_id = (pool.current_price.ln() / step.ln()).round() as i32;
        Ok(ActiveBin {
            bin_id,
            price: pool.current_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cache::CacheConfig;
    use crate::ports::mocks::{test_pool, MockDlmmClient, MockPoolApi};

    fn build_provider(
        api: Arc<MockPoolApi>,
        dlmm: Option<Arc<MockDlmmClient>>,
    ) -> MarketDataProvider {
        let cache = Arc::new(SharedPoolCache::new(api, CacheConfig::fast()));
        MarketDataProvider::new(
            cache,
            dlmm.map(|d| d as Arc<dyn DlmmClient>),
            MarketScorer::default(),
        )
    }

    fn config() -> BotConfig {
        BotConfig {
            bot_id: "bot-1".to_string(),
            min_volume_24h_usd: 100_000.0,
            min_liquidity_usd: 50_000.0,
            max_liquidity_usd: 1_000_000.0,
            ..BotConfig::default()
        }
    }

    #[tokio::test]
    async fn test_eligibility_filters() {
        let mut blacklisted = test_pool("blacklisted", 1.0);
        blacklisted.blacklisted = true;

        let mut low_volume = test_pool("lowvol", 1.0);
        low_volume.volume_24h = 1_000.0;

        let mut thin = test_pool("thin", 1.0);
        thin.liquidity_usd = 5_000.0;

        let mut not_sol = test_pool("notsol", 1.0);
        not_sol.mint_y = "SomeOtherMint".to_string();

        let good = test_pool("good", 1.0);

        let api = Arc::new(MockPoolApi::with_pools(vec![
            blacklisted,
            low_volume,
            thin,
            not_sol,
            good,
        ]));
        let provider = build_provider(api, None);

        let eligible = provider.list_eligible_pools(&config()).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].address, "good");
    }

    #[tokio::test]
    async fn test_user_mint_blacklist() {
        let pool = test_pool("a", 1.0);
        let banned_mint = pool.mint_x.clone();
        let api = Arc::new(MockPoolApi::with_pools(vec![pool]));
        let provider = build_provider(api, None);

        let mut cfg = config();
        cfg.mint_blacklist = vec![banned_mint];

        let eligible = provider.list_eligible_pools(&cfg).await.unwrap();
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn test_active_bin_prefers_chain() {
        let pool = test_pool("a", 1.0);
        let api = Arc::new(MockPoolApi::with_pools(vec![pool.clone()]));
        let dlmm = Arc::new(MockDlmmClient::new(25));
        dlmm.set_price_sequence("a", vec![1.5]);
        let provider = build_provider(api, Some(dlmm));

        let bin = provider.active_bin(&pool).await.unwrap();
        assert!((bin.price - 1.5).abs() < 1e-9);

        // Second lookup hits the cache; the chain script is untouched
        let again = provider.active_bin(&pool).await.unwrap();
        assert_eq!(again, bin);
    }

    #[tokio::test]
    async fn test_synthetic_fallback_on_chain_failure() {
        let pool = test_pool("a", 2.0);
        let api = Arc::new(MockPoolApi::with_pools(vec![pool.clone()]));
        let dlmm = Arc::new(MockDlmmClient::new(25));
        dlmm.fail_active_bin(true);
        let provider = build_provider(api, Some(dlmm));

        let bin = provider.active_bin(&pool).await.unwrap();

        // round(ln(2) / ln(1.0025)) = 278
        let expected = (2.0f64.ln() / 1.0025f64.ln()).round() as i32;
        assert_eq!(bin.bin_id, expected);
        assert!((bin.price - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_synthetic_without_chain_client() {
        let pool = test_pool("a", 1.0);
        let api = Arc::new(MockPoolApi::with_pools(vec![pool.clone()]));
        let provider = build_provider(api, None);

        let bin = provider.active_bin(&pool).await.unwrap();
        assert_eq!(bin.bin_id, 0); // ln(1.0) = 0
    }

    #[tokio::test]
    async fn test_synthetic_rejects_bad_price() {
        let pool = test_pool("a", 0.0);
        let api = Arc::new(MockPoolApi::with_pools(vec![pool.clone()]));
        let provider = build_provider(api, None);

        assert!(provider.active_bin(&pool).await.is_err());
    }
}
