//! The collector engine: registry dispatch plus the incremental-ETL
//! cache path.

use std::sync::Arc;

use austender_core::dates::resolve_dates;
use austender_core::money::{format_money, parse_money};
use austender_core::{
    normalize_source_id, CollectError, MatchSink, MatchSummary, SearchRequest, DEFAULT_DATE_TYPE,
};
use austender_sources::SourceRegistry;
use austender_store::{cache_key, LakeWriterPool};
use tracing::warn;

use crate::config::CacheConfig;
use crate::manager::{windows_cached, CacheManager};

/// Multiplexes every valued release into the lake writer pool while still
/// forwarding to the caller's own sink.
struct TeeSink {
    pool: Arc<LakeWriterPool>,
    inner: Option<Arc<dyn MatchSink>>,
}

impl MatchSink for TeeSink {
    fn write(&self, summary: &MatchSummary) {
        self.pool.write(summary);
        if let Some(inner) = &self.inner {
            inner.write(summary);
        }
    }
}

/// Entry point consumed by the CLI and the HTTP collaborator. Safe for
/// concurrent calls; each call is independent.
pub struct CollectorEngine {
    registry: SourceRegistry,
    config: CacheConfig,
    cache: CacheManager,
}

impl CollectorEngine {
    pub fn new(config: CacheConfig) -> Result<Self, CollectError> {
        let registry = SourceRegistry::with_default_sources(&config.source_options())?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(
        config: CacheConfig,
        registry: SourceRegistry,
    ) -> Result<Self, CollectError> {
        let cache = CacheManager::open(&config.cache_dir)?;
        Ok(Self {
            registry,
            config,
            cache,
        })
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Run the selected source directly, without the cache layer.
    pub async fn run_search(&self, req: &SearchRequest) -> Result<String, CollectError> {
        let mut req = req.clone();
        req.source = normalize_source_id(&req.source);
        if req.lookback_period <= 0 {
            req.lookback_period = self.config.lookback_period;
        }
        self.dispatch(&req).await
    }

    /// Incremental cached search: answer from the lake when every window
    /// is cached, otherwise fetch only uncached windows beyond the
    /// checkpoint and fold the increment into the cached total.
    pub async fn run_search_with_cache(
        &self,
        req: &SearchRequest,
    ) -> Result<(String, bool), CollectError> {
        if !self.config.use_cache {
            return Ok((self.run_search(req).await?, false));
        }

        let mut req = req.clone();
        req.source = normalize_source_id(&req.source);
        if req.lookback_period <= 0 {
            req.lookback_period = self.config.lookback_period;
        }
        let (start_resolved, end_resolved) =
            resolve_dates(req.start_date, req.end_date, req.lookback_period);

        let date_type = if req.date_type.trim().is_empty() {
            DEFAULT_DATE_TYPE
        } else {
            req.date_type.trim()
        };
        let checkpoint_key = cache_key(
            &req.source,
            &req.keyword,
            &req.company,
            &req.agency,
            date_type,
        );
        let checkpoint = self
            .cache
            .catalog()
            .load_checkpoint(&checkpoint_key)
            .unwrap_or(None);

        let mut query_req = req.clone();
        query_req.start_date = Some(start_resolved);
        query_req.end_date = Some(end_resolved);
        let (cached_total, cache_hit) = self.cache.lake().query_totals(&query_req)?;

        // Fully cached range: answer without touching the network.
        if cache_hit
            && windows_cached(self.cache.lake(), &req.source, start_resolved, end_resolved)
        {
            return Ok((format_money(cached_total), true));
        }

        // Resume beyond the checkpoint when it falls inside the range.
        let search_start = match checkpoint {
            Some(cp) if cp > start_resolved && cp <= end_resolved => cp,
            _ => start_resolved,
        };

        let pool = Arc::new(LakeWriterPool::new(Arc::clone(self.cache.lake())));
        let mut run_req = req.clone();
        run_req.start_date = Some(search_start);
        run_req.end_date = Some(end_resolved);
        run_req.on_any_match = Some(Arc::new(TeeSink {
            pool: Arc::clone(&pool),
            inner: req.on_any_match.clone(),
        }));
        let gate_lake = Arc::clone(self.cache.lake());
        let gate_source = req.source.clone();
        run_req.should_fetch_window = Some(Arc::new(move |window| {
            gate_lake.should_fetch_window(&gate_source, window)
        }));

        let outcome = self.dispatch(&run_req).await;

        // Flush whatever was written before inspecting the outcome so a
        // failed run still keeps its completed windows.
        for err in pool.close_all() {
            warn!(error = %err, "lake write failed");
        }
        self.cache.maybe_reindex();
        let formatted = outcome?;

        let incremental = parse_money(&formatted)?;
        let combined = cached_total + incremental;

        // Checkpoints advance only on success.
        self.cache
            .catalog()
            .save_checkpoint(&checkpoint_key, end_resolved)?;

        Ok((format_money(combined), cache_hit))
    }

    async fn dispatch(&self, req: &SearchRequest) -> Result<String, CollectError> {
        let source = self.registry.resolve(&req.source)?;
        match self.config.request_timeout {
            Some(deadline) if !deadline.is_zero() => {
                tokio::time::timeout(deadline, source.run(req))
                    .await
                    .map_err(|_| CollectError::Canceled("request deadline exceeded".into()))?
            }
            _ => source.run(req).await,
        }
    }
}
