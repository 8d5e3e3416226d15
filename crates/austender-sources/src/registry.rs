//! Name-to-implementation source registry, injected into the engine at
//! startup rather than living in process-wide state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use austender_core::{normalize_source_id, CollectError, SearchRequest};

use crate::{FederalSource, NswSource, SaSource, VicSource, WaSource};

/// A provider capable of fulfilling a search request. `run` returns the
/// formatted currency total for the request.
#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> &'static str;
    async fn run(&self, req: &SearchRequest) -> Result<String, CollectError>;
}

/// Runtime knobs the sources need; assembled from env by the cache layer
/// so the sources themselves stay environment-free.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Root under which per-source browser profiles (`<id>_cookies/`) live.
    pub cache_dir: PathBuf,
    pub request_timeout: Duration,
    pub ocds_base_url: String,
    pub force_nsw_browser: bool,
    pub force_vic_browser: bool,
    pub sa_debug_html: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cache/austender"),
            request_timeout: Duration::from_secs(30),
            ocds_base_url: crate::federal::DEFAULT_OCDS_BASE_URL.to_string(),
            force_nsw_browser: false,
            force_vic_browser: false,
            sa_debug_html: false,
        }
    }
}

/// Registry of sources keyed by normalized id. Re-registration
/// overwrites; no per-run state is retained here.
#[derive(Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source.
    pub fn with_default_sources(options: &SourceOptions) -> Result<Self, CollectError> {
        let mut registry = Self::new();
        registry.register(Arc::new(FederalSource::new(options)?));
        registry.register(Arc::new(NswSource::new(options)?));
        registry.register(Arc::new(VicSource::new(options)?));
        registry.register(Arc::new(SaSource::new(options)?));
        registry.register(Arc::new(WaSource::new(options)?));
        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn Source>) {
        let id = normalize_source_id(source.id());
        self.sources.insert(id, source);
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Source>, CollectError> {
        let normalized = normalize_source_id(id);
        self.sources.get(&normalized).cloned().ok_or_else(|| {
            CollectError::InvalidArgument(format!(
                "unknown source {:?}; available: {}",
                normalized,
                self.available().join(", ")
            ))
        })
    }

    pub fn available(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake(&'static str);

    #[async_trait]
    impl Source for Fake {
        fn id(&self) -> &'static str {
            self.0
        }

        async fn run(&self, _req: &SearchRequest) -> Result<String, CollectError> {
            Ok("$0.00".into())
        }
    }

    #[test]
    fn empty_id_resolves_to_default() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(Fake("federal")));
        assert_eq!(registry.resolve("").unwrap().id(), "federal");
        assert_eq!(registry.resolve(" FEDERAL ").unwrap().id(), "federal");
    }

    #[test]
    fn unknown_id_lists_available_sources() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(Fake("federal")));
        registry.register(Arc::new(Fake("vic")));
        let err = match registry.resolve("qld") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve(\"qld\") to fail"),
        };
        let message = err.to_string();
        assert!(message.contains("qld"));
        assert!(message.contains("federal, vic"));
        assert!(matches!(err, CollectError::InvalidArgument(_)));
    }

    #[test]
    fn reregistration_overwrites() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(Fake("vic")));
        registry.register(Arc::new(Fake("vic")));
        assert_eq!(registry.available(), vec!["vic".to_string()]);
    }

    #[test]
    fn default_registry_covers_all_portals() {
        let registry = SourceRegistry::with_default_sources(&SourceOptions::default()).unwrap();
        assert_eq!(registry.available(), vec!["federal", "nsw", "sa", "vic", "wa"]);
    }
}
