//! Cache manager: owns the catalog and lake for a cache directory and
//! the daily reindex throttle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use austender_core::{split_date_windows, CollectError, MAX_WINDOW_DAYS};
use austender_store::{Catalog, DataLake};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

const REINDEX_MARKER: &str = "index.last";
const REINDEX_INTERVAL_HOURS: i64 = 24;

pub struct CacheManager {
    base_dir: PathBuf,
    catalog: Arc<Catalog>,
    lake: Arc<DataLake>,
}

impl CacheManager {
    pub fn open(base_dir: &Path) -> Result<Self, CollectError> {
        let catalog = Arc::new(Catalog::open(base_dir)?);
        let lake = Arc::new(DataLake::new(base_dir, Arc::clone(&catalog)));
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            catalog,
            lake,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn lake(&self) -> &Arc<DataLake> {
        &self.lake
    }

    /// Rebuild the lake index when the daily marker is missing or stale.
    pub fn maybe_reindex(&self) {
        if !self.marker_stale() {
            return;
        }
        match self.lake.rebuild_index() {
            Ok(indexed) => {
                info!(indexed, "lake index rebuilt");
                self.touch_marker();
            }
            Err(err) => warn!(error = %err, "scheduled lake reindex failed"),
        }
    }

    fn marker_stale(&self) -> bool {
        let marker = self.base_dir.join(REINDEX_MARKER);
        let Ok(raw) = std::fs::read_to_string(&marker) else {
            return true;
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(last) => {
                Utc::now() - last.with_timezone(&Utc) > Duration::hours(REINDEX_INTERVAL_HOURS)
            }
            Err(_) => true,
        }
    }

    fn touch_marker(&self) {
        let marker = self.base_dir.join(REINDEX_MARKER);
        if let Err(err) = std::fs::write(&marker, Utc::now().to_rfc3339()) {
            warn!(error = %err, "could not write reindex marker");
        }
    }
}

/// True when every window of `[start, end]` falls in an already-written
/// month for the source.
pub fn windows_cached(
    lake: &DataLake,
    source: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    split_date_windows(start, end, MAX_WINDOW_DAYS)
        .iter()
        .all(|window| !lake.should_fetch_window(source, window))
}
