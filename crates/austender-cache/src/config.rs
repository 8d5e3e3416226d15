//! Runtime configuration assembled from the environment.

use std::path::PathBuf;
use std::time::Duration;

use austender_core::DEFAULT_LOOKBACK_PERIOD;
use austender_sources::SourceOptions;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub use_cache: bool,
    pub ocds_base_url: String,
    /// Outer deadline for a whole run; `None` means no deadline.
    pub request_timeout: Option<Duration>,
    pub lookback_period: i32,
    pub force_nsw_browser: bool,
    pub force_vic_browser: bool,
    pub sa_debug_html: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            use_cache: true,
            ocds_base_url: austender_sources::federal::DEFAULT_OCDS_BASE_URL.to_string(),
            request_timeout: None,
            lookback_period: DEFAULT_LOOKBACK_PERIOD,
            force_nsw_browser: false,
            force_vic_browser: false,
            sa_debug_html: false,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let use_cache = match env_trimmed("AUSTENDER_USE_CACHE") {
            Some(raw) => !matches!(raw.to_lowercase().as_str(), "false" | "0"),
            None => true,
        };
        Self {
            cache_dir: default_cache_dir(),
            use_cache,
            ocds_base_url: env_trimmed("AUSTENDER_OCDS_BASE_URL")
                .unwrap_or_else(|| austender_sources::federal::DEFAULT_OCDS_BASE_URL.to_string()),
            request_timeout: env_trimmed("AUSTENDER_REQUEST_TIMEOUT")
                .and_then(|raw| parse_duration(&raw))
                .filter(|d| !d.is_zero()),
            lookback_period: resolve_lookback_period(0),
            force_nsw_browser: env_flag("NSW_USE_BROWSER"),
            force_vic_browser: env_flag("VIC_USE_BROWSER"),
            sa_debug_html: env_flag("SA_DEBUG_HTML"),
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            cache_dir: self.cache_dir.clone(),
            // Per-request transport timeout; the outer run deadline is
            // applied separately by the engine.
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(30)),
            ocds_base_url: self.ocds_base_url.clone(),
            force_nsw_browser: self.force_nsw_browser,
            force_vic_browser: self.force_vic_browser,
            sa_debug_html: self.sa_debug_html,
        }
    }
}

/// Lake/catalog root: `AUSTENDER_CACHE_DIR`, else `$HOME/.cache/austender`,
/// else `./.cache/austender`.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dir) = env_trimmed("AUSTENDER_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = env_trimmed("HOME") {
        return PathBuf::from(home).join(".cache").join("austender");
    }
    PathBuf::from(".cache").join("austender")
}

/// Explicit value wins, then `AUSTENDER_LOOKBACK_PERIOD` (with the legacy
/// `AUSTENDER_LOOKBACK_YEARS` spelling), then the 20-year default.
pub fn resolve_lookback_period(explicit: i32) -> i32 {
    if explicit > 0 {
        return explicit;
    }
    let raw = env_trimmed("AUSTENDER_LOOKBACK_PERIOD")
        .or_else(|| env_trimmed("AUSTENDER_LOOKBACK_YEARS"));
    if let Some(raw) = raw {
        if let Ok(years) = raw.parse::<i32>() {
            if years > 0 {
                return years;
            }
        }
    }
    DEFAULT_LOOKBACK_PERIOD
}

/// Parse durations like `150ms`, `30s`, `2m`, `1h`; a bare number is
/// seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: f64 = value.parse().ok()?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" | "" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    if secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    env_trimmed(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("150ms"), Some(Duration::from_millis(150)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("bad"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn lookback_prefers_explicit_value() {
        assert_eq!(resolve_lookback_period(7), 7);
        assert_eq!(resolve_lookback_period(-1), DEFAULT_LOOKBACK_PERIOD);
    }
}
