//! Contract-award sources: the federal OCDS API client and the NSW, VIC,
//! SA, and WA portal scrapers, resolved through an explicit registry.

pub mod federal;
mod html;
pub mod nsw;
pub mod registry;
pub mod sa;
pub mod vic;
pub mod wa;

pub use federal::FederalSource;
pub use nsw::NswSource;
pub use registry::{Source, SourceOptions, SourceRegistry};
pub use sa::SaSource;
pub use vic::VicSource;
pub use wa::WaSource;

/// Browser-like user agent shared by the scrape paths; the portals block
/// obvious robots.
pub(crate) const SCRAPE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
