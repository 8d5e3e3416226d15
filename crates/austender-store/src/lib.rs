//! Storage and transport for the collector: a retrying HTTP fetcher, the
//! headless-browser fetch fallback, the partitioned Parquet data lake,
//! and the SQLite catalog that indexes it.

pub mod browser;
pub mod catalog;
pub mod fetch;
pub mod lake;

pub use browser::{ChromeFetcher, PageFetcher};
pub use catalog::{cache_key, Catalog, CatalogEntry};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use lake::{DataLake, LakeWriterPool};
