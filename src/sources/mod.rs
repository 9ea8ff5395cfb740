// src/sources/mod.rs
pub mod http;
pub mod types;

pub use http::HttpSourceFetcher;
pub use types::{FetchError, SourceFetcher, SourceKey, SourcePayload};
