//! Resolution of stored requests, stored imps, stored responses, accounts and category
//! mappings by ID.
//!
//! General design:
//! - Every data source implements the same fetch-by-IDs contract, the [`fetcher::Fetcher`]
//!   family of traits. A fetch never fails as a whole, it returns what it found plus a list
//!   of errors, one `NotFound` per missing ID.
//! - Sources live in [`backends`]: the filesystem, an HTTP endpoint and SQL databases.
//! - Decorators compose them: [`fetcher::MultiFetcher`] consults several backends in
//!   priority order, [`fetcher::CachingFetcher`] serves from a [`cache::Cache`] first, and
//!   [`fetcher::AbFetcher`] applies A/B experiments configured in stored requests.
//! - Caches are kept up to date by the producers in [`events`], which publish saves and
//!   invalidations on channels drained by an [`events::EventListener`].
//! - [`pipeline::StoredRequests`] wires all of it from a [`config::Config`].
pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fetcher;
#[cfg(feature = "logs")]
pub mod logging;
pub mod metrics;
pub mod pipeline;

pub use cache::{Cache, CacheJson};
pub use config::Config;
pub use context::FetchContext;
pub use fetcher::{
    AccountFetcher, AllFetcher, CategoryFetcher, DataType, FetchError, FetchErrorKind,
    FetchResult, Fetcher, RequestsResult, StoredJson, StoredMap,
};
pub use pipeline::StoredRequests;
