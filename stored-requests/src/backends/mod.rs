//! Stored data sources: the leaves of a fetcher chain.

pub mod db;
pub mod db_provider;
pub mod empty;
pub mod file;
pub mod http;

pub use db::DbFetcher;
pub use db_provider::{DbDriver, DbProvider, SqlxDbProvider};
pub use empty::EmptyFetcher;
pub use file::FileFetcher;
pub use http::HttpFetcher;
