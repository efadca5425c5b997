pub mod artifact;
pub mod config;
pub mod db;
pub mod error;
pub mod instrument;
pub mod job;
pub mod lock;
pub mod schedule;
pub mod schema;
pub mod seed;
pub mod snapshot;

pub use blobsync_bucket as bucket;
