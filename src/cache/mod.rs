//! SQLite-backed cache of photo service metadata.
//!
//! Holds per-gallery photo listings and the group hierarchy so repeat runs
//! can decide gallery completeness without remote calls.

pub mod db;
pub mod error;
pub mod schema;

pub use db::{MetadataCache, SqliteMetadataCache};
