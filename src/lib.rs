//! Block storage for genomic annotation datasets.
//!
//! Records keyed by `(chromosome, position)` are encoded by a [`codec`]
//! tree, grouped into blocks by a [`blocker`] strategy and written into
//! columns of an embedded ordered [`store`]. A [`schema::Schema`] ties one
//! dataset's codec and blocker to a persisted descriptor; a
//! [`storage::Storage`] owns the directories and the per-db connectors.
//! [`schema::SegmentedSchema`] and [`schema::FastaSchema`] cover datasets
//! split over several dbs and reference sequences.

pub mod blocker;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connector;
pub mod encoding;
pub mod error;
pub mod options;
pub mod schema;
pub mod storage;
pub mod store;

mod flock;
mod hasher;

pub use config::StorageConfig;
pub use encoding::keycode::{KeyCodec, Locus};
pub use error::{Error, Result};
pub use schema::{FastaSchema, Filter, SampleReport, Schema, SegmentedSchema};
pub use storage::Storage;
