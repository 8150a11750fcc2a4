//! Core library modules for tumulus
//!
//! This module contains the internal implementation of the tiling, detection
//! and deduplication pipeline.

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod geojson;
pub mod ledger;
pub mod mapper;
pub mod oracle;
pub mod raster;
pub mod runner;
pub mod tiler;
pub mod transform;

// Re-export main types for internal use
pub use catalog::TileCatalog;
pub use ledger::CheckpointStore;
pub use tiler::Tiler;
