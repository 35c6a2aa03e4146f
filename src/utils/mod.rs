//! # Utility Modules
//!
//! Supporting utilities for compression, logging, metrics and timing.
//!
//! ## Components
//! - **Compression**: LZ4 and Zstd with size limits and thresholds
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: shared timing constants
//!
//! ## Security
//! - Decompression bomb protection (16MB limit)

pub mod compression;
pub mod logging;
pub mod metrics;
pub mod timeout;
