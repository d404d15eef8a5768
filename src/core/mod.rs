// src/core/mod.rs

//! The caching engines, their storage, and the origin adapters they drive.

pub mod cache;
pub mod errors;
pub mod metrics;
pub mod origins;
pub mod proxy;
pub mod tasks;
pub mod timeseries;

pub use errors::StrideError;
