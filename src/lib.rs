//! # taskq
//!
//! Distributed work queues for computational tasks.
//!
//! A [`dispatch::Dispatcher`] validates submissions and enqueues them on a
//! per-language [`queue::WorkQueue`]. Each [`worker::Worker`] leases one task
//! at a time, runs it, publishes the result on its language channel and
//! completes the lease; unfinished leases are re-delivered after their
//! timeout. A [`stream::ClientStreamSession`] listens on every result
//! channel and forwards only its own client's results.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
