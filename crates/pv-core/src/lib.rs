//! # pv-core: stored-query interpretation for plantview
//!
//! Operators register named queries as data: either an aggregation pipeline
//! pasted from a database shell, or the name of a pre-built view. This crate
//! turns those definitions into executable queries bounded by a UTC time
//! range and runs them against whatever document store the host supplies.
//!
//! The same infrastructure backs the dashboard's high-frequency series
//! reads: every store call goes through [`retry::execute`], and repeated
//! reads are answered from a short-lived [`cache::ResultCache`].
//!
//! Layout, leaves first:
//!
//! - [`retry`]: constant-delay retry around any async operation.
//! - [`cache`]: TTL cache with a periodic sweep.
//! - [`pipeline`]: strict-then-repair parsing of pipeline scripts.
//! - [`store`] / [`registry`]: ports for the external collaborators, plus
//!   in-memory adapters.
//! - [`dispatcher`]: resolves a stored query and executes it.
//! - [`timeseries`]: history, graph and latest-value reads.

pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod store;
pub mod time;
pub mod timeseries;

pub use error::{CoreError, CoreResult, StoreError};
