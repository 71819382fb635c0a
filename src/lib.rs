//! Batch-query coordination core of a sharding database proxy.
//!
//! A client statement is partitioned into per-shard fragments, one
//! sub-client is dispatched per fragment, and their asynchronous
//! completions are aggregated into exactly one client-visible outcome:
//! forwarded results, an error batch in arrival order, or a forced
//! connection close when a backend aborts its leg. The coordinator is
//! reused across the statements of one transaction and never answers the
//! client before every dispatched leg has reported.

pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod routing;
pub mod scheduler;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
