use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// One per-shard statement produced by the routing collaborator.
/// Immutable once assigned; the coordinator consumes a whole map of these
/// per client statement and never edits individual entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFragment {
    pub shard: String,
    pub query: String,
}

impl BatchFragment {
    pub fn new(shard: impl Into<String>, query: impl Into<String>) -> Self {
        BatchFragment {
            shard: shard.into(),
            query: query.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RouteErr {
    #[error("Statement cannot be sharded: {0}")]
    Unroutable(String),

    #[error("Malformed statement payload")]
    Malformed,
}

/// Routing/sharding decision boundary. Given the raw statement payload,
/// produces the shard-name to fragment mapping for one fan-out round.
pub trait StatementRouter: Send + Sync {
    fn route(&self, statement: &[u8]) -> Result<HashMap<String, BatchFragment>, RouteErr>;
}
