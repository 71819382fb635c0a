use crate::backend::TransportErr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchErr {
    #[error("Failed to start sub-client for shard '{0}'")]
    Dispatch(String),

    #[error("Error in backend transport")]
    Transport(#[from] TransportErr),
}
