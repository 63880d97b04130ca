//! Errors surfaced to the embedding host.

use thiserror::Error;

use crate::config::BadSegmentError;
use crate::plugin::registry::PluginError;

#[derive(Debug, Error)]
pub enum WaceError {
    #[error("transaction with id {0} does not exist")]
    UnknownTransaction(String),

    #[error(transparent)]
    Segment(#[from] BadSegmentError),

    #[error("decision plugin {0} not found")]
    DecisionNotFound(String),

    #[error("results for transaction {0} not found")]
    ResultsNotFound(String),

    /// A decision plugin failed while producing its verdict.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("could not serialize bus payload: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("bus publish failed: {0}")]
    BusPublish(String),

    #[error("message bus is not connected")]
    BusDisconnected,

    #[error("could not open log file: {0}")]
    Logging(String),
}
