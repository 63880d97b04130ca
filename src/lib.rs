//! Coordination core for ML-assisted WAF augmentation.
//!
//! A hosting WAF streams parts of an HTTP transaction (headers, body, whole
//! request or response) through this library. Each part is dispatched to a
//! configured set of ML model plugins, their attack-probability outputs are
//! aggregated together with the WAF rule-engine scores, and a decision plugin
//! turns the aggregate into a single block/allow verdict per transaction.
//!
//! The embedding host drives one transaction through
//! [`Wace::init_transaction`], any number of [`Wace::analyze`] rounds,
//! [`Wace::check_transaction`] and finally [`Wace::close_transaction`].
//! Model plugins run in-process (sync), over the message bus (remote), or as
//! fire-and-forget bus consumers (async); only sync and remote models gate
//! the final decision.

pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod message;
pub mod plugin;

pub use crate::config::{ConfigStore, LogLevel, SegmentType};
pub use crate::core::Wace;
pub use crate::error::WaceError;
pub use crate::message::{DecisionInput, ModelInput, ModelReply, ModelResults, ModelStatus};
pub use crate::plugin::registry::{
    DecisionExtension, ExtensionRegistry, ModelExtension, PluginError, ProcessFn,
};
