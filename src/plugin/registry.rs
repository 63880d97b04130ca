//! Extension registry: how plugin implementations become reachable from the
//! core.
//!
//! Implementations register a capability record per plugin id before
//! [`crate::Wace::init`] runs — by link-time registration, by a dynamic
//! loader shim, or by handing over plain trait objects. The manager only
//! consumes the trait contracts below; where a configured mode needs an
//! entry point the extension does not provide, loading fails for that plugin
//! alone and it is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::metrics::Meter;
use thiserror::Error;

use crate::config::SegmentType;
use crate::message::{DecisionInput, ModelInput, ModelResults};

/// A model's processing function, as registered with the remote worker loop.
pub type ProcessFn = Arc<dyn Fn(ModelInput) -> Result<ModelResults, PluginError> + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("model plugin not found")]
    NotFound,

    #[error("plugin type {0} cannot process a request with incompatible type {1}")]
    Incompatible(SegmentType, SegmentType),

    #[error("model plugin is async")]
    AsyncModel,

    #[error("transaction results not found")]
    ResultsNotFound,

    /// The extension does not provide the entry point its configured mode
    /// requires.
    #[error("plugin does not provide {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Runtime(String),
}

/// An ML classifier returning probability-of-attack for a payload.
///
/// Sync-local extensions implement [`init`](ModelExtension::init) and
/// [`process`](ModelExtension::process). Async or remote extensions
/// implement [`init_async`](ModelExtension::init_async) and register their
/// processing function through the callback; the bus worker loop drives it
/// from then on.
pub trait ModelExtension: Send + Sync {
    fn init(&self, _params: &HashMap<String, String>, _meter: &Meter) -> Result<(), PluginError> {
        Err(PluginError::Unsupported("InitPlugin"))
    }

    fn init_async(
        &self,
        _params: &HashMap<String, String>,
        _meter: &Meter,
        _register: &mut dyn FnMut(ProcessFn),
    ) -> Result<(), PluginError> {
        Err(PluginError::Unsupported("InitPluginAsync"))
    }

    fn process(&self, _input: ModelInput) -> Result<ModelResults, PluginError> {
        Err(PluginError::Unsupported("Process"))
    }
}

/// An aggregator that turns collected model results plus WAF rule scores
/// into a block/allow verdict.
pub trait DecisionExtension: Send + Sync {
    fn init(&self, params: &HashMap<String, String>, meter: &Meter) -> Result<(), PluginError>;

    fn check_results(&self, input: DecisionInput) -> Result<bool, PluginError>;
}

/// Capability records for every plugin the process can load, keyed by the
/// plugin id used in the configuration.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    models: HashMap<String, Arc<dyn ModelExtension>>,
    decisions: HashMap<String, Arc<dyn DecisionExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_model(&mut self, id: impl Into<String>, extension: Arc<dyn ModelExtension>) {
        self.models.insert(id.into(), extension);
    }

    pub fn register_decision(
        &mut self,
        id: impl Into<String>,
        extension: Arc<dyn DecisionExtension>,
    ) {
        self.decisions.insert(id.into(), extension);
    }

    pub fn model(&self, id: &str) -> Option<Arc<dyn ModelExtension>> {
        self.models.get(id).cloned()
    }

    pub fn decision(&self, id: &str) -> Option<Arc<dyn DecisionExtension>> {
        self.decisions.get(id).cloned()
    }
}
