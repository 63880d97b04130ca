//! Plugin handling: the extension registry, the manager that owns plugin
//! handles and per-transaction state, and the bus worker loop for remote
//! models.

pub mod bus;
pub mod manager;
pub mod registry;

pub use manager::{ChannelMode, PluginManager};
pub use registry::{DecisionExtension, ExtensionRegistry, ModelExtension, PluginError, ProcessFn};
