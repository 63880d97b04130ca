//! Records exchanged between the core, the plugins and the message bus.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::registry::PluginError;

/// Input handed to a model plugin, and the JSON payload published on the
/// `<modelId>` bus subject for remote models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInput {
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub payload: String,
}

/// One model's verdict for one transaction: the probability that the
/// analyzed payload is an attack, plus whatever auxiliary data the model
/// wants to surface to the decision plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResults {
    #[serde(rename = "probattack")]
    pub prob_attack: f64,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

/// Wire record published on `<modelId>/results` by the remote worker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReply {
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    #[serde(flatten)]
    pub results: ModelResults,
    #[serde(default)]
    pub error: Option<String>,
}

/// Completion notification for one dispatched model invocation. Exactly one
/// is delivered per dispatch on the round's status channel.
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub model_id: String,
    pub prob_attack: f64,
    pub error: Option<PluginError>,
}

impl ModelStatus {
    pub fn ok(model_id: impl Into<String>, prob_attack: f64) -> Self {
        Self {
            model_id: model_id.into(),
            prob_attack,
            error: None,
        }
    }

    pub fn failed(model_id: impl Into<String>, error: PluginError) -> Self {
        Self {
            model_id: model_id.into(),
            prob_attack: 0.0,
            error: Some(error),
        }
    }
}

/// Everything a decision plugin sees: the per-model results collected for
/// the transaction, the configured aggregation weights, and the scores the
/// WAF rule engine produced.
#[derive(Debug, Clone, Default)]
pub struct DecisionInput {
    pub transaction_id: String,
    pub results: HashMap<String, ModelResults>,
    pub model_weight: HashMap<String, f64>,
    pub waf_data: HashMap<String, String>,
}
