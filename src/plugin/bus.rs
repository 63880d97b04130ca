//! Worker loop for remote and async models.
//!
//! Registered through `InitPluginAsync`: one long-lived subscriber per model
//! id, consuming `ModelInput` JSON from the `<modelId>` subject, running the
//! model's processing function, and publishing the reply on
//! `<modelId>/results`. The loop owns its own bus connection so it can run
//! in a separate process from the coordinator without changes.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{error, info};

use crate::message::{ModelInput, ModelReply, ModelResults};
use crate::plugin::registry::ProcessFn;

pub(crate) fn results_subject(model_id: &str) -> String {
    format!("{model_id}/results")
}

/// Subscribe to the model's inbound subject and serve requests until the
/// connection goes away.
pub async fn model_worker(url: String, model_id: String, process: ProcessFn) {
    let client = match async_nats::connect(url.as_str()).await {
        Ok(client) => client,
        Err(err) => {
            error!(model = %model_id, "failed to connect to NATS server: {err}");
            return;
        }
    };
    let mut subscription = match client.subscribe(model_id.clone()).await {
        Ok(sub) => sub,
        Err(err) => {
            error!(model = %model_id, "failed to subscribe to model queue: {err}");
            return;
        }
    };
    info!(model = %model_id, "listening for messages on model queue");

    while let Some(msg) = subscription.next().await {
        let client = client.clone();
        let process = Arc::clone(&process);
        let model_id = model_id.clone();
        tokio::spawn(async move {
            let input: ModelInput = match serde_json::from_slice(&msg.payload) {
                Ok(input) => input,
                Err(_) => {
                    error!(model = %model_id, "failed to parse JSON payload");
                    return;
                }
            };
            let transaction_id = input.transaction_id.clone();
            // The processing function is opaque and may block arbitrarily.
            let outcome = tokio::task::spawn_blocking(move || process(input)).await;
            let reply = match outcome {
                Ok(Ok(results)) => ModelReply {
                    transaction_id,
                    results,
                    error: None,
                },
                Ok(Err(err)) => ModelReply {
                    transaction_id,
                    results: ModelResults::default(),
                    error: Some(err.to_string()),
                },
                Err(err) => ModelReply {
                    transaction_id,
                    results: ModelResults::default(),
                    error: Some(err.to_string()),
                },
            };
            match serde_json::to_vec(&reply) {
                Ok(payload) => {
                    if let Err(err) = client
                        .publish(results_subject(&model_id), payload.into())
                        .await
                    {
                        error!(model = %model_id, "failed to publish model results: {err}");
                    }
                }
                Err(err) => {
                    error!(model = %model_id, "failed to serialize model results: {err}");
                }
            }
        });
    }
}
