//! The plugin manager owns plugin handles, per-transaction result storage,
//! the per-transaction status channels, and the bus connection used for
//! remote dispatch.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use opentelemetry::metrics::Meter;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigStore, PluginMode, SegmentType};
use crate::error::WaceError;
use crate::message::{DecisionInput, ModelInput, ModelReply, ModelResults, ModelStatus};
use crate::plugin::bus::{self, results_subject};
use crate::plugin::registry::{
    DecisionExtension, ExtensionRegistry, ModelExtension, PluginError, ProcessFn,
};

/// Sender half of a round's status channel.
pub type StatusSender = UnboundedSender<ModelStatus>;

type CheckFn = Arc<dyn Fn(DecisionInput) -> Result<bool, PluginError> + Send + Sync>;

/// Whether a status channel carries gating (sync) or non-gating (async)
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Sync,
    Async,
}

struct LoadedModel {
    #[allow(dead_code)]
    handle: Arc<dyn ModelExtension>,
    segment: SegmentType,
}

struct LoadedDecision {
    #[allow(dead_code)]
    handle: Arc<dyn DecisionExtension>,
}

/// Owns the four plugin registries and all per-transaction state.
pub struct PluginManager {
    config: Arc<ConfigStore>,
    models: DashMap<String, LoadedModel>,
    process_fns: DashMap<String, ProcessFn>,
    decisions: DashMap<String, LoadedDecision>,
    check_fns: DashMap<String, CheckFn>,
    results: DashMap<String, DashMap<String, ModelResults>>,
    sync_channels: DashMap<String, DashMap<SegmentType, StatusSender>>,
    async_channels: DashMap<String, DashMap<SegmentType, StatusSender>>,
    nats: Option<async_nats::Client>,
}

impl PluginManager {
    /// Connect to the bus and load every configured plugin from the
    /// registry. Plugins that cannot be loaded are logged and skipped; a
    /// failed bus connection is logged and remote dispatch degrades to
    /// publish errors.
    pub async fn new(
        config: Arc<ConfigStore>,
        registry: &ExtensionRegistry,
        meter: Meter,
    ) -> Arc<Self> {
        debug!("connecting to NATS server at {}", config.nats_url());
        let nats = match async_nats::connect(config.nats_url()).await {
            Ok(client) => Some(client),
            Err(err) => {
                error!("failed to connect to NATS server: {err}");
                None
            }
        };

        let manager = Arc::new(Self {
            config,
            models: DashMap::new(),
            process_fns: DashMap::new(),
            decisions: DashMap::new(),
            check_fns: DashMap::new(),
            results: DashMap::new(),
            sync_channels: DashMap::new(),
            async_channels: DashMap::new(),
            nats,
        });
        Self::load_model_plugins(&manager, registry, &meter);
        Self::load_decision_plugins(&manager, registry, &meter);
        manager
    }

    fn load_model_plugins(manager: &Arc<Self>, registry: &ExtensionRegistry, meter: &Meter) {
        for model in manager.config.models() {
            let Some(extension) = registry.model(&model.id) else {
                warn!(plugin = %model.id, "cannot load plugin: not in extension registry");
                continue;
            };
            if model.mode == PluginMode::Async || model.remote {
                let url = manager.config.nats_url().to_string();
                let id = model.id.clone();
                let mut register = |process: ProcessFn| {
                    tokio::spawn(bus::model_worker(url.clone(), id.clone(), process));
                };
                if let Err(err) = extension.init_async(&model.params, meter, &mut register) {
                    warn!(plugin = %model.id, "cannot load plugin: {err}");
                    continue;
                }
                Self::spawn_result_listener(manager, model.id.clone());
            } else {
                if let Err(err) = extension.init(&model.params, meter) {
                    warn!(plugin = %model.id, "cannot load plugin: {err}");
                    continue;
                }
                let handle = Arc::clone(&extension);
                manager.process_fns.insert(
                    model.id.clone(),
                    Arc::new(move |input| handle.process(input)) as ProcessFn,
                );
            }
            manager.models.insert(
                model.id.clone(),
                LoadedModel {
                    handle: extension,
                    segment: model.segment,
                },
            );
            info!(plugin = %model.id, "plugin loaded");
        }
    }

    fn load_decision_plugins(manager: &Arc<Self>, registry: &ExtensionRegistry, meter: &Meter) {
        for decision in manager.config.decisions() {
            let Some(extension) = registry.decision(&decision.id) else {
                warn!(plugin = %decision.id, "cannot load plugin: not in extension registry");
                continue;
            };
            if let Err(err) = extension.init(&decision.params, meter) {
                warn!(plugin = %decision.id, "cannot load plugin: {err}");
                continue;
            }
            let handle = Arc::clone(&extension);
            manager.check_fns.insert(
                decision.id.clone(),
                Arc::new(move |input| handle.check_results(input)) as CheckFn,
            );
            manager
                .decisions
                .insert(decision.id.clone(), LoadedDecision { handle: extension });
            info!(plugin = %decision.id, "plugin loaded");
        }
    }

    /// Create the empty result store for a transaction.
    pub fn init_transaction(&self, transaction_id: &str) {
        self.results.insert(transaction_id.to_string(), DashMap::new());
    }

    /// Install a round's status sender at (transaction, segment) in the sync
    /// or async channel map. Idempotent within a transaction.
    pub fn add_model_channel(
        &self,
        transaction_id: &str,
        segment: SegmentType,
        sender: StatusSender,
        mode: ChannelMode,
    ) {
        let channels = match mode {
            ChannelMode::Sync => &self.sync_channels,
            ChannelMode::Async => &self.async_channels,
        };
        channels
            .entry(transaction_id.to_string())
            .or_default()
            .insert(segment, sender);
    }

    /// Drop the async channel at (transaction, segment); when it was the
    /// transaction's last async channel, erase the async entry entirely.
    pub fn remove_async_model_channel(&self, transaction_id: &str, segment: SegmentType) {
        match self.async_channels.get(transaction_id) {
            Some(channels) => {
                channels.remove(&segment);
                drop(channels);
                self.async_channels
                    .remove_if(transaction_id, |_, channels| channels.is_empty());
            }
            None => {
                error!(
                    transaction = %transaction_id,
                    "transaction not found when trying to remove async model channel"
                );
            }
        }
    }

    /// Synchronous local dispatch: run the model over the payload, store its
    /// results and report completion on the round's status channel. All
    /// failures are reported on the channel, never returned.
    pub fn process(
        &self,
        model_id: &str,
        transaction_id: &str,
        payload: &str,
        segment: SegmentType,
        status: &StatusSender,
    ) {
        let accepted = match self.models.get(model_id) {
            Some(model) => model.segment,
            None => {
                send_status(status, ModelStatus::failed(model_id, PluginError::NotFound));
                return;
            }
        };
        if !accepted.accepts(segment) {
            send_status(
                status,
                ModelStatus::failed(model_id, PluginError::Incompatible(accepted, segment)),
            );
            return;
        }
        if self.config.is_async(model_id) {
            send_status(status, ModelStatus::failed(model_id, PluginError::AsyncModel));
            return;
        }
        let Some(process) = self.process_fns.get(model_id).map(|f| Arc::clone(&f)) else {
            send_status(status, ModelStatus::failed(model_id, PluginError::NotFound));
            return;
        };

        let input = ModelInput {
            transaction_id: transaction_id.to_string(),
            payload: payload.to_string(),
        };
        match process(input) {
            Ok(results) => {
                let Some(store) = self.results.get(transaction_id) else {
                    send_status(
                        status,
                        ModelStatus::failed(model_id, PluginError::ResultsNotFound),
                    );
                    return;
                };
                let prob_attack = results.prob_attack;
                store.insert(model_id.to_string(), results);
                send_status(status, ModelStatus::ok(model_id, prob_attack));
            }
            Err(err) => send_status(status, ModelStatus::failed(model_id, err)),
        }
    }

    /// Remote dispatch: publish the payload on the model's bus subject. The
    /// reply arrives asynchronously through the result listener.
    pub async fn add_to_queue(
        &self,
        model_id: &str,
        transaction_id: &str,
        payload: &str,
    ) -> Result<(), WaceError> {
        let Some(client) = &self.nats else {
            return Err(WaceError::BusDisconnected);
        };
        let input = ModelInput {
            transaction_id: transaction_id.to_string(),
            payload: payload.to_string(),
        };
        let payload = serde_json::to_vec(&input)?;
        client
            .publish(model_id.to_string(), payload.into())
            .await
            .map_err(|err| WaceError::BusPublish(err.to_string()))
    }

    /// Run the decision plugin over everything collected for the
    /// transaction.
    pub fn check_result(
        &self,
        transaction_id: &str,
        decision_id: &str,
        waf_data: std::collections::HashMap<String, String>,
    ) -> Result<bool, WaceError> {
        let Some(check) = self.check_fns.get(decision_id).map(|f| Arc::clone(&f)) else {
            return Err(WaceError::DecisionNotFound(decision_id.to_string()));
        };
        let Some(store) = self.results.get(transaction_id) else {
            return Err(WaceError::ResultsNotFound(transaction_id.to_string()));
        };

        let mut results = std::collections::HashMap::new();
        let mut model_weight = std::collections::HashMap::new();
        for entry in store.iter() {
            results.insert(entry.key().clone(), entry.value().clone());
            let weight = self
                .config
                .model(entry.key())
                .map(|m| m.weight)
                .unwrap_or_default();
            model_weight.insert(entry.key().clone(), weight);
        }
        drop(store);

        let verdict = check(DecisionInput {
            transaction_id: transaction_id.to_string(),
            results,
            model_weight,
            waf_data,
        })?;
        info!(
            transaction = %transaction_id,
            decision = %decision_id,
            block = verdict,
            "transaction checked"
        );
        Ok(verdict)
    }

    /// Tear down everything keyed by the transaction: status channels in
    /// both maps and the result store. Dropping the senders closes the
    /// channels; any in-flight writer gets a send error and drops its
    /// status.
    pub fn close_transaction(&self, transaction_id: &str) {
        if self.sync_channels.remove(transaction_id).is_none() {
            error!(transaction = %transaction_id, "transaction not found");
        }
        self.async_channels.remove(transaction_id);
        self.results.remove(transaction_id);
    }

    /// One long-lived subscriber per remote/async model, routing published
    /// results back into the per-transaction channels.
    fn spawn_result_listener(manager: &Arc<Self>, model_id: String) {
        let Some(client) = manager.nats.clone() else {
            warn!(model = %model_id, "bus not connected, result listener not started");
            return;
        };
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            let mut subscription = match client.subscribe(results_subject(&model_id)).await {
                Ok(sub) => sub,
                Err(err) => {
                    error!(model = %model_id, "failed to subscribe to model results queue: {err}");
                    return;
                }
            };
            info!(model = %model_id, "listening for messages on model results queue");
            while let Some(msg) = subscription.next().await {
                let manager = Arc::clone(&manager);
                let model_id = model_id.clone();
                tokio::spawn(async move {
                    match serde_json::from_slice::<ModelReply>(&msg.payload) {
                        Ok(reply) => manager.route_reply(&model_id, reply),
                        Err(_) => error!(model = %model_id, "failed to parse JSON payload"),
                    }
                });
            }
        });
    }

    /// Deliver a bus reply to the channel registered for the model's
    /// configured segment. Sync-mode replies also land in the result store;
    /// async-mode replies are notification-only. A missing transaction or
    /// channel is logged and the reply dropped.
    fn route_reply(&self, model_id: &str, reply: ModelReply) {
        let Some(model) = self.config.model(model_id) else {
            error!(model = %model_id, "model not configured, dropping result");
            return;
        };
        let channels = match model.mode {
            PluginMode::Async => &self.async_channels,
            PluginMode::Sync => &self.sync_channels,
        };
        let Some(transaction_channels) = channels.get(&reply.transaction_id) else {
            error!(
                transaction = %reply.transaction_id,
                model = %model_id,
                "transaction not found, dropping result"
            );
            return;
        };
        let Some(sender) = transaction_channels.get(&model.segment) else {
            error!(
                transaction = %reply.transaction_id,
                model = %model_id,
                "no channel registered for segment {}, dropping result",
                model.segment
            );
            return;
        };

        if let Some(err) = reply.error {
            send_status(
                &sender,
                ModelStatus::failed(model_id, PluginError::Runtime(err)),
            );
            return;
        }
        if model.mode != PluginMode::Async {
            let Some(store) = self.results.get(&reply.transaction_id) else {
                send_status(
                    &sender,
                    ModelStatus::failed(model_id, PluginError::ResultsNotFound),
                );
                return;
            };
            store.insert(model_id.to_string(), reply.results.clone());
        }
        send_status(&sender, ModelStatus::ok(model_id, reply.results.prob_attack));
    }
}

fn send_status(sender: &StatusSender, status: ModelStatus) {
    if let Err(err) = sender.send(status) {
        warn!(
            model = %err.0.model_id,
            "status channel closed, dropping model result"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use opentelemetry::metrics::MeterProvider;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    struct TrivialModel {
        prob: f64,
    }

    impl ModelExtension for TrivialModel {
        fn init(&self, _params: &HashMap<String, String>, _meter: &Meter) -> Result<(), PluginError> {
            Ok(())
        }

        fn process(&self, input: ModelInput) -> Result<ModelResults, PluginError> {
            Ok(ModelResults {
                prob_attack: self.prob,
                data: HashMap::from([("length".to_string(), json!(input.payload.len()))]),
            })
        }
    }

    struct BrokenModel;

    impl ModelExtension for BrokenModel {
        fn init(&self, _params: &HashMap<String, String>, _meter: &Meter) -> Result<(), PluginError> {
            Ok(())
        }

        fn process(&self, _input: ModelInput) -> Result<ModelResults, PluginError> {
            Err(PluginError::Runtime("model exploded".to_string()))
        }
    }

    struct ThresholdDecision;

    impl DecisionExtension for ThresholdDecision {
        fn init(&self, _params: &HashMap<String, String>, _meter: &Meter) -> Result<(), PluginError> {
            Ok(())
        }

        fn check_results(&self, input: DecisionInput) -> Result<bool, PluginError> {
            Ok(input.results.values().any(|r| r.prob_attack >= 0.5))
        }
    }

    fn test_meter() -> Meter {
        opentelemetry_sdk::metrics::SdkMeterProvider::default().meter("wace-test")
    }

    fn stub_file() -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"stub").unwrap();
        f
    }

    fn test_config(stub: &NamedTempFile, extra: &str) -> Arc<ConfigStore> {
        // natsurl points at a closed port so construction fails fast instead
        // of finding a broker that may be running on the host.
        let yaml = format!(
            r#"---
logpath: "/dev/null"
loglevel: ERROR
natsurl: "localhost:1"
modelplugins:
  - id: "trivial"
    path: "{p}"
    weight: 1
    plugintype: "RequestHeaders"
    mode: sync
  - id: "wildcard"
    path: "{p}"
    weight: 2
    plugintype: "Everything"
    mode: sync
  - id: "broken"
    path: "{p}"
    weight: 1
    plugintype: "Everything"
    mode: sync
  - id: "offline"
    path: "{p}"
    weight: 1
    plugintype: "RequestHeaders"
    mode: async
{extra}decisionplugins:
  - id: "simple"
    path: "{p}"
    wafweight: 0.5
    decisionbalance: 0.5
"#,
            p = stub.path().display()
        );
        Arc::new(ConfigStore::from_yaml(&yaml).expect("test config"))
    }

    fn test_registry() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::new();
        registry.register_model("trivial", Arc::new(TrivialModel { prob: 0.42 }));
        registry.register_model("wildcard", Arc::new(TrivialModel { prob: 0.9 }));
        registry.register_model("broken", Arc::new(BrokenModel));
        registry.register_model("offline", Arc::new(TrivialModel { prob: 0.1 }));
        registry.register_decision("simple", Arc::new(ThresholdDecision));
        registry
    }

    async fn test_manager() -> Arc<PluginManager> {
        let stub = stub_file();
        let config = test_config(&stub, "");
        PluginManager::new(config, &test_registry(), test_meter()).await
    }

    #[tokio::test]
    async fn unregistered_plugins_are_skipped() {
        let stub = stub_file();
        let extra = format!(
            "  - id: \"ghost\"\n    path: \"{}\"\n    plugintype: \"RequestBody\"\n",
            stub.path().display()
        );
        let config = test_config(&stub, &extra);
        let manager = PluginManager::new(config, &test_registry(), test_meter()).await;
        assert!(manager.models.contains_key("trivial"));
        assert!(!manager.models.contains_key("ghost"));
    }

    #[tokio::test]
    async fn sync_only_extension_cannot_load_as_async() {
        let stub = stub_file();
        // "offline" is configured async but TrivialModel has no async entry
        // point, so it must be skipped at load time.
        let config = test_config(&stub, "");
        let manager = PluginManager::new(config, &test_registry(), test_meter()).await;
        assert!(!manager.models.contains_key("offline"));
    }

    #[tokio::test]
    async fn process_stores_result_and_reports_status() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.process("trivial", "t1", "some headers", SegmentType::RequestHeaders, &tx);

        let status = rx.recv().await.expect("status delivered");
        assert_eq!(status.model_id, "trivial");
        assert!(status.error.is_none());
        assert_eq!(status.prob_attack, 0.42);

        let stored = manager.results.get("t1").unwrap();
        let result = stored.get("trivial").expect("result stored");
        assert_eq!(result.prob_attack, 0.42);
        assert_eq!(result.data["length"], json!("some headers".len()));
    }

    #[tokio::test]
    async fn process_rejects_unknown_and_incompatible_models() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.process("nonexistent", "t1", "x", SegmentType::RequestHeaders, &tx);
        let status = rx.recv().await.unwrap();
        assert!(matches!(status.error, Some(PluginError::NotFound)));

        manager.process("trivial", "t1", "x", SegmentType::ResponseBody, &tx);
        let status = rx.recv().await.unwrap();
        assert!(matches!(status.error, Some(PluginError::Incompatible(_, _))));

        assert!(manager.results.get("t1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_accepts_any_segment_for_wildcard_models() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        for segment in [
            SegmentType::RequestHeaders,
            SegmentType::AllRequest,
            SegmentType::ResponseBody,
        ] {
            manager.process("wildcard", "t1", "x", segment, &tx);
            let status = rx.recv().await.unwrap();
            assert!(status.error.is_none(), "wildcard rejected {segment}");
        }
    }

    #[tokio::test]
    async fn process_keeps_plugin_errors_out_of_the_store() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.process("broken", "t1", "x", SegmentType::RequestHeaders, &tx);
        let status = rx.recv().await.unwrap();
        assert!(matches!(status.error, Some(PluginError::Runtime(_))));
        assert!(manager.results.get("t1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_result_snapshots_results_and_weights() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.process("trivial", "t1", "x", SegmentType::RequestHeaders, &tx);
        manager.process("wildcard", "t1", "x", SegmentType::RequestHeaders, &tx);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let verdict = manager
            .check_result("t1", "simple", HashMap::new())
            .expect("decision ran");
        // wildcard reports 0.9, over the 0.5 threshold
        assert!(verdict);
    }

    #[tokio::test]
    async fn check_result_rejects_unknown_ids() {
        let manager = test_manager().await;
        manager.init_transaction("t1");

        assert!(matches!(
            manager.check_result("t1", "nonexistent", HashMap::new()),
            Err(WaceError::DecisionNotFound(_))
        ));
        assert!(matches!(
            manager.check_result("never-opened", "simple", HashMap::new()),
            Err(WaceError::ResultsNotFound(_))
        ));
    }

    #[tokio::test]
    async fn close_transaction_erases_every_key() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (sync_tx, _sync_rx) = mpsc::unbounded_channel();
        let (async_tx, _async_rx) = mpsc::unbounded_channel();
        manager.add_model_channel("t1", SegmentType::RequestHeaders, sync_tx, ChannelMode::Sync);
        manager.add_model_channel("t1", SegmentType::RequestHeaders, async_tx, ChannelMode::Async);

        manager.close_transaction("t1");

        assert!(!manager.sync_channels.contains_key("t1"));
        assert!(!manager.async_channels.contains_key("t1"));
        assert!(!manager.results.contains_key("t1"));
    }

    #[tokio::test]
    async fn removing_last_async_channel_erases_the_transaction_entry() {
        let manager = test_manager().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_model_channel("t1", SegmentType::RequestHeaders, tx.clone(), ChannelMode::Async);
        manager.add_model_channel("t1", SegmentType::RequestBody, tx, ChannelMode::Async);

        manager.remove_async_model_channel("t1", SegmentType::RequestHeaders);
        assert!(manager.async_channels.contains_key("t1"));

        manager.remove_async_model_channel("t1", SegmentType::RequestBody);
        assert!(!manager.async_channels.contains_key("t1"));
    }

    #[tokio::test]
    async fn route_reply_stores_sync_results_before_notifying() {
        let manager = test_manager().await;
        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.add_model_channel("t1", SegmentType::RequestHeaders, tx, ChannelMode::Sync);

        manager.route_reply(
            "trivial",
            ModelReply {
                transaction_id: "t1".to_string(),
                results: ModelResults {
                    prob_attack: 0.8,
                    data: HashMap::new(),
                },
                error: None,
            },
        );

        let status = rx.recv().await.unwrap();
        assert!(status.error.is_none());
        assert_eq!(status.prob_attack, 0.8);
        assert_eq!(
            manager.results.get("t1").unwrap().get("trivial").unwrap().prob_attack,
            0.8
        );
    }

    #[tokio::test]
    async fn route_reply_keeps_async_results_out_of_the_store() {
        let stub = stub_file();
        let config = test_config(&stub, "");
        let mut registry = test_registry();
        // give the async model an async entry point so it loads
        struct AsyncModel;
        impl ModelExtension for AsyncModel {
            fn init_async(
                &self,
                _params: &HashMap<String, String>,
                _meter: &Meter,
                register: &mut dyn FnMut(ProcessFn),
            ) -> Result<(), PluginError> {
                register(Arc::new(|_input| Ok(ModelResults::default())));
                Ok(())
            }
        }
        registry.register_model("offline", Arc::new(AsyncModel));
        let manager = PluginManager::new(config, &registry, test_meter()).await;

        manager.init_transaction("t1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.add_model_channel("t1", SegmentType::RequestHeaders, tx, ChannelMode::Async);

        manager.route_reply(
            "offline",
            ModelReply {
                transaction_id: "t1".to_string(),
                results: ModelResults {
                    prob_attack: 0.6,
                    data: HashMap::new(),
                },
                error: None,
            },
        );

        let status = rx.recv().await.unwrap();
        assert!(status.error.is_none());
        assert_eq!(status.prob_attack, 0.6);
        assert!(manager.results.get("t1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn route_reply_drops_replies_for_unknown_transactions() {
        let manager = test_manager().await;
        // no transaction, no channels: must log and drop, not panic
        manager.route_reply(
            "trivial",
            ModelReply {
                transaction_id: "never-opened".to_string(),
                results: ModelResults::default(),
                error: None,
            },
        );

        // closed receiver: send path must be guarded
        manager.init_transaction("t2");
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        manager.add_model_channel("t2", SegmentType::RequestHeaders, tx, ChannelMode::Sync);
        manager.route_reply(
            "trivial",
            ModelReply {
                transaction_id: "t2".to_string(),
                results: ModelResults::default(),
                error: None,
            },
        );
    }

    #[tokio::test]
    async fn add_to_queue_without_bus_returns_an_error() {
        let manager = test_manager().await;
        assert!(matches!(
            manager.add_to_queue("trivial", "t1", "payload").await,
            Err(WaceError::BusDisconnected)
        ));
    }
}
