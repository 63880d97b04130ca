//! The transaction lifecycle and fan-out coordinator.
//!
//! One [`Wace`] instance owns the plugin manager and the per-transaction
//! gates. Every [`analyze`](Wace::analyze) call launches one dispatch round
//! in the background and bumps the transaction's round counter;
//! [`check_transaction`](Wace::check_transaction) waits for as many "done"
//! signals as rounds were launched before running the decision plugin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::{ConfigStore, SegmentType};
use crate::error::WaceError;
use crate::logger;
use crate::message::ModelStatus;
use crate::plugin::manager::{ChannelMode, PluginManager};
use crate::plugin::registry::ExtensionRegistry;

/// Synchronizes the analysis of one transaction. Each analyze round bumps
/// `counter` and sends one message on the done channel when its synchronous
/// models have all reported; `check_transaction` drains `counter` messages
/// before invoking the decision plugin.
struct TransactionGate {
    counter: AtomicI64,
    done_tx: UnboundedSender<()>,
    done_rx: Mutex<UnboundedReceiver<()>>,
}

impl TransactionGate {
    fn new() -> Arc<Self> {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            counter: AtomicI64::new(0),
            done_tx,
            done_rx: Mutex::new(done_rx),
        })
    }
}

#[derive(Clone)]
struct CoreMetrics {
    model_duration: Histogram<u64>,
    blocked_requests: Counter<u64>,
}

impl CoreMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            model_duration: meter
                .u64_histogram("wace.model.duration.nanoseconds")
                .with_description("Time from dispatch to model status per invocation")
                .build(),
            blocked_requests: meter
                .u64_counter("wace.client.request.blocked.total")
                .with_description("Transactions the decision plugin chose to block")
                .build(),
        }
    }

    fn observe(&self, transaction_id: &str, mode: &'static str, started: Instant, status: &ModelStatus) {
        match &status.error {
            None => {
                debug!(
                    transaction = %transaction_id,
                    model = %status.model_id,
                    "{mode} model finished. Result: {:.5}",
                    status.prob_attack
                );
                self.model_duration.record(
                    started.elapsed().as_nanos() as u64,
                    &[
                        KeyValue::new("model_id", status.model_id.clone()),
                        KeyValue::new("model_mode", mode),
                        KeyValue::new("attack_probability", status.prob_attack),
                    ],
                );
            }
            Some(err) => {
                warn!(
                    transaction = %transaction_id,
                    model = %status.model_id,
                    "{err}"
                );
            }
        }
    }
}

/// The coordination core. Construct once with [`Wace::init`]; all five
/// public operations hang off it.
pub struct Wace {
    config: Arc<ConfigStore>,
    plugins: Arc<PluginManager>,
    analysis: DashMap<String, Arc<TransactionGate>>,
    metrics: CoreMetrics,
}

impl Wace {
    /// Load the logger, connect the bus and construct the plugin manager
    /// from the extension registry.
    pub async fn init(
        config: Arc<ConfigStore>,
        registry: &ExtensionRegistry,
        meter: Meter,
    ) -> Result<Self, WaceError> {
        logger::init(config.log_path(), config.log_level())
            .map_err(|err| WaceError::Logging(err.to_string()))?;
        debug!("loading plugin manager");
        let plugins = PluginManager::new(Arc::clone(&config), registry, meter.clone()).await;
        debug!("plugin manager loaded");
        Ok(Self {
            config,
            plugins,
            analysis: DashMap::new(),
            metrics: CoreMetrics::new(&meter),
        })
    }

    /// Open a transaction: fresh gate with a zero round counter, empty
    /// result store.
    pub fn init_transaction(&self, transaction_id: &str) {
        debug!(transaction = %transaction_id, "initializing transaction");
        self.analysis
            .insert(transaction_id.to_string(), TransactionGate::new());
        self.plugins.init_transaction(transaction_id);
    }

    /// Dispatch one analysis round for the given segment payload to the
    /// listed models. Returns immediately; the round runs in the
    /// background. An empty model list is a no-op. Must be called from
    /// within the runtime.
    pub fn analyze(
        &self,
        segment_name: &str,
        transaction_id: &str,
        payload: &str,
        models: &[String],
    ) -> Result<(), WaceError> {
        if models.is_empty() {
            return Ok(());
        }
        let segment: SegmentType = segment_name.parse().map_err(|err: crate::config::BadSegmentError| {
            error!(transaction = %transaction_id, "{segment_name} is not a valid type");
            WaceError::from(err)
        })?;
        debug!(
            transaction = %transaction_id,
            "analyzing {segment_name}: [{}...]",
            payload.lines().next().unwrap_or_default()
        );

        // A transaction analyzed without init_transaction still gets a gate.
        let gate = Arc::clone(
            &self
                .analysis
                .entry(transaction_id.to_string())
                .or_insert_with(TransactionGate::new),
        );
        gate.counter.fetch_add(1, Ordering::SeqCst);

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (async_tx, async_rx) = mpsc::unbounded_channel();
        self.plugins
            .add_model_channel(transaction_id, segment, async_tx, ChannelMode::Async);
        self.plugins
            .add_model_channel(transaction_id, segment, sync_tx.clone(), ChannelMode::Sync);

        let round = DispatchRound {
            sync_tx,
            config: Arc::clone(&self.config),
            plugins: Arc::clone(&self.plugins),
            metrics: self.metrics.clone(),
            gate,
            transaction_id: transaction_id.to_string(),
            payload: payload.to_string(),
            segment,
            models: models.to_vec(),
        };
        tokio::spawn(round.run(sync_rx, async_rx));
        Ok(())
    }

    /// Wait for every round launched so far to finish its synchronous
    /// models, then run the decision plugin over the aggregated results.
    ///
    /// Callers must not run `analyze` and `check_transaction` for the same
    /// transaction id concurrently: the gate counter is snapshotted at call
    /// time and rounds added during the wait would not be counted.
    pub async fn check_transaction(
        &self,
        transaction_id: &str,
        decision_id: &str,
        waf_data: HashMap<String, String>,
    ) -> Result<bool, WaceError> {
        debug!(transaction = %transaction_id, "checking transaction");
        let gate = self
            .analysis
            .get(transaction_id)
            .map(|g| Arc::clone(&g))
            .ok_or_else(|| WaceError::UnknownTransaction(transaction_id.to_string()))?;

        debug!(transaction = %transaction_id, "waiting for all models to finish...");
        let pending = gate.counter.load(Ordering::SeqCst);
        {
            let mut done_rx = gate.done_rx.lock().await;
            for _ in 0..pending {
                if done_rx.recv().await.is_none() {
                    break;
                }
            }
        }
        gate.counter.store(0, Ordering::SeqCst);

        debug!(transaction = %transaction_id, "done, checking data...");
        let result = self
            .plugins
            .check_result(transaction_id, decision_id, waf_data);
        match &result {
            Ok(block) => {
                debug!(
                    transaction = %transaction_id,
                    "transaction checked successfully. Blocking transaction: {block}"
                );
                if *block {
                    self.metrics.blocked_requests.add(
                        1,
                        &[KeyValue::new("decision_id", decision_id.to_string())],
                    );
                }
            }
            Err(err) => {
                error!(transaction = %transaction_id, "could not check transaction: {err}");
            }
        }
        result
    }

    /// Tear down the transaction: channels and results in the plugin
    /// manager, then the gate. Only call after `check_transaction` returned,
    /// or when loss of in-flight results is acceptable.
    pub fn close_transaction(&self, transaction_id: &str) {
        self.plugins.close_transaction(transaction_id);
        self.analysis.remove(transaction_id);
    }
}

/// One analyze round: classify the requested models, fan out, and signal
/// the gate once every synchronous dispatch has reported.
struct DispatchRound {
    config: Arc<ConfigStore>,
    plugins: Arc<PluginManager>,
    metrics: CoreMetrics,
    gate: Arc<TransactionGate>,
    transaction_id: String,
    payload: String,
    segment: SegmentType,
    models: Vec<String>,
    sync_tx: crate::plugin::manager::StatusSender,
}

impl DispatchRound {
    async fn run(
        self,
        mut sync_rx: UnboundedReceiver<ModelStatus>,
        mut async_rx: UnboundedReceiver<ModelStatus>,
    ) {
        let started = Instant::now();
        let mut sync_count = 0usize;
        let mut async_count = 0usize;

        for model_id in &self.models {
            debug!(transaction = %self.transaction_id, model = %model_id, "calling from core");
            let Some(model) = self.config.model(model_id) else {
                error!(
                    transaction = %self.transaction_id,
                    "model plugin {model_id} not found"
                );
                continue;
            };
            if !model.segment.accepts(self.segment) {
                error!(
                    transaction = %self.transaction_id,
                    "model plugin {model_id} is not of type {}",
                    self.segment
                );
                continue;
            }
            if self.config.is_async(model_id) {
                async_count += 1;
                self.spawn_publish(model_id.clone());
            } else {
                if model.remote {
                    self.spawn_publish(model_id.clone());
                } else {
                    self.spawn_process(model_id.clone());
                }
                sync_count += 1;
            }
        }

        // Async statuses do not gate the decision; drain them in a detached
        // task that finally unregisters the round's async channel.
        let plugins = Arc::clone(&self.plugins);
        let metrics = self.metrics.clone();
        let transaction_id = self.transaction_id.clone();
        let segment = self.segment;
        tokio::spawn(async move {
            debug!(
                transaction = %transaction_id,
                "waiting for {async_count} async model plugins to finish"
            );
            for _ in 0..async_count {
                match async_rx.recv().await {
                    Some(status) => metrics.observe(&transaction_id, "async", started, &status),
                    None => break,
                }
            }
            plugins.remove_async_model_channel(&transaction_id, segment);
        });

        debug!(
            transaction = %self.transaction_id,
            "waiting for {sync_count} sync model plugins to finish"
        );
        for _ in 0..sync_count {
            match sync_rx.recv().await {
                Some(status) => {
                    self.metrics
                        .observe(&self.transaction_id, "sync", started, &status)
                }
                None => break,
            }
        }

        if self.gate.done_tx.send(()).is_err() {
            error!(
                transaction = %self.transaction_id,
                "could not signal analysis completion, gate is gone"
            );
        }
    }

    fn spawn_publish(&self, model_id: String) {
        let plugins = Arc::clone(&self.plugins);
        let transaction_id = self.transaction_id.clone();
        let payload = self.payload.clone();
        tokio::spawn(async move {
            if let Err(err) = plugins
                .add_to_queue(&model_id, &transaction_id, &payload)
                .await
            {
                error!(
                    transaction = %transaction_id,
                    model = %model_id,
                    "could not publish to model queue: {err}"
                );
            }
        });
    }

    fn spawn_process(&self, model_id: String) {
        let plugins = Arc::clone(&self.plugins);
        let transaction_id = self.transaction_id.clone();
        let payload = self.payload.clone();
        let segment = self.segment;
        let status = self.sync_tx.clone();
        tokio::task::spawn_blocking(move || {
            plugins.process(&model_id, &transaction_id, &payload, segment, &status);
        });
    }
}
