/*
[INPUT]:  Order intents from the strategy layer, WS + REST OrderGateways, execution report stream
[OUTPUT]: Tracked order states, append-only execution log, submission breaker status
[POS]:    Execution layer - order lifecycle (submit / cancel / amend / reports / cleanup)
[UPDATE]: When changing fallback rules, report handling, or maintenance cadence
*/

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use exlink_adapter::{
    AmendAck, AmendRequest, BreakerStatus, CancelAck, CircuitBreaker, ExchangeError,
    ExecutionReport, OrderAck, OrderGateway, OrderIntent, OrderRef,
};

use super::order_state::{
    Execution, OrderState, OrderStatus, OrderTracker, OrderTrackerError, Registration,
    ReportOutcome,
};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderManagerConfig {
    pub request_timeout_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Pending orders older than this are looked up over REST.
    pub ack_timeout_secs: u64,
    /// Terminal orders are dropped after this long.
    pub retention_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Fills kept in the global log; `0` keeps every fill.
    pub execution_log_capacity: usize,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 60,
            ack_timeout_secs: 30,
            retention_secs: 3_600,
            maintenance_interval_secs: 60,
            execution_log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub queried: usize,
    pub updated: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderHealth {
    pub tracked: usize,
    pub pending: usize,
    pub open: usize,
    pub terminal: usize,
    pub executions_logged: usize,
    pub executions_evicted: u64,
    pub breaker: BreakerStatus,
}

#[derive(Debug, Clone)]
enum GatewayCall {
    Add(OrderIntent),
    Cancel(OrderRef),
    Amend(OrderRef, AmendRequest),
    BatchCancel(Vec<OrderRef>),
}

#[derive(Debug)]
enum GatewayReply {
    Added(OrderAck),
    Cancelled(CancelAck),
    Amended(AmendAck),
}

struct Dispatched {
    result: std::result::Result<GatewayReply, ExchangeError>,
    via: &'static str,
    /// An earlier attempt may have reached the exchange.
    uncertain: bool,
}

#[derive(Clone)]
struct Gateways {
    primary: Option<Arc<dyn OrderGateway>>,
    fallback: Arc<dyn OrderGateway>,
    timeout_ms: u64,
}

impl Gateways {
    async fn invoke(
        &self,
        gateway: &dyn OrderGateway,
        call: &GatewayCall,
    ) -> std::result::Result<GatewayReply, ExchangeError> {
        let request = async {
            match call {
                GatewayCall::Add(intent) => gateway.add_order(intent).await.map(GatewayReply::Added),
                GatewayCall::Cancel(target) => {
                    gateway.cancel_order(target).await.map(GatewayReply::Cancelled)
                }
                GatewayCall::Amend(target, amend) => gateway
                    .amend_order(target, amend)
                    .await
                    .map(GatewayReply::Amended),
                GatewayCall::BatchCancel(targets) => {
                    gateway.batch_cancel(targets).await.map(GatewayReply::Cancelled)
                }
            }
        };
        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), request).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout {
                duration_ms: self.timeout_ms,
            }),
        }
    }

    /// Primary first; the fallback only runs when the primary failed without
    /// a definitive answer.
    async fn dispatch(&self, call: GatewayCall) -> Dispatched {
        let mut uncertain = false;
        if let Some(primary) = &self.primary {
            match self.invoke(primary.as_ref(), &call).await {
                Ok(reply) => {
                    return Dispatched {
                        result: Ok(reply),
                        via: primary.name(),
                        uncertain: false,
                    };
                }
                Err(err) if should_fall_back(&err) => {
                    uncertain = err.is_transport();
                    warn!(via = primary.name(), error = %err, "order call failed, falling back");
                }
                Err(err) => {
                    return Dispatched {
                        result: Err(err),
                        via: primary.name(),
                        uncertain: false,
                    };
                }
            }
        }

        Dispatched {
            result: self.invoke(self.fallback.as_ref(), &call).await,
            via: self.fallback.name(),
            uncertain,
        }
    }
}

fn should_fall_back(err: &ExchangeError) -> bool {
    err.is_transport() || err.is_auth_error() || matches!(err, ExchangeError::Unsupported(_))
}

#[derive(Debug, Default)]
struct ExecutionLog {
    entries: VecDeque<Execution>,
    capacity: usize,
    evicted: u64,
}

impl ExecutionLog {
    fn push(&mut self, execution: Execution) {
        if self.capacity > 0
            && self.entries.len() >= self.capacity
            && let Some(oldest) = self.entries.pop_front()
        {
            self.evicted += 1;
            if self.evicted == 1 || self.evicted % self.capacity as u64 == 0 {
                warn!(
                    evicted = self.evicted,
                    capacity = self.capacity,
                    exec_id = %oldest.exec_id,
                    "execution log full, evicting oldest fills"
                );
            }
        }
        self.entries.push_back(execution);
    }
}

struct Shared {
    tracker: Mutex<OrderTracker>,
    /// One entry per submission in flight; flips to `true` once applied.
    inflight: StdMutex<HashMap<String, watch::Sender<bool>>>,
    executions: Mutex<ExecutionLog>,
    breaker: CircuitBreaker,
    resync: Notify,
}

/// Clears the in-flight entry for an order when the submission finishes.
struct InflightSlot {
    shared: Arc<Shared>,
    cl_ord_id: String,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        if let Some(done) = self.shared.inflight().remove(&self.cl_ord_id) {
            done.send_replace(true);
        }
    }
}

enum Admission {
    Tracked(Box<OrderState>),
    Wait(watch::Receiver<bool>),
    Dispatch,
}

impl Shared {
    fn inflight(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn record_execution(&self, execution: Execution) {
        self.executions.lock().await.push(execution);
    }

    async fn apply_submission(&self, cl_ord_id: &str, dispatched: Dispatched) -> Result<OrderState> {
        let now = Instant::now();
        match dispatched.result {
            Ok(GatewayReply::Added(ack)) => {
                self.breaker.record_success();
                let mut tracker = self.tracker.lock().await;
                if let Some(echo) = &ack.cl_ord_id
                    && echo != cl_ord_id
                {
                    warn!(cl_ord_id, echo = %echo, "ack echoed a different cl_ord_id");
                }
                match tracker.acknowledge(cl_ord_id, &ack.order_id, dispatched.via, now) {
                    Ok(state) => {
                        info!(cl_ord_id, order_id = %ack.order_id, via = dispatched.via, "order acknowledged");
                        Ok(state.clone())
                    }
                    Err(err) => {
                        warn!(cl_ord_id, error = %err, "ack not merged");
                        tracker
                            .get(cl_ord_id)
                            .cloned()
                            .ok_or_else(|| CoreError::UnknownOrder {
                                cl_ord_id: cl_ord_id.to_string(),
                            })
                    }
                }
            }
            Ok(other) => Err(CoreError::Exchange(ExchangeError::InvalidResponse(format!(
                "unexpected reply to add_order: {other:?}"
            )))),
            Err(err)
                if err.is_transport()
                    || (dispatched.uncertain && !matches!(err, ExchangeError::OrderRejected { .. })) =>
            {
                self.breaker.record_failure();
                warn!(cl_ord_id, error = %err, "submission outcome unknown; order stays pending");
                Err(CoreError::SubmissionUncertain {
                    cl_ord_id: cl_ord_id.to_string(),
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                let reason = CoreError::rejection_reason(&err);
                let mut tracker = self.tracker.lock().await;
                if let Some(live) = tracker.get(cl_ord_id).filter(|order| order.order_id.is_some()) {
                    warn!(cl_ord_id, reason = %reason, "rejection ignored, order already acknowledged");
                    return Ok(live.clone());
                }
                self.breaker.record_failure();
                if let Err(track_err) = tracker.mark_rejected(cl_ord_id, reason.clone(), now) {
                    warn!(cl_ord_id, error = %track_err, "rejected order not tracked");
                }
                drop(tracker);
                warn!(cl_ord_id, reason = %reason, "order rejected");
                Err(CoreError::OrderRejected {
                    cl_ord_id: cl_ord_id.to_string(),
                    reason,
                })
            }
        }
    }
}

/// WS-first order lifecycle with REST fallback.
///
/// Exchange calls run in spawned tasks; a caller that stops waiting does not
/// cancel them, and their results are applied to the order table regardless.
pub struct OrderLifecycleManager {
    gateways: Gateways,
    shared: Arc<Shared>,
    config: OrderManagerConfig,
}

impl std::fmt::Debug for OrderLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderLifecycleManager")
            .field("primary", &self.gateways.primary.as_ref().map(|gateway| gateway.name()))
            .field("fallback", &self.gateways.fallback.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrderLifecycleManager {
    pub fn new(
        primary: Option<Arc<dyn OrderGateway>>,
        fallback: Arc<dyn OrderGateway>,
        config: OrderManagerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            "order_submission",
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        );
        Self {
            gateways: Gateways {
                primary,
                fallback,
                timeout_ms: config.request_timeout_ms,
            },
            shared: Arc::new(Shared {
                tracker: Mutex::new(OrderTracker::new()),
                inflight: StdMutex::new(HashMap::new()),
                executions: Mutex::new(ExecutionLog {
                    capacity: config.execution_log_capacity,
                    ..ExecutionLog::default()
                }),
                breaker,
                resync: Notify::new(),
            }),
            config,
        }
    }

    /// Submit an intent. Re-submitting a tracked `cl_ord_id` never creates a
    /// second order: acknowledged orders are returned as-is, a submission
    /// already in flight is awaited, and pending ones are re-sent under the
    /// same id.
    pub async fn submit(&self, intent: OrderIntent) -> Result<OrderState> {
        intent.validate().map_err(CoreError::InvalidOrder)?;
        let cl_ord_id = intent.cl_ord_id.clone();

        let admission = {
            let mut tracker = self.shared.tracker.lock().await;
            match tracker.get(&cl_ord_id) {
                Some(existing) if existing.intent != intent => {
                    return Err(CoreError::InvalidOrder(format!(
                        "cl_ord_id {cl_ord_id} already used for a different order"
                    )));
                }
                Some(existing) if existing.order_id.is_some() || existing.is_terminal() => {
                    Admission::Tracked(Box::new(existing.clone()))
                }
                _ => {
                    let mut inflight = self.shared.inflight();
                    if let Some(done) = inflight.get(&cl_ord_id) {
                        Admission::Wait(done.subscribe())
                    } else {
                        self.admit(&intent)?;
                        match tracker.register_pending(&intent, Instant::now()) {
                            Ok(Registration::Inserted) => {}
                            Ok(Registration::Existing(_)) => {
                                debug!(cl_ord_id = %cl_ord_id, "re-sending pending order");
                            }
                            Err(err) => return Err(CoreError::InvalidOrder(err.to_string())),
                        }
                        inflight.insert(cl_ord_id.clone(), watch::channel(false).0);
                        Admission::Dispatch
                    }
                }
            }
        };

        match admission {
            Admission::Tracked(state) => {
                debug!(cl_ord_id = %cl_ord_id, "duplicate submit, returning tracked order");
                Ok(*state)
            }
            Admission::Wait(done) => self.await_inflight(&cl_ord_id, done).await,
            Admission::Dispatch => {
                let slot = InflightSlot {
                    shared: self.shared.clone(),
                    cl_ord_id: cl_ord_id.clone(),
                };
                let gateways = self.gateways.clone();
                let shared = self.shared.clone();
                let task = tokio::spawn(async move {
                    let _slot = slot;
                    let cl_ord_id = intent.cl_ord_id.clone();
                    let dispatched = gateways.dispatch(GatewayCall::Add(intent)).await;
                    shared.apply_submission(&cl_ord_id, dispatched).await
                });

                task.await.unwrap_or_else(|join_err| {
                    Err(CoreError::SubmissionUncertain {
                        cl_ord_id,
                        reason: join_err.to_string(),
                    })
                })
            }
        }
    }

    /// Submission breaker gate.
    fn admit(&self, intent: &OrderIntent) -> Result<()> {
        self.shared.breaker.check().map_err(|err| {
            warn!(cl_ord_id = %intent.cl_ord_id, error = %err, "submission fast-rejected");
            match err {
                ExchangeError::CircuitOpen {
                    component,
                    remaining_secs,
                } => CoreError::CircuitOpen {
                    component,
                    remaining_secs,
                },
                other => CoreError::Exchange(other),
            }
        })
    }

    /// Wait for the submission already in flight for `cl_ord_id` and report
    /// what it left in the order table.
    async fn await_inflight(
        &self,
        cl_ord_id: &str,
        mut done: watch::Receiver<bool>,
    ) -> Result<OrderState> {
        debug!(cl_ord_id, "submission in flight, waiting for its outcome");
        // A dropped sender also means the submission finished.
        let _ = done.wait_for(|finished| *finished).await;

        let tracker = self.shared.tracker.lock().await;
        match tracker.get(cl_ord_id) {
            Some(state) if state.status == OrderStatus::Rejected => Err(CoreError::OrderRejected {
                cl_ord_id: cl_ord_id.to_string(),
                reason: state.reject_reason.clone().unwrap_or_default(),
            }),
            Some(state) if state.order_id.is_some() || state.is_terminal() => Ok(state.clone()),
            Some(_) => Err(CoreError::SubmissionUncertain {
                cl_ord_id: cl_ord_id.to_string(),
                reason: "concurrent submission left the order pending".to_string(),
            }),
            None => Err(CoreError::UnknownOrder {
                cl_ord_id: cl_ord_id.to_string(),
            }),
        }
    }

    /// Cancel by client id. Terminal orders succeed without a call.
    pub async fn cancel(&self, cl_ord_id: &str) -> Result<OrderState> {
        let target = match self.target_for(cl_ord_id).await? {
            Target::Done(state) => return Ok(*state),
            Target::Live(target) => target,
        };

        let gateways = self.gateways.clone();
        let shared = self.shared.clone();
        let id = cl_ord_id.to_string();
        let task = tokio::spawn(async move {
            let dispatched = gateways.dispatch(GatewayCall::Cancel(target)).await;
            match dispatched.result {
                Ok(_) => {
                    let mut tracker = shared.tracker.lock().await;
                    tracker.mark_cancelled(&id, Instant::now()).map_err(tracker_error)?;
                    info!(cl_ord_id = %id, via = dispatched.via, "order cancelled");
                    tracker
                        .get(&id)
                        .cloned()
                        .ok_or(CoreError::UnknownOrder { cl_ord_id: id })
                }
                Err(err) => {
                    warn!(cl_ord_id = %id, error = %err, "cancel failed");
                    Err(CoreError::Exchange(err))
                }
            }
        });

        task.await
            .unwrap_or_else(|join_err| Err(CoreError::Exchange(ExchangeError::Unavailable(join_err.to_string()))))
    }

    /// Amend quantity and/or prices of a live order.
    pub async fn amend(&self, cl_ord_id: &str, amend: AmendRequest) -> Result<OrderState> {
        if amend.is_empty() {
            return Err(CoreError::InvalidOrder("amend changes nothing".to_string()));
        }
        let target = match self.target_for(cl_ord_id).await? {
            Target::Done(state) => return Ok(*state),
            Target::Live(target) => target,
        };

        let gateways = self.gateways.clone();
        let shared = self.shared.clone();
        let id = cl_ord_id.to_string();
        let task = tokio::spawn(async move {
            let dispatched = gateways
                .dispatch(GatewayCall::Amend(target, amend.clone()))
                .await;
            match dispatched.result {
                Ok(_) => {
                    let mut tracker = shared.tracker.lock().await;
                    tracker
                        .apply_amend(&id, &amend, Instant::now())
                        .map_err(tracker_error)?;
                    debug!(cl_ord_id = %id, via = dispatched.via, "order amended");
                    tracker
                        .get(&id)
                        .cloned()
                        .ok_or(CoreError::UnknownOrder { cl_ord_id: id })
                }
                Err(err) => {
                    warn!(cl_ord_id = %id, error = %err, "amend failed");
                    Err(CoreError::Exchange(err))
                }
            }
        });

        task.await
            .unwrap_or_else(|join_err| Err(CoreError::Exchange(ExchangeError::Unavailable(join_err.to_string()))))
    }

    /// Cancel several orders: one WS batch message when possible, otherwise
    /// sequential REST cancels. Returns success per client id.
    pub async fn batch_cancel(&self, cl_ord_ids: &[String]) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        let mut live: Vec<(String, OrderRef)> = Vec::new();
        {
            let tracker = self.shared.tracker.lock().await;
            for cl_ord_id in cl_ord_ids {
                match tracker.get(cl_ord_id) {
                    None => {
                        results.insert(cl_ord_id.clone(), false);
                    }
                    Some(order) if order.is_terminal() => {
                        results.insert(cl_ord_id.clone(), true);
                    }
                    Some(order) => match &order.order_id {
                        Some(order_id) => {
                            live.push((cl_ord_id.clone(), OrderRef::Exchange(order_id.clone())))
                        }
                        None => {
                            results.insert(cl_ord_id.clone(), false);
                        }
                    },
                }
            }
        }
        if live.is_empty() {
            return results;
        }

        let gateways = self.gateways.clone();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let mut outcome: HashMap<String, bool> = HashMap::new();
            let mut batched = false;

            if let Some(primary) = &gateways.primary {
                let targets = live.iter().map(|(_, target)| target.clone()).collect();
                match gateways
                    .invoke(primary.as_ref(), &GatewayCall::BatchCancel(targets))
                    .await
                {
                    Ok(_) => {
                        batched = true;
                        for (cl_ord_id, _) in &live {
                            outcome.insert(cl_ord_id.clone(), true);
                        }
                    }
                    Err(err) if should_fall_back(&err) => {
                        warn!(error = %err, count = live.len(), "batch cancel failed, cancelling one by one");
                    }
                    Err(err) => {
                        warn!(error = %err, count = live.len(), "batch cancel rejected");
                        batched = true;
                        for (cl_ord_id, _) in &live {
                            outcome.insert(cl_ord_id.clone(), false);
                        }
                    }
                }
            }

            if !batched {
                for (cl_ord_id, target) in &live {
                    let ok = gateways
                        .invoke(gateways.fallback.as_ref(), &GatewayCall::Cancel(target.clone()))
                        .await
                        .map_err(|err| warn!(cl_ord_id = %cl_ord_id, error = %err, "cancel failed"))
                        .is_ok();
                    outcome.insert(cl_ord_id.clone(), ok);
                }
            }

            let now = Instant::now();
            let mut tracker = shared.tracker.lock().await;
            for (cl_ord_id, ok) in &outcome {
                if *ok && let Err(err) = tracker.mark_cancelled(cl_ord_id, now) {
                    warn!(cl_ord_id = %cl_ord_id, error = %err, "cancelled order not tracked");
                }
            }
            outcome
        });

        match task.await {
            Ok(outcome) => results.extend(outcome),
            Err(join_err) => {
                warn!(error = %join_err, "batch cancel task failed");
            }
        }
        for cl_ord_id in cl_ord_ids {
            results.entry(cl_ord_id.clone()).or_insert(false);
        }
        results
    }

    /// Apply one execution report. Reports for unknown orders are dropped.
    pub async fn ingest_report(&self, report: &ExecutionReport) -> Option<ReportOutcome> {
        let outcome = {
            let mut tracker = self.shared.tracker.lock().await;
            tracker.apply_report(report, Instant::now())
        };

        match outcome {
            Ok(outcome) => {
                if let Some(execution) = &outcome.execution {
                    debug!(
                        cl_ord_id = %execution.cl_ord_id,
                        exec_id = %execution.exec_id,
                        qty = %execution.qty,
                        "fill recorded"
                    );
                    self.shared.record_execution(execution.clone()).await;
                }
                if outcome.changed {
                    debug!(cl_ord_id = %outcome.cl_ord_id, status = ?outcome.status, "order updated");
                }
                Some(outcome)
            }
            Err(OrderTrackerError::UnknownOrder { order_id, cl_ord_id }) => {
                debug!(?order_id, ?cl_ord_id, "dropping report for unknown order");
                None
            }
            Err(err) => {
                warn!(error = %err, "report not applied");
                None
            }
        }
    }

    /// Consume execution reports until `shutdown` or the sender closes.
    pub async fn run_report_pump(
        &self,
        mut reports: broadcast::Receiver<ExecutionReport>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = reports.recv() => {
                    match received {
                        Ok(report) => {
                            self.ingest_report(&report).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "execution reports lagged, resyncing open orders");
                            self.request_resync();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("order report pump stopped");
    }

    /// Look up orders pending past the ack timeout over REST. Orders the
    /// exchange does not know are marked rejected.
    pub async fn reconcile_pending(&self) -> Result<ReconcileSummary> {
        let stale = self
            .shared
            .tracker
            .lock()
            .await
            .pending_older_than(Instant::now(), Duration::from_secs(self.config.ack_timeout_secs));
        if stale.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let reports = self.query_orders(&stale).await?;
        let mut summary = ReconcileSummary {
            queried: stale.len(),
            ..ReconcileSummary::default()
        };
        let mut resolved = HashSet::new();
        for report in &reports {
            if let Some(outcome) = self.ingest_report(report).await {
                resolved.insert(outcome.cl_ord_id);
                summary.updated += 1;
            }
        }

        let now = Instant::now();
        let mut tracker = self.shared.tracker.lock().await;
        for cl_ord_id in stale.iter().filter(|id| !resolved.contains(*id)) {
            if tracker.get(cl_ord_id).map(|order| order.status) != Some(OrderStatus::Pending) {
                continue;
            }
            match tracker.mark_rejected(cl_ord_id, "missing_on_exchange", now) {
                Ok(_) => summary.missing += 1,
                Err(err) => warn!(cl_ord_id = %cl_ord_id, error = %err, "missing order not tracked"),
            }
        }
        if summary.missing > 0 || summary.updated > 0 {
            info!(?summary, "reconciled pending orders");
        }
        Ok(summary)
    }

    /// Query every acknowledged, non-terminal order and apply the results.
    /// Used after reports may have been lost; absent orders are only logged.
    pub async fn reconcile_open(&self) -> Result<ReconcileSummary> {
        let live = self.shared.tracker.lock().await.open_order_ids();
        if live.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let reports = self.query_orders(&live).await?;
        let mut summary = ReconcileSummary {
            queried: live.len(),
            ..ReconcileSummary::default()
        };
        let mut seen = HashSet::new();
        for report in &reports {
            if let Some(outcome) = self.ingest_report(report).await {
                if outcome.changed {
                    summary.updated += 1;
                }
                seen.insert(outcome.cl_ord_id);
            }
        }
        summary.missing = live.iter().filter(|id| !seen.contains(*id)).count();
        if summary.missing > 0 {
            warn!(missing = summary.missing, "open orders absent from query result");
        }
        info!(?summary, "resynced open orders");
        Ok(summary)
    }

    /// Ask the maintenance task to resync open orders.
    pub fn request_resync(&self) {
        self.shared.resync.notify_one();
    }

    async fn query_orders(&self, cl_ord_ids: &[String]) -> Result<Vec<ExecutionReport>> {
        let timeout_ms = self.config.request_timeout_ms;
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.gateways.fallback.query_orders(cl_ord_ids),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExchangeError::Timeout { duration_ms: timeout_ms }.into()),
        }
    }

    /// Drop terminal orders past retention. Their fills stay in the log.
    pub async fn prune_terminal(&self) -> usize {
        let retention = Duration::from_secs(self.config.retention_secs);
        let pruned = self
            .shared
            .tracker
            .lock()
            .await
            .prune_terminal(Instant::now(), retention);
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned terminal orders");
        }
        pruned.len()
    }

    pub fn spawn_report_pump(
        self: Arc<Self>,
        reports: broadcast::Receiver<ExecutionReport>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_report_pump(reports, shutdown).await })
    }

    /// Periodic prune + pending reconciliation; open-order resync on request.
    pub fn spawn_maintenance(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.maintenance_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.prune_terminal().await;
                        if let Err(err) = self.reconcile_pending().await {
                            warn!(error = %err, "pending reconciliation failed");
                        }
                    }
                    _ = self.shared.resync.notified() => {
                        if let Err(err) = self.reconcile_open().await {
                            warn!(error = %err, "open order resync failed");
                        }
                    }
                }
            }
            debug!("order maintenance stopped");
        })
    }

    /// Request a resync whenever the execution stream reports a gap.
    pub fn spawn_gap_watch(
        self: Arc<Self>,
        mut gaps: watch::Receiver<u64>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = gaps.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let total = *gaps.borrow_and_update();
                        warn!(gaps = total, "execution stream gap, resyncing open orders");
                        self.request_resync();
                    }
                }
            }
            debug!("execution gap watch stopped");
        })
    }

    pub async fn orders(&self) -> Vec<OrderState> {
        self.shared.tracker.lock().await.snapshot()
    }

    pub async fn get(&self, cl_ord_id: &str) -> Option<OrderState> {
        self.shared.tracker.lock().await.get(cl_ord_id).cloned()
    }

    pub async fn executions(&self) -> Vec<Execution> {
        self.shared.executions.lock().await.entries.iter().cloned().collect()
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.shared.breaker.status()
    }

    pub async fn health(&self) -> OrderHealth {
        let counts = self.shared.tracker.lock().await.count_by_status();
        let log = self.shared.executions.lock().await;
        let count = |status: OrderStatus| counts.get(&status).copied().unwrap_or(0);
        let terminal = counts
            .iter()
            .filter(|(status, _)| status.is_terminal())
            .map(|(_, count)| count)
            .sum();

        OrderHealth {
            tracked: counts.values().sum(),
            pending: count(OrderStatus::Pending),
            open: count(OrderStatus::Open) + count(OrderStatus::PartiallyFilled),
            terminal,
            executions_logged: log.entries.len(),
            executions_evicted: log.evicted,
            breaker: self.breaker_status(),
        }
    }

    async fn target_for(&self, cl_ord_id: &str) -> Result<Target> {
        let tracker = self.shared.tracker.lock().await;
        let order = tracker.get(cl_ord_id).ok_or_else(|| CoreError::UnknownOrder {
            cl_ord_id: cl_ord_id.to_string(),
        })?;
        if order.is_terminal() {
            return Ok(Target::Done(Box::new(order.clone())));
        }
        match &order.order_id {
            Some(order_id) => Ok(Target::Live(OrderRef::Exchange(order_id.clone()))),
            None => Err(CoreError::NotAcknowledged {
                cl_ord_id: cl_ord_id.to_string(),
            }),
        }
    }
}

enum Target {
    Done(Box<OrderState>),
    Live(OrderRef),
}

fn tracker_error(err: OrderTrackerError) -> CoreError {
    match err {
        OrderTrackerError::UnknownClOrdId { cl_ord_id } => CoreError::UnknownOrder { cl_ord_id },
        other => CoreError::InvalidOrder(other.to_string()),
    }
}
