/*
[INPUT]:  Order intents, exchange acknowledgments, and cumulative execution reports.
[OUTPUT]: Tracked order states, recorded fills, prune and reconcile candidates.
[POS]:    State layer - order lifecycle tracking and correlation.
[UPDATE]: When order state transitions or report fields change.
*/

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;

use exlink_adapter::{AmendRequest, ExecutionReport, OrderIntent, ReportedStatus};

/// Local order status. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Returns true for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Open => 1,
            OrderStatus::PartiallyFilled => 2,
            _ => 3,
        }
    }

    fn from_reported(status: ReportedStatus) -> Option<Self> {
        match status {
            ReportedStatus::PendingNew => Some(OrderStatus::Pending),
            ReportedStatus::New => Some(OrderStatus::Open),
            ReportedStatus::PartiallyFilled => Some(OrderStatus::PartiallyFilled),
            ReportedStatus::Filled => Some(OrderStatus::Filled),
            ReportedStatus::Canceled => Some(OrderStatus::Cancelled),
            ReportedStatus::Expired => Some(OrderStatus::Expired),
            ReportedStatus::Rejected => Some(OrderStatus::Rejected),
            ReportedStatus::Unknown => None,
        }
    }
}

/// One fill, kept in the execution log after its order is pruned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub exec_id: String,
    pub cl_ord_id: String,
    pub order_id: Option<String>,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub cum_qty: Decimal,
    pub at: DateTime<Utc>,
}

/// Tracked order keyed by client order id.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub cl_ord_id: String,
    pub order_id: Option<String>,
    pub intent: OrderIntent,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub remaining_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub total_fees: Decimal,
    pub reject_reason: Option<String>,
    pub exec_ids: HashSet<String>,
    /// Fills of this order in arrival order.
    pub executions: Vec<Execution>,
    /// Transport that carried the acknowledged submission.
    pub transport: Option<&'static str>,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub terminal_at: Option<Instant>,
}

impl OrderState {
    fn new(intent: OrderIntent, now: Instant) -> Self {
        Self {
            cl_ord_id: intent.cl_ord_id.clone(),
            order_id: None,
            status: OrderStatus::Pending,
            qty: intent.qty,
            filled_qty: Decimal::ZERO,
            remaining_qty: intent.qty,
            avg_price: None,
            total_fees: Decimal::ZERO,
            reject_reason: None,
            exec_ids: HashSet::new(),
            executions: Vec::new(),
            transport: None,
            created_at: now,
            updated_at: now,
            terminal_at: None,
            intent,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn set_status(&mut self, status: OrderStatus, now: Instant) {
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() && self.terminal_at.is_none() {
            self.terminal_at = Some(now);
        }
    }

    fn recompute_remaining(&mut self) {
        self.remaining_qty = remaining_qty(self.qty, self.filled_qty);
    }
}

/// Errors emitted by the order tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTrackerError {
    /// Same client id, different order.
    DuplicateClOrdId {
        cl_ord_id: String,
    },
    UnknownClOrdId {
        cl_ord_id: String,
    },
    UnknownOrder {
        order_id: Option<String>,
        cl_ord_id: Option<String>,
    },
    OrderIdMismatch {
        order_id: String,
        expected_cl_ord_id: String,
        actual_cl_ord_id: String,
    },
    OrderIdConflict {
        cl_ord_id: String,
        existing_order_id: String,
        new_order_id: String,
    },
}

impl fmt::Display for OrderTrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderTrackerError::DuplicateClOrdId { cl_ord_id } => {
                write!(f, "cl_ord_id {cl_ord_id} already used for a different order")
            }
            OrderTrackerError::UnknownClOrdId { cl_ord_id } => {
                write!(f, "unknown cl_ord_id: {cl_ord_id}")
            }
            OrderTrackerError::UnknownOrder {
                order_id,
                cl_ord_id,
            } => write!(
                f,
                "unknown order: order_id={} cl_ord_id={}",
                order_id.as_deref().unwrap_or("-"),
                cl_ord_id.as_deref().unwrap_or("-")
            ),
            OrderTrackerError::OrderIdMismatch {
                order_id,
                expected_cl_ord_id,
                actual_cl_ord_id,
            } => write!(
                f,
                "order_id {order_id} mapped to {expected_cl_ord_id}, got {actual_cl_ord_id}"
            ),
            OrderTrackerError::OrderIdConflict {
                cl_ord_id,
                existing_order_id,
                new_order_id,
            } => write!(
                f,
                "order_id conflict for {cl_ord_id}: {existing_order_id} vs {new_order_id}"
            ),
        }
    }
}

impl std::error::Error for OrderTrackerError {}

/// Result of registering an intent.
#[derive(Debug, Clone)]
pub enum Registration {
    Inserted,
    /// Already tracked under this client id.
    Existing(Box<OrderState>),
}

/// What a report did to its order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub cl_ord_id: String,
    pub status: OrderStatus,
    pub changed: bool,
    /// New fill recorded by this report, if any.
    pub execution: Option<Execution>,
}

/// Order table keyed by client order id with an exchange-id index.
#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: HashMap<String, OrderState>,
    order_id_index: HashMap<String, String>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tracked orders.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Returns true when no orders are tracked.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn get(&self, cl_ord_id: &str) -> Option<&OrderState> {
        self.orders.get(cl_ord_id)
    }

    pub fn by_order_id(&self, order_id: &str) -> Option<&OrderState> {
        self.order_id_index
            .get(order_id)
            .and_then(|cl_ord_id| self.orders.get(cl_ord_id))
    }

    pub fn snapshot(&self) -> Vec<OrderState> {
        let mut orders: Vec<OrderState> = self.orders.values().cloned().collect();
        orders.sort_by_key(|order| order.created_at);
        orders
    }

    pub fn count_by_status(&self) -> HashMap<OrderStatus, usize> {
        let mut counts = HashMap::new();
        for order in self.orders.values() {
            *counts.entry(order.status).or_insert(0) += 1;
        }
        counts
    }

    /// Track a new intent. A second registration of the same id is
    /// idempotent and returns the existing state.
    pub fn register_pending(
        &mut self,
        intent: &OrderIntent,
        now: Instant,
    ) -> Result<Registration, OrderTrackerError> {
        if let Some(existing) = self.orders.get(&intent.cl_ord_id) {
            if existing.intent != *intent {
                return Err(OrderTrackerError::DuplicateClOrdId {
                    cl_ord_id: intent.cl_ord_id.clone(),
                });
            }
            return Ok(Registration::Existing(Box::new(existing.clone())));
        }

        self.orders
            .insert(intent.cl_ord_id.clone(), OrderState::new(intent.clone(), now));
        Ok(Registration::Inserted)
    }

    /// Record the exchange id. A duplicate ack with the same id is merged.
    pub fn acknowledge(
        &mut self,
        cl_ord_id: &str,
        order_id: &str,
        transport: &'static str,
        now: Instant,
    ) -> Result<&OrderState, OrderTrackerError> {
        let existing = self
            .orders
            .get(cl_ord_id)
            .ok_or_else(|| OrderTrackerError::UnknownClOrdId {
                cl_ord_id: cl_ord_id.to_string(),
            })?;
        if let Some(existing) = &existing.order_id
            && existing != order_id
        {
            return Err(OrderTrackerError::OrderIdConflict {
                cl_ord_id: cl_ord_id.to_string(),
                existing_order_id: existing.clone(),
                new_order_id: order_id.to_string(),
            });
        }
        self.index_order_id(order_id, cl_ord_id)?;

        let tracked = self
            .orders
            .get_mut(cl_ord_id)
            .ok_or_else(|| OrderTrackerError::UnknownClOrdId {
                cl_ord_id: cl_ord_id.to_string(),
            })?;
        tracked.order_id = Some(order_id.to_string());
        if tracked.transport.is_none() {
            tracked.transport = Some(transport);
        }
        if tracked.status == OrderStatus::Pending {
            tracked.set_status(OrderStatus::Open, now);
        }
        Ok(tracked)
    }

    /// Apply a report using its cumulative fields.
    ///
    /// Filled quantity and fees only grow, status never moves backwards, and
    /// each `exec_id` is recorded once. Replaying a report is a no-op.
    pub fn apply_report(
        &mut self,
        report: &ExecutionReport,
        now: Instant,
    ) -> Result<ReportOutcome, OrderTrackerError> {
        let cl_ord_id = self.resolve(report)?;

        if let Some(order_id) = &report.order_id {
            self.index_order_id(order_id, &cl_ord_id)?;
        }

        let tracked = self
            .orders
            .get_mut(&cl_ord_id)
            .ok_or_else(|| OrderTrackerError::UnknownClOrdId {
                cl_ord_id: cl_ord_id.clone(),
            })?;

        if tracked.is_terminal() {
            return Ok(ReportOutcome {
                cl_ord_id,
                status: tracked.status,
                changed: false,
                execution: None,
            });
        }

        let mut changed = false;

        if tracked.order_id.is_none()
            && let Some(order_id) = &report.order_id
        {
            tracked.order_id = Some(order_id.clone());
            changed = true;
        }

        if let Some(qty) = report.order_qty
            && qty > Decimal::ZERO
            && qty != tracked.qty
        {
            tracked.qty = qty;
            changed = true;
        }

        if let Some(cum_qty) = report.cum_qty
            && cum_qty > tracked.filled_qty
        {
            tracked.filled_qty = cum_qty;
            if report.avg_price.is_some() {
                tracked.avg_price = report.avg_price;
            }
            changed = true;
        } else if tracked.avg_price.is_none() && report.avg_price.is_some() {
            tracked.avg_price = report.avg_price;
            changed = true;
        }

        if let Some(cum_fee) = report.cum_fee
            && cum_fee > tracked.total_fees
        {
            tracked.total_fees = cum_fee;
            changed = true;
        }
        tracked.recompute_remaining();

        let mut execution = None;
        if report.is_fill()
            && let Some(exec_id) = &report.exec_id
            && tracked.exec_ids.insert(exec_id.clone())
        {
            let fill = Execution {
                exec_id: exec_id.clone(),
                cl_ord_id: cl_ord_id.clone(),
                order_id: tracked.order_id.clone(),
                qty: report.last_qty.unwrap_or(Decimal::ZERO),
                price: report.last_price,
                cum_qty: tracked.filled_qty,
                at: report.timestamp.unwrap_or_else(Utc::now),
            };
            tracked.executions.push(fill.clone());
            execution = Some(fill);
            changed = true;
        }

        let mut next = OrderStatus::from_reported(report.order_status).unwrap_or(tracked.status);
        if matches!(next, OrderStatus::Pending | OrderStatus::Open)
            && tracked.filled_qty > Decimal::ZERO
        {
            next = OrderStatus::PartiallyFilled;
        }
        if next == OrderStatus::Rejected {
            tracked.reject_reason = report.reason.clone();
        }
        if next.rank() > tracked.status.rank() {
            tracked.set_status(next, now);
            changed = true;
        } else if changed {
            tracked.updated_at = now;
        }

        Ok(ReportOutcome {
            cl_ord_id,
            status: tracked.status,
            changed,
            execution,
        })
    }

    /// Terminal cancel. No-op for orders already terminal.
    pub fn mark_cancelled(
        &mut self,
        cl_ord_id: &str,
        now: Instant,
    ) -> Result<OrderStatus, OrderTrackerError> {
        self.finish(cl_ord_id, OrderStatus::Cancelled, None, now)
    }

    /// Terminal rejection keeping the exchange's reason text. Orders that
    /// already carry an exchange id are live and stay as they are.
    pub fn mark_rejected(
        &mut self,
        cl_ord_id: &str,
        reason: impl Into<String>,
        now: Instant,
    ) -> Result<OrderStatus, OrderTrackerError> {
        self.finish(cl_ord_id, OrderStatus::Rejected, Some(reason.into()), now)
    }

    fn finish(
        &mut self,
        cl_ord_id: &str,
        status: OrderStatus,
        reason: Option<String>,
        now: Instant,
    ) -> Result<OrderStatus, OrderTrackerError> {
        let tracked = self
            .orders
            .get_mut(cl_ord_id)
            .ok_or_else(|| OrderTrackerError::UnknownClOrdId {
                cl_ord_id: cl_ord_id.to_string(),
            })?;

        if status == OrderStatus::Rejected && tracked.order_id.is_some() {
            return Ok(tracked.status);
        }
        if !tracked.is_terminal() {
            if reason.is_some() {
                tracked.reject_reason = reason;
            }
            tracked.set_status(status, now);
        }
        Ok(tracked.status)
    }

    /// Apply an accepted amendment to quantity/price.
    pub fn apply_amend(
        &mut self,
        cl_ord_id: &str,
        amend: &AmendRequest,
        now: Instant,
    ) -> Result<(), OrderTrackerError> {
        let tracked = self
            .orders
            .get_mut(cl_ord_id)
            .ok_or_else(|| OrderTrackerError::UnknownClOrdId {
                cl_ord_id: cl_ord_id.to_string(),
            })?;

        if tracked.is_terminal() {
            return Ok(());
        }
        if let Some(qty) = amend.qty {
            tracked.qty = qty;
            tracked.recompute_remaining();
        }
        if let Some(price) = amend.price {
            tracked.intent.price = Some(price);
        }
        if let Some(stop_price) = amend.stop_price {
            tracked.intent.stop_price = Some(stop_price);
        }
        tracked.updated_at = now;
        Ok(())
    }

    /// Pending orders older than `timeout`.
    pub fn pending_older_than(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.orders
            .values()
            .filter(|order| {
                order.status == OrderStatus::Pending
                    && now.saturating_duration_since(order.created_at) > timeout
            })
            .map(|order| order.cl_ord_id.clone())
            .collect()
    }

    /// Acknowledged orders that are not terminal yet.
    pub fn open_order_ids(&self) -> Vec<String> {
        self.orders
            .values()
            .filter(|order| !order.is_terminal() && order.order_id.is_some())
            .map(|order| order.cl_ord_id.clone())
            .collect()
    }

    /// Remove orders terminal for longer than `retention`.
    pub fn prune_terminal(&mut self, now: Instant, retention: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .orders
            .values()
            .filter(|order| {
                order
                    .terminal_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= retention)
            })
            .map(|order| order.cl_ord_id.clone())
            .collect();

        for cl_ord_id in &expired {
            if let Some(order) = self.orders.remove(cl_ord_id)
                && let Some(order_id) = order.order_id
            {
                self.order_id_index.remove(&order_id);
            }
        }
        expired
    }

    fn resolve(&self, report: &ExecutionReport) -> Result<String, OrderTrackerError> {
        if let Some(order_id) = &report.order_id
            && let Some(cl_ord_id) = self.order_id_index.get(order_id)
        {
            return Ok(cl_ord_id.clone());
        }
        if let Some(cl_ord_id) = &report.cl_ord_id
            && self.orders.contains_key(cl_ord_id)
        {
            return Ok(cl_ord_id.clone());
        }
        Err(OrderTrackerError::UnknownOrder {
            order_id: report.order_id.clone(),
            cl_ord_id: report.cl_ord_id.clone(),
        })
    }

    fn index_order_id(&mut self, order_id: &str, cl_ord_id: &str) -> Result<(), OrderTrackerError> {
        if let Some(existing) = self.order_id_index.get(order_id) {
            if existing != cl_ord_id {
                return Err(OrderTrackerError::OrderIdMismatch {
                    order_id: order_id.to_string(),
                    expected_cl_ord_id: existing.clone(),
                    actual_cl_ord_id: cl_ord_id.to_string(),
                });
            }
            return Ok(());
        }

        self.order_id_index
            .insert(order_id.to_string(), cl_ord_id.to_string());
        Ok(())
    }
}

fn remaining_qty(total_qty: Decimal, filled_qty: Decimal) -> Decimal {
    if filled_qty >= total_qty {
        Decimal::ZERO
    } else {
        total_qty - filled_qty
    }
}
