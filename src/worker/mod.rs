//! Work queue and worker pool.
//!
//! Every operation the core performs asynchronously is a [`WorkItem`]
//! whose serialized payload fully re-derives the operation. Workers pull
//! items off a shared queue as independent tokio tasks; coordination
//! happens only through ledger atomicity and database uniqueness, never
//! through pass-level locks.

use crate::domain::{Alert, OrderRequest};
use crate::engine::orders::OrderOrchestrator;
use crate::engine::reactions::ReactionDispatcher;
use crate::engine::reconcile::ReconciliationEngine;
use crate::engine::sync::ExchangeSync;
use crate::error::CoreResult;
use crate::store::Store;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// One unit of asynchronous work. The payload carries everything needed to
/// run the operation without additional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", content = "payload", rename_all = "snake_case")]
pub enum WorkItem {
    PlaceOrder {
        request: OrderRequest,
    },
    HandleReaction {
        reaction_id: i64,
        strategy_id: i64,
        alert: Alert,
    },
    RefreshOpenOrders,
    RefreshExchangeBalances {
        exchange_id: i64,
    },
    RefreshExchangeMarkets {
        exchange_id: i64,
    },
}

impl WorkItem {
    pub fn name(&self) -> &'static str {
        match self {
            WorkItem::PlaceOrder { .. } => "place_order",
            WorkItem::HandleReaction { .. } => "handle_reaction",
            WorkItem::RefreshOpenOrders => "refresh_open_orders",
            WorkItem::RefreshExchangeBalances { .. } => "refresh_exchange_balances",
            WorkItem::RefreshExchangeMarkets { .. } => "refresh_exchange_markets",
        }
    }
}

/// Engine handles shared by every worker.
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub orchestrator: Arc<OrderOrchestrator>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub dispatcher: Arc<ReactionDispatcher>,
    pub sync: Arc<ExchangeSync>,
}

/// Producer half of the work queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
}

impl WorkQueue {
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        let name = item.name();
        self.tx
            .send(item)
            .await
            .with_context(|| format!("work queue closed while enqueueing {name}"))
    }
}

/// Create a bounded queue and `workers` consumer tasks. The tasks drain the
/// queue until every producer handle is dropped, then exit.
pub fn spawn_workers(
    workers: usize,
    queue_depth: usize,
    context: Arc<WorkerContext>,
) -> (WorkQueue, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(queue_depth);
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..workers)
        .map(|worker_id| {
            let rx = Arc::clone(&rx);
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                run_worker(worker_id, rx, context).await;
            })
        })
        .collect();
    (WorkQueue { tx }, handles)
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    context: Arc<WorkerContext>,
) {
    debug!(worker_id, "worker started");
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            debug!(worker_id, "queue closed, worker exiting");
            return;
        };
        let name = item.name();
        if let Err(err) = execute(&context, item).await {
            error!(worker_id, task = name, error = %err, "work item failed");
        }
    }
}

#[instrument(skip(context, item), fields(task = item.name()))]
async fn execute(context: &WorkerContext, item: WorkItem) -> CoreResult<()> {
    match item {
        WorkItem::PlaceOrder { request } => {
            let order = context.orchestrator.place_order(&request).await?;
            info!(order_id = order.id, source_id = %order.source_id, "order placed");
        }
        WorkItem::HandleReaction {
            reaction_id,
            strategy_id,
            alert,
        } => {
            let report = context
                .dispatcher
                .handle_reaction(reaction_id, strategy_id, &alert)
                .await?;
            info!(placed = report.placed(), failed = report.failed(), "reaction handled");
        }
        WorkItem::RefreshOpenOrders => {
            let report = context.reconciler.refresh_open_orders().await?;
            info!(
                orders = report.orders.len(),
                applied = report.total_applied(),
                failed = report.total_failed(),
                "open orders refreshed"
            );
        }
        WorkItem::RefreshExchangeBalances { exchange_id } => {
            let report = context.sync.refresh_exchange_balances(exchange_id).await?;
            info!(exchange_id, updated = report.updated, "balances refreshed");
        }
        WorkItem::RefreshExchangeMarkets { exchange_id } => {
            let report = context.sync.refresh_exchange_markets(exchange_id).await?;
            info!(exchange_id, updated = report.updated, "markets refreshed");
        }
    }
    Ok(())
}

/// Periodically enqueue the recurring passes: reconciliation on one
/// interval, balance and market sync per active exchange on another.
pub fn spawn_scheduler(
    queue: WorkQueue,
    store: Arc<Store>,
    reconcile_interval: Duration,
    sync_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reconcile_tick = tokio::time::interval(reconcile_interval);
        let mut sync_tick = tokio::time::interval(sync_interval);
        loop {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    if let Err(err) = queue.enqueue(WorkItem::RefreshOpenOrders).await {
                        warn!(error = %err, "scheduler stopping, queue closed");
                        return;
                    }
                }
                _ = sync_tick.tick() => {
                    let exchanges = match store.all_active_exchanges() {
                        Ok(exchanges) => exchanges,
                        Err(err) => {
                            error!(error = %err, "failed to list exchanges for sync");
                            continue;
                        }
                    };
                    for exchange in exchanges {
                        let items = [
                            WorkItem::RefreshExchangeMarkets { exchange_id: exchange.id },
                            WorkItem::RefreshExchangeBalances { exchange_id: exchange.id },
                        ];
                        for item in items {
                            if let Err(err) = queue.enqueue(item).await {
                                warn!(error = %err, "scheduler stopping, queue closed");
                                return;
                            }
                        }
                    }
                }
            }
        }
    })
}
