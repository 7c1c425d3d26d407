//! Worker pool that drains the signal queue.
//!
//! Each worker loops on a blocking dequeue, hydrates the user's trading
//! context (venue credentials, risk settings, portfolio snapshot), executes
//! the signal and reports the outcome back to the queue, the audit trail and
//! the notification sink.

use anyhow::{Context, Result};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::risk_manager::RiskManager;
use crate::application::trade_executor::TradeExecutor;
use crate::domain::errors::ExchangeError;
use crate::domain::ports::{
    ExchangeAdapter, ExchangeRegistry, KeyStore, NotificationEvent, NotificationSink, SignalQueue,
    SignalRecordStatus, StrategyStore,
};
use crate::domain::risk::PortfolioState;
use crate::domain::signal::{ExecutionResult, ExecutionStatus, QueuedSignal};

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SignalProcessor {
    queue: Arc<dyn SignalQueue>,
    strategies: Arc<dyn StrategyStore>,
    keys: Arc<dyn KeyStore>,
    exchanges: Arc<dyn ExchangeRegistry>,
    sink: Arc<dyn NotificationSink>,
    max_execution: Duration,
}

/// Handle to a running worker pool. Dropping it does not stop the workers;
/// call `stop` for a graceful shutdown.
pub struct ProcessorHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Signal all workers to stop and wait for in-flight signals to finish.
    /// Workers notice the flag within the dequeue timeout.
    pub async fn stop(self) {
        info!("Stopping signal processor");
        let _ = self.shutdown_tx.send(true);
        join_all(self.workers).await;
        info!("Signal processor stopped");
    }
}

impl SignalProcessor {
    pub fn new(
        queue: Arc<dyn SignalQueue>,
        strategies: Arc<dyn StrategyStore>,
        keys: Arc<dyn KeyStore>,
        exchanges: Arc<dyn ExchangeRegistry>,
        sink: Arc<dyn NotificationSink>,
        max_execution: Duration,
    ) -> Self {
        Self {
            queue,
            strategies,
            keys,
            exchanges,
            sink,
            max_execution,
        }
    }

    /// Spawn `num_workers` independent worker loops.
    pub fn start(self: Arc<Self>, num_workers: usize) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!("Starting {} signal processor workers", num_workers);

        let workers = (0..num_workers)
            .map(|worker_id| {
                let processor = Arc::clone(&self);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    processor.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect();

        ProcessorHandle {
            shutdown_tx,
            workers,
        }
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        info!("Worker {} started", worker_id);

        // The dequeue timeout doubles as the shutdown poll interval.
        // Cancelling the pop mid-flight could drop a popped signal before it
        // reaches the processing set, so the loop always lets it finish.
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.dequeue(DEQUEUE_TIMEOUT).await {
                Ok(Some(signal)) => self.process_signal(signal, worker_id).await,
                Ok(None) => {}
                Err(e) => {
                    error!("Worker {} dequeue error: {:#}", worker_id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Worker {} stopped", worker_id);
    }

    #[tracing::instrument(skip_all, fields(
        signal_id = %signal.signal_id,
        user_id = %signal.user_id,
        worker_id = worker_id,
    ))]
    async fn process_signal(&self, signal: QueuedSignal, worker_id: usize) {
        info!(
            "Processing signal {} {} (retry {})",
            signal.action, signal.symbol, signal.retry_count
        );

        if let Err(e) = self.handle_signal(&signal).await {
            error!("Signal processing failed: {:#}", e);
            let _ = self
                .queue
                .fail(&signal.signal_id, &format!("{:#}", e), true)
                .await;
        }
    }

    /// The happy path plus all non-retryable failure exits. Returning an
    /// error means "transient trouble, retry"; terminal outcomes are
    /// reported inline and return `Ok`.
    async fn handle_signal(&self, signal: &QueuedSignal) -> Result<()> {
        let strategy = match self.strategies.get(&signal.strategy_id).await? {
            Some(strategy) => strategy,
            None => {
                return self
                    .fail_terminal(signal, &format!("Strategy not found: {}", signal.strategy_id))
                    .await;
            }
        };

        let credentials = match self
            .keys
            .credentials(&signal.user_id, &strategy.exchange)
            .await?
        {
            Some(credentials) => credentials,
            None => {
                return self
                    .fail_terminal(
                        signal,
                        &format!("No valid API key for exchange {}", strategy.exchange),
                    )
                    .await;
            }
        };

        let mut adapter = match self.exchanges.create(&strategy.exchange, &credentials) {
            Ok(adapter) => adapter,
            Err(e) => return self.fail_terminal(signal, &e.to_string()).await,
        };

        if let Err(e) = adapter.connect().await {
            if let ExchangeError::Authentication(_) = e {
                self.keys.mark_invalid(&credentials.key_id).await?;
                return self.fail_terminal(signal, &e.to_string()).await;
            }
            return Err(e).context("exchange connect failed");
        }

        match adapter.validate_credentials().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Credential validation failed for user {} on {}",
                    signal.user_id, strategy.exchange
                );
                self.keys.mark_invalid(&credentials.key_id).await?;
                let _ = adapter.disconnect().await;
                return self
                    .fail_terminal(signal, "Exchange credentials are invalid")
                    .await;
            }
            Err(e) if !e.is_transient() => {
                self.keys.mark_invalid(&credentials.key_id).await?;
                let _ = adapter.disconnect().await;
                return self.fail_terminal(signal, &e.to_string()).await;
            }
            Err(e) => return Err(e).context("credential validation failed"),
        }
        self.keys.mark_used(&credentials.key_id).await?;

        let risk_settings = self.strategies.risk_settings(&signal.user_id).await?;
        let adapter: Arc<dyn ExchangeAdapter> = Arc::from(adapter);
        let portfolio = self.build_portfolio_state(&signal.user_id, adapter.as_ref()).await?;

        let executor = TradeExecutor::new(adapter, RiskManager::new(risk_settings));

        let result = match tokio::time::timeout(
            self.max_execution,
            executor.execute_signal(signal, &portfolio),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Execution exceeded budget of {}ms",
                    self.max_execution.as_millis()
                );
                anyhow::bail!(
                    "Execution timed out after {}ms",
                    self.max_execution.as_millis()
                );
            }
        };

        self.report_outcome(signal, result).await
    }

    async fn report_outcome(&self, signal: &QueuedSignal, result: ExecutionResult) -> Result<()> {
        if result.status.is_success() {
            self.queue.complete(&signal.signal_id).await?;
            self.strategies
                .update_signal_status(&signal.signal_id, SignalRecordStatus::Executed, Some(&result))
                .await?;
            info!(
                "Signal executed: {} order {:?} filled {:?}",
                result.status, result.order_id, result.filled_quantity
            );

            self.sink
                .publish(
                    &signal.user_id,
                    NotificationEvent::TradeExecuted,
                    serde_json::json!({
                        "signal_id": signal.signal_id,
                        "symbol": signal.symbol,
                        "action": signal.action.to_string(),
                        "status": result.status.to_string(),
                        "order_id": result.order_id,
                        "filled_quantity": result.filled_quantity,
                        "avg_price": result.avg_price,
                        "realized_pnl": result.realized_pnl,
                    }),
                )
                .await;
            self.sink
                .publish(
                    &signal.user_id,
                    NotificationEvent::PositionUpdate,
                    serde_json::json!({
                        "symbol": signal.symbol,
                        "action": signal.action.to_string(),
                    }),
                )
                .await;
            return Ok(());
        }

        if result.status == ExecutionStatus::RiskCheckFailed {
            let reason = result.error.clone().unwrap_or_else(|| "Risk check failed".into());
            self.queue.fail(&signal.signal_id, &reason, false).await?;
            self.strategies
                .update_signal_status(&signal.signal_id, SignalRecordStatus::Failed, Some(&result))
                .await?;
            self.sink
                .publish(
                    &signal.user_id,
                    NotificationEvent::OrderUpdate,
                    serde_json::json!({
                        "signal_id": signal.signal_id,
                        "symbol": signal.symbol,
                        "status": "rejected",
                        "reason": reason,
                    }),
                )
                .await;
            return Ok(());
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| format!("Execution failed: {}", result.status));
        let will_retry = self
            .queue
            .fail(&signal.signal_id, &error, result.retryable)
            .await?;
        if !will_retry {
            self.strategies
                .update_signal_status(&signal.signal_id, SignalRecordStatus::Failed, Some(&result))
                .await?;
        }
        Ok(())
    }

    /// Fail the signal without retry and record the terminal status.
    async fn fail_terminal(&self, signal: &QueuedSignal, error: &str) -> Result<()> {
        warn!("Signal failed terminally: {}", error);
        self.queue.fail(&signal.signal_id, error, false).await?;
        self.strategies
            .update_signal_status(&signal.signal_id, SignalRecordStatus::Failed, None)
            .await?;
        Ok(())
    }

    /// Assemble the risk snapshot: live balance from the venue, position and
    /// daily stats from the store.
    async fn build_portfolio_state(
        &self,
        user_id: &str,
        adapter: &dyn ExchangeAdapter,
    ) -> Result<PortfolioState> {
        let total_balance = match adapter.get_balance(Some("USDT")).await {
            Ok(balances) => balances
                .first()
                .map(|b| b.total)
                .unwrap_or(Decimal::ZERO),
            Err(e) => {
                warn!("Failed to fetch exchange balance: {}", e);
                Decimal::ZERO
            }
        };

        let positions = self.strategies.open_positions_summary(user_id).await?;
        let daily = self.strategies.daily_stats(user_id).await?;

        Ok(PortfolioState::from_daily_pnl(
            total_balance,
            positions.count,
            positions.value_usd,
            daily.trades,
            daily.realized_pnl,
        ))
    }
}
