use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::position::{ManagedPosition, OrderManagerConfig};
use super::report::{
    Attempt, PositionTick, Registration, StopLossMove, StopLossPlacement, StopOrderKind,
    SweepReport, Unregistration,
};
use crate::api::{OrderGateway, PriceSource, TradeRecorder};
use crate::models::Side;
use crate::{Error, Result};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Register {
        trade_id: i64,
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
        decision_id: Option<i64>,
        reply: oneshot::Sender<Registration>,
    },
    Unregister {
        symbol: String,
        reply: oneshot::Sender<Unregistration>,
    },
    Snapshot {
        symbol: String,
        reply: oneshot::Sender<Option<ManagedPosition>>,
    },
    SnapshotAll {
        reply: oneshot::Sender<Vec<ManagedPosition>>,
    },
    /// Fold a freshly fetched price into one position
    ApplyPrice {
        symbol: String,
        price: f64,
        reply: oneshot::Sender<Option<PositionTick>>,
    },
}

struct Scheduler {
    token: CancellationToken,
    task: JoinHandle<()>,
}

async fn request<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (reply, response) = oneshot::channel();
    commands
        .send(build(reply))
        .await
        .map_err(|_| Error::ManagerClosed)?;
    response.await.map_err(|_| Error::ManagerClosed)
}

/// Drives sweeps from outside the registry task
///
/// Prices are fetched here, so a slow price source never holds up the
/// registry; only the resulting updates go through it, one position at a time.
#[derive(Clone)]
struct Sweeper {
    commands: mpsc::Sender<Command>,
    prices: Arc<dyn PriceSource>,
    in_progress: Arc<tokio::sync::Mutex<()>>,
}

impl Sweeper {
    async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        // One sweep at a time, whoever triggered it
        let _guard = self.in_progress.lock().await;

        let started_at = Utc::now();
        let positions = request(&self.commands, |reply| Command::SnapshotAll { reply }).await?;

        let mut ticks = Vec::with_capacity(positions.len());
        let mut cancelled = false;

        for position in positions {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let symbol = position.symbol;
            let price = match self.prices.current_price(&symbol).await {
                Ok(price) => price,
                Err(e) => {
                    tracing::warn!(
                        symbol = %symbol,
                        "Price fetch failed, skipping this tick: {}",
                        e
                    );
                    ticks.push(PositionTick {
                        symbol,
                        trade_id: position.trade_id,
                        price: Attempt::Failed(e.to_string()),
                        trailing_activated: false,
                        stop_loss_move: None,
                        persistence: Attempt::Skipped,
                    });
                    continue;
                }
            };

            let applied = request(&self.commands, |reply| Command::ApplyPrice {
                symbol,
                price,
                reply,
            })
            .await?;

            // None: unregistered while its price was in flight
            if let Some(tick) = applied {
                ticks.push(tick);
            }
        }

        Ok(SweepReport {
            started_at,
            finished_at: Utc::now(),
            ticks,
            cancelled,
        })
    }
}

/// Manages take-profit, stop-loss and trailing stops for open positions
///
/// Position state lives in a single actor task; this handle talks to it over
/// a channel, so it is cheap to clone and share. Snapshots are copies.
#[derive(Clone)]
pub struct OrderManager {
    commands: mpsc::Sender<Command>,
    sweeper: Sweeper,
    config: OrderManagerConfig,
    shutdown: CancellationToken,
    scheduler: Arc<Mutex<Option<Scheduler>>>,
}

impl OrderManager {
    /// Spawn the registry task. Must be called inside a tokio runtime.
    pub fn new(
        config: OrderManagerConfig,
        gateway: Arc<dyn OrderGateway>,
        prices: Arc<dyn PriceSource>,
        recorder: Option<Arc<dyn TradeRecorder>>,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();

        let registry = Registry {
            config: config.clone(),
            positions: HashMap::new(),
            gateway,
            recorder,
        };
        tokio::spawn(registry.run(receiver, shutdown.clone()));

        let sweeper = Sweeper {
            commands: commands.clone(),
            prices,
            in_progress: Arc::new(tokio::sync::Mutex::new(())),
        };

        Self {
            commands,
            sweeper,
            config,
            shutdown,
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &OrderManagerConfig {
        &self.config
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        request(&self.commands, build).await
    }

    /// Track a freshly opened position and place its TP and SL orders
    ///
    /// Order placement failures are reported in the returned `Registration`;
    /// the position is tracked either way.
    pub async fn register_position(
        &self,
        trade_id: i64,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        decision_id: Option<i64>,
    ) -> Result<Registration> {
        let symbol = symbol.to_string();
        self.request(|reply| Command::Register {
            trade_id,
            symbol,
            side,
            entry_price,
            quantity,
            decision_id,
            reply,
        })
        .await
    }

    /// Cancel outstanding protective orders and forget the position
    pub async fn unregister_position(&self, symbol: &str) -> Result<Unregistration> {
        let symbol = symbol.to_string();
        self.request(|reply| Command::Unregister { symbol, reply })
            .await
    }

    pub async fn managed_position(&self, symbol: &str) -> Result<Option<ManagedPosition>> {
        let symbol = symbol.to_string();
        self.request(|reply| Command::Snapshot { symbol, reply }).await
    }

    /// Copies of every managed position, ordered by symbol
    pub async fn managed_positions(&self) -> Result<Vec<ManagedPosition>> {
        self.request(|reply| Command::SnapshotAll { reply }).await
    }

    pub async fn is_managed(&self, symbol: &str) -> Result<bool> {
        Ok(self.managed_position(symbol).await?.is_some())
    }

    /// Run one update sweep right away
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let cancel = self.shutdown.child_token();
        self.sweeper.sweep(&cancel).await
    }

    /// Start the periodic sweep. No-op when already running.
    pub fn start(&self) {
        let mut scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if scheduler
            .as_ref()
            .is_some_and(|s| !s.token.is_cancelled() && !s.task.is_finished())
        {
            tracing::debug!("Order manager scheduler already running");
            return;
        }

        let token = self.shutdown.child_token();
        let period = self.config.update_interval();
        let task = tokio::spawn(run_scheduler(self.sweeper.clone(), period, token.clone()));

        tracing::info!(
            interval_secs = period.as_secs(),
            "🛡️  Order manager started"
        );
        *scheduler = Some(Scheduler { token, task });
    }

    /// Stop the periodic sweep. An in-flight sweep finishes its current position.
    pub fn stop(&self) {
        let stopped = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(scheduler) = stopped {
            scheduler.token.cancel();
            tracing::info!("Order manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|s| !s.token.is_cancelled() && !s.task.is_finished())
    }

    /// Stop the scheduler and the registry task; later calls fail with `ManagerClosed`
    pub async fn shutdown(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        self.shutdown.cancel();

        if let Some(scheduler) = scheduler {
            let _ = scheduler.task.await;
        }
    }
}

async fn run_scheduler(sweeper: Sweeper, period: std::time::Duration, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; sweeps start one period in
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match sweeper.sweep(&token).await {
            Ok(report) => tracing::debug!(
                positions = report.ticks.len(),
                stop_moves = report.stop_loss_moves(),
                cancelled = report.cancelled,
                "Sweep complete"
            ),
            Err(_) => break,
        }
    }

    tracing::debug!("Order manager scheduler exited");
}

/// Owner of all managed-position state
struct Registry {
    config: OrderManagerConfig,
    positions: HashMap<String, ManagedPosition>,
    gateway: Arc<dyn OrderGateway>,
    recorder: Option<Arc<dyn TradeRecorder>>,
}

impl Registry {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = receiver.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Register {
                    trade_id,
                    symbol,
                    side,
                    entry_price,
                    quantity,
                    decision_id,
                    reply,
                } => {
                    let registration = self
                        .register(trade_id, &symbol, side, entry_price, quantity, decision_id)
                        .await;
                    let _ = reply.send(registration);
                }
                Command::Unregister { symbol, reply } => {
                    let unregistration = self.unregister(&symbol).await;
                    let _ = reply.send(unregistration);
                }
                Command::Snapshot { symbol, reply } => {
                    let _ = reply.send(self.positions.get(&symbol).cloned());
                }
                Command::SnapshotAll { reply } => {
                    let mut all: Vec<ManagedPosition> = self.positions.values().cloned().collect();
                    all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                    let _ = reply.send(all);
                }
                Command::ApplyPrice {
                    symbol,
                    price,
                    reply,
                } => {
                    let tick = self.apply_price(&symbol, price).await;
                    let _ = reply.send(tick);
                }
            }
        }

        tracing::debug!(
            positions = self.positions.len(),
            "Order manager registry exited"
        );
    }

    async fn register(
        &mut self,
        trade_id: i64,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        decision_id: Option<i64>,
    ) -> Registration {
        let mut position = ManagedPosition::new(
            trade_id,
            symbol,
            side,
            entry_price,
            quantity,
            decision_id,
            &self.config,
        );
        let restored_trailing = self.restore_trailing(&mut position).await;

        let take_profit = match self.gateway.place_order(&position.take_profit_order()).await {
            Ok(ack) => {
                position.tp_order_id = ack.order_id;
                Attempt::Succeeded(ack.order_id)
            }
            Err(e) => {
                tracing::error!(symbol, trade_id, "Failed to place take profit order: {}", e);
                Attempt::Failed(e.to_string())
            }
        };

        let stop_loss = place_stop_loss(self.gateway.as_ref(), &position).await;
        if let Attempt::Succeeded(placement) = &stop_loss {
            position.sl_order_id = placement.order_id;
        }

        tracing::info!(
            symbol,
            trade_id,
            side = %side,
            entry_price,
            take_profit = position.take_profit_price,
            stop_loss = position.stop_loss_price,
            tp_order_id = position.tp_order_id,
            sl_order_id = position.sl_order_id,
            "📌 Position registered"
        );

        let replaced = self.positions.insert(symbol.to_string(), position.clone());
        let orphaned_order_ids: Vec<i64> = replaced
            .as_ref()
            .map(|old| {
                [old.tp_order_id, old.sl_order_id]
                    .into_iter()
                    .filter(|id| *id != 0)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(old) = &replaced {
            tracing::warn!(
                symbol,
                old_trade_id = old.trade_id,
                old_tp_order_id = old.tp_order_id,
                old_sl_order_id = old.sl_order_id,
                "Replaced existing managed position, its orders are left live: {:?}",
                orphaned_order_ids
            );
        }

        Registration {
            position,
            replaced_existing: replaced.is_some(),
            orphaned_order_ids,
            restored_trailing,
            take_profit,
            stop_loss,
        }
    }

    /// Pick up trailing state recorded for this trade before a restart
    async fn restore_trailing(&self, position: &mut ManagedPosition) -> bool {
        let Some(recorder) = &self.recorder else {
            return false;
        };

        match recorder.load_trailing_info(position.trade_id).await {
            Ok(Some(info)) => {
                let restored = position.restore_trailing(&info);
                if restored {
                    tracing::info!(
                        symbol = %position.symbol,
                        trade_id = position.trade_id,
                        highest = position.highest_price,
                        lowest = position.lowest_price,
                        stop_loss = position.stop_loss_price,
                        trailing_active = position.trailing_active,
                        "♻️  Restored trailing state"
                    );
                }
                restored
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    symbol = %position.symbol,
                    trade_id = position.trade_id,
                    "Failed to load trailing info: {}",
                    e
                );
                false
            }
        }
    }

    async fn unregister(&mut self, symbol: &str) -> Unregistration {
        let Some(position) = self.positions.remove(symbol) else {
            return Unregistration::not_managed(symbol);
        };

        let take_profit_cancel =
            cancel_if_placed(self.gateway.as_ref(), symbol, position.tp_order_id, "take profit")
                .await;
        let stop_loss_cancel =
            cancel_if_placed(self.gateway.as_ref(), symbol, position.sl_order_id, "stop loss")
                .await;

        let close_record = match &self.recorder {
            Some(recorder) => {
                let result = recorder.close_trade(position.trade_id).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        symbol,
                        trade_id = position.trade_id,
                        "Failed to close trade record: {}",
                        e
                    );
                }
                Attempt::from_result(result)
            }
            None => Attempt::Skipped,
        };

        tracing::info!(symbol, trade_id = position.trade_id, "Position unregistered");

        Unregistration {
            symbol: symbol.to_string(),
            removed: Some(position),
            take_profit_cancel,
            stop_loss_cancel,
            close_record,
        }
    }

    async fn apply_price(&mut self, symbol: &str, price: f64) -> Option<PositionTick> {
        let trade_id = self.positions.get(symbol)?.trade_id;

        let config = &self.config;
        let gateway = self.gateway.as_ref();
        let position = self.positions.get_mut(symbol)?;

        position.observe_price(price);

        let mut trailing_activated = false;
        if config.trailing_stop_enabled && !position.trailing_active {
            let profit = position.profit_percent(price);
            if profit >= config.trailing_activation_percent {
                position.trailing_active = true;
                trailing_activated = true;
                tracing::info!(
                    symbol,
                    price,
                    profit_pct = profit,
                    "🎯 Trailing stop activated"
                );
            }
        }

        let mut stop_loss_move = None;
        if config.trailing_stop_enabled && position.trailing_active {
            let candidate = position.trailing_candidate(config.trailing_stop_percent);
            if position.improves_stop(candidate) {
                stop_loss_move = Some(move_stop_loss(gateway, position, candidate).await);
            }
        }

        let persistence = match &self.recorder {
            Some(recorder) => {
                let result = recorder
                    .record_trailing_info(
                        position.trade_id,
                        position.highest_price,
                        position.lowest_price,
                        position.stop_loss_price,
                    )
                    .await;
                if let Err(e) = &result {
                    tracing::warn!(symbol, trade_id, "Failed to record trailing info: {}", e);
                }
                Attempt::from_result(result)
            }
            None => Attempt::Skipped,
        };

        Some(PositionTick {
            symbol: symbol.to_string(),
            trade_id,
            price: Attempt::Succeeded(price),
            trailing_activated,
            stop_loss_move,
            persistence,
        })
    }
}

/// Place the stop-limit, falling back to a plain stop when it is rejected
async fn place_stop_loss(
    gateway: &dyn OrderGateway,
    position: &ManagedPosition,
) -> Attempt<StopLossPlacement> {
    let stop_limit_error = match gateway.place_order(&position.stop_limit_order()).await {
        Ok(ack) => {
            return Attempt::Succeeded(StopLossPlacement {
                order_id: ack.order_id,
                kind: StopOrderKind::StopLimit,
            })
        }
        Err(e) => e,
    };

    tracing::warn!(
        symbol = %position.symbol,
        stop_price = position.stop_loss_price,
        "Stop-limit rejected ({}), falling back to stop order",
        stop_limit_error
    );

    match gateway.place_order(&position.stop_market_order()).await {
        Ok(ack) => Attempt::Succeeded(StopLossPlacement {
            order_id: ack.order_id,
            kind: StopOrderKind::StopMarket,
        }),
        Err(e) => {
            tracing::error!(
                symbol = %position.symbol,
                trade_id = position.trade_id,
                "Failed to place stop loss order: {}",
                e
            );
            Attempt::Failed(format!("stop-limit: {}; stop: {}", stop_limit_error, e))
        }
    }
}

async fn cancel_if_placed(
    gateway: &dyn OrderGateway,
    symbol: &str,
    order_id: i64,
    label: &str,
) -> Attempt<()> {
    if order_id == 0 {
        return Attempt::Skipped;
    }

    let result = gateway.cancel_order(symbol, order_id).await;
    if let Err(e) = &result {
        tracing::warn!(symbol, order_id, "Failed to cancel {} order: {}", label, e);
    }
    Attempt::from_result(result)
}

/// Replace the live stop with one at `new_stop`
async fn move_stop_loss(
    gateway: &dyn OrderGateway,
    position: &mut ManagedPosition,
    new_stop: f64,
) -> StopLossMove {
    let previous_stop = position.stop_loss_price;
    let cancel_previous =
        cancel_if_placed(gateway, &position.symbol, position.sl_order_id, "stop loss").await;

    position.stop_loss_price = new_stop;
    position.sl_order_id = 0;

    let placement = place_stop_loss(gateway, position).await;
    if let Attempt::Succeeded(placed) = &placement {
        position.sl_order_id = placed.order_id;
    }

    tracing::info!(
        symbol = %position.symbol,
        previous_stop,
        new_stop,
        highest = position.highest_price,
        lowest = position.lowest_price,
        sl_order_id = position.sl_order_id,
        "📈 Trailing stop moved"
    );

    StopLossMove {
        previous_stop,
        new_stop,
        cancel_previous,
        placement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderAck, OrderRequest, OrderType, TrailingInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::time::Duration;

    #[derive(Default)]
    struct RecordingGateway {
        next_id: AtomicI64,
        placed: Mutex<Vec<OrderRequest>>,
        cancelled: Mutex<Vec<(String, i64)>>,
        rejected_types: Mutex<Vec<OrderType>>,
        fail_cancels: Mutex<bool>,
    }

    impl RecordingGateway {
        fn rejecting(types: &[OrderType]) -> Self {
            let gateway = Self::default();
            *gateway.rejected_types.lock().unwrap() = types.to_vec();
            gateway
        }

        fn placed(&self) -> Vec<OrderRequest> {
            self.placed.lock().unwrap().clone()
        }

        fn cancelled(&self) -> Vec<(String, i64)> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderGateway for RecordingGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
            if self.rejected_types.lock().unwrap().contains(&request.order_type) {
                return Err(Error::Exchange {
                    code: -2010,
                    message: format!("{} rejected", request.order_type),
                });
            }
            self.placed.lock().unwrap().push(request.clone());
            let order_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(OrderAck { order_id })
        }

        async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
            self.cancelled
                .lock()
                .unwrap()
                .push((symbol.to_string(), order_id));
            if *self.fail_cancels.lock().unwrap() {
                return Err(Error::Other("cancel failed".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedPrices {
        prices: Mutex<HashMap<String, f64>>,
    }

    impl ScriptedPrices {
        fn set(&self, symbol: &str, price: f64) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }

        fn clear(&self, symbol: &str) {
            self.prices.lock().unwrap().remove(symbol);
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedPrices {
        async fn current_price(&self, symbol: &str) -> Result<f64> {
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| Error::Other(format!("no price for {}", symbol)))
        }
    }

    #[derive(Default)]
    struct RecordingRecorder {
        records: Mutex<Vec<(i64, f64, f64, f64)>>,
        stored: Mutex<HashMap<i64, TrailingInfo>>,
        closed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl TradeRecorder for RecordingRecorder {
        async fn record_trailing_info(
            &self,
            trade_id: i64,
            highest_price: f64,
            lowest_price: f64,
            stop_loss: f64,
        ) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .push((trade_id, highest_price, lowest_price, stop_loss));
            Ok(())
        }

        async fn load_trailing_info(&self, trade_id: i64) -> Result<Option<TrailingInfo>> {
            Ok(self.stored.lock().unwrap().get(&trade_id).cloned())
        }

        async fn close_trade(&self, trade_id: i64) -> Result<()> {
            self.closed.lock().unwrap().push(trade_id);
            Ok(())
        }
    }

    /// Answers after `delay`, like an exchange stuck in retries
    struct SlowPrices {
        delay: Duration,
    }

    #[async_trait]
    impl PriceSource for SlowPrices {
        async fn current_price(&self, _symbol: &str) -> Result<f64> {
            tokio::time::sleep(self.delay).await;
            Ok(100.0)
        }
    }

    /// Cancels the sweep token from inside the first price fetch
    struct CancellingPrices {
        token: CancellationToken,
    }

    #[async_trait]
    impl PriceSource for CancellingPrices {
        async fn current_price(&self, _symbol: &str) -> Result<f64> {
            self.token.cancel();
            Ok(100.0)
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    fn manager_with(
        gateway: Arc<RecordingGateway>,
        prices: Arc<ScriptedPrices>,
        recorder: Option<Arc<RecordingRecorder>>,
    ) -> OrderManager {
        OrderManager::new(
            OrderManagerConfig::default(),
            gateway,
            prices,
            recorder.map(|r| r as Arc<dyn TradeRecorder>),
        )
    }

    #[tokio::test]
    async fn test_register_places_tp_and_stop_limit() {
        let gateway = Arc::new(RecordingGateway::default());
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        let registration = manager
            .register_position(11, "BTCUSDT", Side::Buy, 100.0, 0.5, Some(3))
            .await
            .unwrap();

        assert_close(registration.position.take_profit_price, 105.0);
        assert_close(registration.position.stop_loss_price, 98.0);
        assert_eq!(registration.take_profit, Attempt::Succeeded(1));
        assert_eq!(
            registration.stop_loss.succeeded().map(|p| p.kind),
            Some(StopOrderKind::StopLimit)
        );

        let placed = gateway.placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[1].order_type, OrderType::StopLossLimit);

        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.tp_order_id, 1);
        assert_eq!(stored.sl_order_id, 2);
        assert_eq!(stored.decision_id, Some(3));
    }

    #[tokio::test]
    async fn test_sell_registration_levels() {
        let gateway = Arc::new(RecordingGateway::default());
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        let registration = manager
            .register_position(12, "ETHUSDT", Side::Sell, 100.0, 1.0, None)
            .await
            .unwrap();

        assert_close(registration.position.take_profit_price, 95.0);
        assert_close(registration.position.stop_loss_price, 102.0);
        assert!(gateway.placed().iter().all(|o| o.side == Side::Buy));
    }

    #[tokio::test]
    async fn test_stop_limit_rejection_falls_back_to_stop() {
        let gateway = Arc::new(RecordingGateway::rejecting(&[OrderType::StopLossLimit]));
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        let registration = manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        assert_eq!(
            registration.stop_loss.succeeded().map(|p| p.kind),
            Some(StopOrderKind::StopMarket)
        );
        let placed = gateway.placed();
        assert_eq!(placed[1].order_type, OrderType::StopLoss);
        assert!(placed[1].price.is_none());
        assert_ne!(registration.position.sl_order_id, 0);
    }

    #[tokio::test]
    async fn test_placement_failures_still_track_position() {
        let gateway = Arc::new(RecordingGateway::rejecting(&[
            OrderType::Limit,
            OrderType::StopLossLimit,
            OrderType::StopLoss,
        ]));
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        let registration = manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        assert!(registration.take_profit.is_failed());
        assert!(registration.stop_loss.is_failed());

        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.tp_order_id, 0);
        assert_eq!(stored.sl_order_id, 0);
    }

    #[tokio::test]
    async fn test_register_overwrites_symbol() {
        let gateway = Arc::new(RecordingGateway::default());
        let manager = manager_with(gateway, Arc::new(ScriptedPrices::default()), None);

        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        let second = manager
            .register_position(2, "BTCUSDT", Side::Sell, 200.0, 1.0, None)
            .await
            .unwrap();

        assert!(second.replaced_existing);
        // The first position's TP (1) and SL (2) are still live on the exchange
        assert_eq!(second.orphaned_order_ids, vec![1, 2]);
        let all = manager.managed_positions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].trade_id, 2);
    }

    #[tokio::test]
    async fn test_unregister_cancels_both_orders() {
        let gateway = Arc::new(RecordingGateway::default());
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        let result = manager.unregister_position("BTCUSDT").await.unwrap();

        assert!(result.removed.is_some());
        assert!(result.take_profit_cancel.is_succeeded());
        assert!(result.stop_loss_cancel.is_succeeded());
        assert!(result.close_record.is_skipped());
        assert_eq!(
            gateway.cancelled(),
            vec![("BTCUSDT".to_string(), 1), ("BTCUSDT".to_string(), 2)]
        );
        assert!(manager.managed_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregister_cancel_failures_are_not_fatal() {
        let gateway = Arc::new(RecordingGateway::default());
        *gateway.fail_cancels.lock().unwrap() = true;
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        let result = manager.unregister_position("BTCUSDT").await.unwrap();

        assert!(result.take_profit_cancel.is_failed());
        assert!(result.stop_loss_cancel.is_failed());
        assert!(manager.managed_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_symbol_is_noop() {
        let gateway = Arc::new(RecordingGateway::default());
        let manager = manager_with(gateway.clone(), Arc::new(ScriptedPrices::default()), None);

        let result = manager.unregister_position("DOGEUSDT").await.unwrap();

        assert!(result.removed.is_none());
        assert!(result.take_profit_cancel.is_skipped());
        assert!(gateway.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_trailing_ratchet_over_sweeps() {
        let gateway = Arc::new(RecordingGateway::default());
        let prices = Arc::new(ScriptedPrices::default());
        let manager = manager_with(gateway.clone(), prices.clone(), None);

        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        // +1% is below the 2% activation threshold
        prices.set("BTCUSDT", 101.0);
        let report = manager.sweep_now().await.unwrap();
        assert!(!report.tick("BTCUSDT").unwrap().trailing_activated);

        // +10% activates and trails 1% under the high
        prices.set("BTCUSDT", 110.0);
        let report = manager.sweep_now().await.unwrap();
        let tick = report.tick("BTCUSDT").unwrap();
        assert!(tick.trailing_activated);
        let moved = tick.stop_loss_move.as_ref().unwrap();
        assert_close(moved.previous_stop, 98.0);
        assert_close(moved.new_stop, 108.9);
        assert!(moved.cancel_previous.is_succeeded());

        // Pullback: candidate 107.91 is worse, stop stays
        prices.set("BTCUSDT", 109.0);
        let report = manager.sweep_now().await.unwrap();
        assert!(report.tick("BTCUSDT").unwrap().stop_loss_move.is_none());

        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert_close(stored.stop_loss_price, 108.9);
        assert_eq!(stored.highest_price, 110.0);
        assert!(stored.trailing_active);
        // Old stop (id 2) cancelled, replacement is id 3
        assert_eq!(gateway.cancelled(), vec![("BTCUSDT".to_string(), 2)]);
        assert_eq!(stored.sl_order_id, 3);
    }

    #[tokio::test]
    async fn test_trailing_stays_active_after_pullback() {
        let prices = Arc::new(ScriptedPrices::default());
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            prices.clone(),
            None,
        );

        manager
            .register_position(1, "ETHUSDT", Side::Sell, 100.0, 1.0, None)
            .await
            .unwrap();

        prices.set("ETHUSDT", 95.0);
        manager.sweep_now().await.unwrap();
        prices.set("ETHUSDT", 101.0);
        manager.sweep_now().await.unwrap();

        let stored = manager.managed_position("ETHUSDT").await.unwrap().unwrap();
        assert!(stored.trailing_active);
        assert_close(stored.stop_loss_price, 95.95);
        assert_eq!(stored.lowest_price, 95.0);
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_stop_unset() {
        let gateway = Arc::new(RecordingGateway::default());
        let prices = Arc::new(ScriptedPrices::default());
        let manager = manager_with(gateway.clone(), prices.clone(), None);

        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        *gateway.rejected_types.lock().unwrap() =
            vec![OrderType::StopLossLimit, OrderType::StopLoss];
        prices.set("BTCUSDT", 110.0);
        let report = manager.sweep_now().await.unwrap();

        let moved = report.tick("BTCUSDT").unwrap().stop_loss_move.clone().unwrap();
        assert!(moved.placement.is_failed());

        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.sl_order_id, 0);
        assert_close(stored.stop_loss_price, 108.9);
    }

    #[tokio::test]
    async fn test_price_failure_skips_position() {
        let prices = Arc::new(ScriptedPrices::default());
        let recorder = Arc::new(RecordingRecorder::default());
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            prices.clone(),
            Some(recorder.clone()),
        );

        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        let before = manager.managed_position("BTCUSDT").await.unwrap();

        prices.clear("BTCUSDT");
        let report = manager.sweep_now().await.unwrap();
        let tick = report.tick("BTCUSDT").unwrap();

        assert!(tick.price.is_failed());
        assert!(tick.persistence.is_skipped());
        assert_eq!(manager.managed_position("BTCUSDT").await.unwrap(), before);
        assert!(recorder.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_records_trailing_info() {
        let prices = Arc::new(ScriptedPrices::default());
        let recorder = Arc::new(RecordingRecorder::default());
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            prices.clone(),
            Some(recorder.clone()),
        );

        manager
            .register_position(42, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        prices.set("BTCUSDT", 99.0);
        manager.sweep_now().await.unwrap();
        prices.set("BTCUSDT", 101.0);
        let report = manager.sweep_now().await.unwrap();

        assert!(report.tick("BTCUSDT").unwrap().persistence.is_succeeded());
        let records = recorder.records.lock().unwrap().clone();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 42);
        assert_eq!(records[1].1, 101.0);
        assert_eq!(records[1].2, 99.0);
        assert_close(records[1].3, 98.0);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_stops_between_positions() {
        let prices = Arc::new(ScriptedPrices::default());
        prices.set("BTCUSDT", 100.0);
        prices.set("ETHUSDT", 100.0);
        let manager = manager_with(Arc::new(RecordingGateway::default()), prices, None);
        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        manager
            .register_position(2, "ETHUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let report = manager.sweeper.sweep(&token).await.unwrap();
        assert_eq!(report.ticks.len(), 2);
        assert!(!report.cancelled);

        token.cancel();
        let report = manager.sweeper.sweep(&token).await.unwrap();
        assert!(report.ticks.is_empty());
        assert!(report.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_finishes_current_position_only() {
        let token = CancellationToken::new();
        let manager = OrderManager::new(
            OrderManagerConfig::default(),
            Arc::new(RecordingGateway::default()),
            Arc::new(CancellingPrices {
                token: token.clone(),
            }),
            None,
        );
        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        manager
            .register_position(2, "ETHUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        let report = manager.sweeper.sweep(&token).await.unwrap();

        // BTCUSDT sorts first and is still applied; ETHUSDT is never fetched
        assert_eq!(report.ticks.len(), 1);
        assert_eq!(report.ticks[0].symbol, "BTCUSDT");
        assert!(report.ticks[0].price.is_succeeded());
        assert!(report.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_not_blocked_by_slow_price_fetches() {
        let manager = OrderManager::new(
            OrderManagerConfig::default(),
            Arc::new(RecordingGateway::default()),
            Arc::new(SlowPrices {
                delay: Duration::from_secs(30),
            }),
            None,
        );
        for (trade_id, symbol) in [(1, "BTCUSDT"), (2, "ETHUSDT"), (3, "SOLUSDT")] {
            manager
                .register_position(trade_id, symbol, Side::Buy, 100.0, 1.0, None)
                .await
                .unwrap();
        }

        let sweeping = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.sweep_now().await })
        };
        // Let the sweep get stuck in its first price fetch
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        let snapshot = tokio::time::timeout(Duration::from_secs(1), manager.managed_positions())
            .await
            .expect("snapshot waited for the sweep")
            .unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::timeout(
            Duration::from_secs(1),
            manager.register_position(4, "XRPUSDT", Side::Sell, 0.5, 100.0, None),
        )
        .await
        .expect("registration waited for the sweep")
        .unwrap();
        assert!(!sweeping.is_finished());

        // Positions registered mid-sweep wait for the next one
        let report = sweeping.await.unwrap().unwrap();
        assert_eq!(report.ticks.len(), 3);
        assert!(report.tick("XRPUSDT").is_none());
    }

    #[tokio::test]
    async fn test_register_restores_recorded_trailing_state() {
        let gateway = Arc::new(RecordingGateway::default());
        let recorder = Arc::new(RecordingRecorder::default());
        recorder.stored.lock().unwrap().insert(
            5,
            TrailingInfo {
                trade_id: 5,
                highest_price: 110.0,
                lowest_price: 99.0,
                stop_loss: 108.9,
                updated_at: Utc::now(),
            },
        );
        let manager = manager_with(
            gateway.clone(),
            Arc::new(ScriptedPrices::default()),
            Some(recorder),
        );

        let registration = manager
            .register_position(5, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        assert!(registration.restored_trailing);
        assert!(registration.position.trailing_active);
        assert_eq!(registration.position.highest_price, 110.0);
        assert_close(registration.position.stop_loss_price, 108.9);
        // The protective stop goes out at the restored level
        assert_close(gateway.placed()[1].stop_price.unwrap(), 108.9);
        assert_close(registration.position.take_profit_price, 105.0);
    }

    #[tokio::test]
    async fn test_unknown_trade_registers_fresh() {
        let recorder = Arc::new(RecordingRecorder::default());
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            Arc::new(ScriptedPrices::default()),
            Some(recorder),
        );

        let registration = manager
            .register_position(6, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();

        assert!(!registration.restored_trailing);
        assert!(!registration.position.trailing_active);
        assert_close(registration.position.stop_loss_price, 98.0);
    }

    #[tokio::test]
    async fn test_unregister_closes_trade_record() {
        let recorder = Arc::new(RecordingRecorder::default());
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            Arc::new(ScriptedPrices::default()),
            Some(recorder.clone()),
        );

        manager
            .register_position(9, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        let result = manager.unregister_position("BTCUSDT").await.unwrap();

        assert!(result.close_record.is_succeeded());
        assert_eq!(*recorder.closed.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_manager() {
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            Arc::new(ScriptedPrices::default()),
            None,
        );

        manager.shutdown().await;

        assert!(matches!(
            manager.managed_positions().await,
            Err(Error::ManagerClosed)
        ));
        assert!(matches!(
            manager.sweep_now().await,
            Err(Error::ManagerClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_sweeps_until_stopped() {
        let prices = Arc::new(ScriptedPrices::default());
        let manager = manager_with(
            Arc::new(RecordingGateway::default()),
            prices.clone(),
            None,
        );
        manager
            .register_position(1, "BTCUSDT", Side::Buy, 100.0, 1.0, None)
            .await
            .unwrap();
        prices.set("BTCUSDT", 110.0);

        manager.start();
        manager.start(); // idempotent
        assert!(manager.is_running());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert!(stored.trailing_active);
        assert_eq!(stored.highest_price, 110.0);

        manager.stop();
        manager.stop(); // idempotent
        assert!(!manager.is_running());

        prices.set("BTCUSDT", 120.0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.highest_price, 110.0);

        // Restart picks the new price up on the next tick
        manager.start();
        tokio::time::sleep(Duration::from_secs(6)).await;
        let stored = manager.managed_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.highest_price, 120.0);

        manager.shutdown().await;
        assert!(!manager.is_running());
    }
}
