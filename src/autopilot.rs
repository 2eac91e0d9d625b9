use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::{CandleSource, OrderGateway};
use crate::config::{ReversalConfig, TradingConfig};
use crate::db::PostgresTradeStore;
use crate::execution::{OrderManager, Registration};
use crate::models::OrderRequest;
use crate::reversal::{MtfReversalAnalysis, MtfReversalAnalyzer};
use crate::{Error, Result};

/// What a scan decided for one symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum ScanDecision {
    AlreadyManaged,
    NotAligned,
    /// Aligned without a 5m pattern to take the entry from
    NoEntryPrice,
    BelowMinScore,
    EntryFailed(String),
    Opened { trade_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub symbol: String,
    pub analysis: Option<MtfReversalAnalysis>,
    pub decision: ScanDecision,
    pub registration: Option<Registration>,
}

impl ScanReport {
    fn skipped(symbol: &str, analysis: Option<MtfReversalAnalysis>, decision: ScanDecision) -> Self {
        Self {
            symbol: symbol.to_string(),
            analysis,
            decision,
            registration: None,
        }
    }
}

/// Scans symbols for aligned reversals and hands new positions to the order manager
pub struct ReversalAutopilot {
    analyzer: MtfReversalAnalyzer,
    order_manager: OrderManager,
    gateway: Arc<dyn OrderGateway>,
    trade_store: Option<Arc<PostgresTradeStore>>,
    reversal: ReversalConfig,
    trading: TradingConfig,
    next_dry_run_id: AtomicI64,
}

impl ReversalAutopilot {
    pub fn new(
        candles: Arc<dyn CandleSource>,
        order_manager: OrderManager,
        gateway: Arc<dyn OrderGateway>,
        reversal: ReversalConfig,
        trading: TradingConfig,
    ) -> Self {
        Self {
            analyzer: MtfReversalAnalyzer::new(candles),
            order_manager,
            gateway,
            trade_store: None,
            reversal,
            trading,
            // Millisecond clock start keeps dry-run ids unique across restarts
            next_dry_run_id: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Record every opened trade in Postgres
    pub fn with_trade_store(mut self, store: Arc<PostgresTradeStore>) -> Self {
        self.trade_store = Some(store);
        self
    }

    pub fn order_manager(&self) -> &OrderManager {
        &self.order_manager
    }

    /// Analyse one symbol and open a position when the setup qualifies
    ///
    /// Only fails when the order manager is gone.
    pub async fn scan_symbol(&self, symbol: &str) -> Result<ScanReport> {
        if self.order_manager.is_managed(symbol).await? {
            tracing::debug!(symbol, "Already managing a position, skipping scan");
            return Ok(ScanReport::skipped(symbol, None, ScanDecision::AlreadyManaged));
        }

        let analysis = self
            .analyzer
            .analyze(symbol, self.reversal.consecutive_candles)
            .await;

        let direction = match (analysis.aligned, analysis.direction) {
            (true, Some(direction)) => direction,
            _ => {
                return Ok(ScanReport::skipped(
                    symbol,
                    Some(analysis),
                    ScanDecision::NotAligned,
                ))
            }
        };

        if analysis.entry_price <= 0.0 {
            tracing::info!(symbol, "Aligned reversal without a 5m entry price, skipping");
            return Ok(ScanReport::skipped(
                symbol,
                Some(analysis),
                ScanDecision::NoEntryPrice,
            ));
        }

        if analysis.alignment_score < self.reversal.min_alignment_score {
            tracing::info!(
                symbol,
                score = analysis.alignment_score,
                min_score = self.reversal.min_alignment_score,
                "Alignment score below threshold"
            );
            return Ok(ScanReport::skipped(
                symbol,
                Some(analysis),
                ScanDecision::BelowMinScore,
            ));
        }

        let side = direction.entry_side();
        let entry_price = analysis.entry_price;
        let quantity = self.trading.position_notional_usd / entry_price;

        let trade_id = if self.trading.dry_run {
            let trade_id = self.next_dry_run_id.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                symbol,
                trade_id,
                side = %side,
                entry_price,
                quantity,
                "🧪 Dry run entry"
            );
            trade_id
        } else {
            let entry = OrderRequest::limit(symbol, side, entry_price, quantity);
            match self.gateway.place_order(&entry).await {
                Ok(ack) => {
                    tracing::info!(
                        symbol,
                        order_id = ack.order_id,
                        side = %side,
                        entry_price,
                        quantity,
                        "✅ Entry order placed"
                    );
                    ack.order_id
                }
                Err(e) => {
                    tracing::error!(symbol, "Failed to place entry order: {}", e);
                    return Ok(ScanReport::skipped(
                        symbol,
                        Some(analysis),
                        ScanDecision::EntryFailed(e.to_string()),
                    ));
                }
            }
        };

        let registration = self
            .order_manager
            .register_position(trade_id, symbol, side, entry_price, quantity, None)
            .await?;

        if let Some(store) = &self.trade_store {
            if let Err(e) = store
                .create_trade(&registration.position, self.trading.dry_run)
                .await
            {
                tracing::warn!(symbol, trade_id, "Failed to save trade: {}", e);
            }
        }

        Ok(ScanReport {
            symbol: symbol.to_string(),
            analysis: Some(analysis),
            decision: ScanDecision::Opened { trade_id },
            registration: Some(registration),
        })
    }

    /// Scan every configured symbol once
    pub async fn scan_all(&self) -> Result<Vec<ScanReport>> {
        let mut reports = Vec::with_capacity(self.reversal.symbols.len());
        for symbol in &self.reversal.symbols {
            reports.push(self.scan_symbol(symbol).await?);
        }
        Ok(reports)
    }

    /// Scan on a fixed interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let period = Duration::from_secs(self.reversal.scan_interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            symbols = ?self.reversal.symbols,
            interval_secs = period.as_secs(),
            dry_run = self.trading.dry_run,
            "🔄 Reversal scan loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for symbol in &self.reversal.symbols {
                if cancel.is_cancelled() {
                    break;
                }
                match self.scan_symbol(symbol).await {
                    Ok(report) => {
                        if let ScanDecision::Opened { trade_id } = report.decision {
                            tracing::info!(symbol, trade_id, "📈 Position opened");
                        }
                    }
                    Err(Error::ManagerClosed) => return Err(Error::ManagerClosed),
                    Err(e) => tracing::error!(symbol, "Scan failed: {}", e),
                }
            }
        }

        tracing::info!("Reversal scan loop stopped");
        Ok(())
    }
}
