use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::OrderGateway;
use crate::models::{OrderAck, OrderRequest};
use crate::{Error, Result};

const FIRST_ORDER_ID: i64 = 1_000_000;

/// In-memory order book used for dry runs and replays
///
/// Accepts every order, hands out increasing ids and remembers what is
/// still open so cancels can be checked.
pub struct PaperOrderGateway {
    next_id: AtomicI64,
    open_orders: Mutex<HashMap<i64, OrderRequest>>,
}

impl PaperOrderGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(FIRST_ORDER_ID),
            open_orders: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of orders placed and not yet cancelled
    pub fn open_orders(&self) -> Vec<(i64, OrderRequest)> {
        let orders = self
            .open_orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<_> = orders.iter().map(|(id, o)| (*id, o.clone())).collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }
}

impl Default for PaperOrderGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderGateway for PaperOrderGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let order_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Same parameters a signed exchange request would carry
        tracing::info!(
            order_id,
            params = ?request.params(),
            "📝 Paper order placed"
        );

        self.open_orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(order_id, request.clone());

        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let removed = self
            .open_orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&order_id);

        match removed {
            Some(order) if order.symbol == symbol => {
                tracing::info!(order_id, symbol, "Paper order cancelled");
                Ok(())
            }
            Some(order) => {
                // Wrong symbol: put it back untouched
                self.open_orders
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(order_id, order);
                Err(Error::Exchange {
                    code: -2011,
                    message: format!("order {} does not belong to {}", order_id, symbol),
                })
            }
            None => Err(Error::Exchange {
                code: -2011,
                message: format!("Unknown order sent: {}", order_id),
            }),
        }
    }
}
