use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use common::models::{DcaParams, NewOrder, OrderType, Side, TenantConfig};
use common::symbols::{normalize_symbol, split_pair};
use exchange::retry::with_retries;
use exchange::{Connector, OrderRequest};
use storage::repositories::{OrdersRepository, TenantsRepository};

use crate::error::EngineError;
use crate::lifecycle::{CALL_RETRIES, CALL_RETRY_DELAY};
use crate::sizing::{self, round_to_precision, SizingError};

/// Profit target over the ladder's average entry (~1.5%).
pub const TP_MARGIN: f64 = 0.015;
/// Each deeper layer arms 1% further below the average.
pub const LAYER_STEP: f64 = 0.01;

/// Everything one tick decision needs, read before deciding.
#[derive(Debug, Clone)]
pub struct LadderSnapshot {
    pub layer_count: u32,
    pub total_amount: f64,
    pub total_cost: f64,
    pub current_price: f64,
    pub quote_balance: f64,
    pub order_size: f64,
    pub max_layers: u32,
    pub quantity_precision: u32,
    pub price_precision: u32,
}

impl LadderSnapshot {
    /// Average entry across recorded layers; falls back to the current
    /// price for an empty ladder.
    pub fn average_price(&self) -> f64 {
        if self.total_amount > 0.0 {
            self.total_cost / self.total_amount
        } else {
            self.current_price
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LadderAction {
    /// Market-buy the first layer.
    Start { quantity: f64 },
    /// Sell the whole accumulated position.
    TakeProfit { quantity: f64, total_cost: f64 },
    /// Limit-buy one more layer below the average.
    AddLayer { layer: u32, price: f64, quantity: f64 },
    Hold { reason: HoldReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    InsufficientBalance,
    AboveNextLayer,
    Exhausted,
}

/// One tick of the ladder state machine. Exactly one action applies;
/// take-profit always outranks adding a layer.
pub fn decide(snapshot: &LadderSnapshot) -> Result<LadderAction, SizingError> {
    let average = snapshot.average_price();

    if snapshot.layer_count == 0 {
        if snapshot.quote_balance >= snapshot.order_size {
            let quantity = sizing::to_quantity(
                snapshot.order_size,
                snapshot.current_price,
                snapshot.quantity_precision,
            )?;
            return Ok(LadderAction::Start { quantity });
        }
        return Ok(LadderAction::Hold {
            reason: HoldReason::InsufficientBalance,
        });
    }

    if snapshot.current_price >= average * (1.0 + TP_MARGIN) {
        return Ok(LadderAction::TakeProfit {
            quantity: snapshot.total_amount,
            total_cost: snapshot.total_cost,
        });
    }

    if snapshot.layer_count < snapshot.max_layers {
        let next_price = round_to_precision(
            average * (1.0 - LAYER_STEP * (snapshot.layer_count + 1) as f64),
            snapshot.price_precision,
        );
        if snapshot.current_price <= next_price && snapshot.quote_balance >= snapshot.order_size {
            let quantity =
                sizing::to_quantity(snapshot.order_size, next_price, snapshot.quantity_precision)?;
            return Ok(LadderAction::AddLayer {
                layer: snapshot.layer_count + 1,
                price: next_price,
                quantity,
            });
        }
        return Ok(LadderAction::Hold {
            reason: HoldReason::AboveNextLayer,
        });
    }

    Ok(LadderAction::Hold {
        reason: HoldReason::Exhausted,
    })
}

#[derive(Debug, Default, Serialize)]
pub struct DcaRunReport {
    pub processed: u32,
    pub held: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Timer-driven accumulation across all tenants in dca mode. Tenants are
/// processed independently; one failure is counted and the walk continues.
pub struct DcaEngine {
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
}

impl DcaEngine {
    pub fn new(pool: SqlitePool, connector: Arc<dyn Connector>) -> Self {
        Self { pool, connector }
    }

    pub async fn run_all(&self) -> Result<DcaRunReport, sqlx::Error> {
        let tenants = TenantsRepository::list_dca_enabled(&self.pool).await?;
        let mut report = DcaRunReport::default();

        for tenant in tenants {
            let Some(params) = tenant.strategy.as_dca().cloned() else {
                report.skipped += 1;
                continue;
            };
            if !params.is_configured() {
                debug!("tenant {} dca not fully configured, skipping", tenant.id);
                report.skipped += 1;
                continue;
            }

            match self.run_tenant(&tenant, &params).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.held += 1,
                Err(e) => {
                    error!("dca tick failed for tenant {}: {e}", tenant.id);
                    report.failed += 1;
                }
            }
        }

        info!(
            "dca tick: {} acted, {} held, {} skipped, {} failed",
            report.processed, report.held, report.skipped, report.failed
        );
        Ok(report)
    }

    /// Returns true when the tick placed or closed an order.
    async fn run_tenant(
        &self,
        tenant: &TenantConfig,
        params: &DcaParams,
    ) -> Result<bool, EngineError> {
        let symbol = normalize_symbol(&params.pair);
        let (_base, quote) = split_pair(&symbol);

        let exchange = self.connector.connect(tenant).await?;
        let market = exchange.market(&symbol)?;
        let current_price = with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
            exchange.last_price(&symbol)
        })
        .await?;
        let quote_balance = exchange.balance(&quote).await?;

        let layers = OrdersRepository::open_orders(&self.pool, tenant.id, &symbol).await?;
        let mut total_amount = 0.0;
        let mut total_cost = 0.0;
        for layer in &layers {
            total_amount += layer.amount;
            total_cost += layer.price.unwrap_or(0.0) * layer.amount;
        }

        let snapshot = LadderSnapshot {
            layer_count: layers.len() as u32,
            total_amount,
            total_cost,
            current_price,
            quote_balance,
            order_size: params.order_size,
            max_layers: params.max_layers,
            quantity_precision: market.quantity_precision,
            price_precision: market.price_precision,
        };

        match decide(&snapshot)? {
            LadderAction::Start { quantity } => {
                let request = OrderRequest::market(&symbol, Side::Buy, quantity);
                let submitted = exchange.submit_order(&request).await?;
                let confirmed = with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
                    exchange.confirm_order(&submitted.order_id, &symbol)
                })
                .await?;
                let fill_price = confirmed.avg_price.unwrap_or(current_price);

                let record = NewOrder {
                    tenant_id: tenant.id,
                    exchange: tenant.exchange,
                    order_id: submitted.order_id,
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    order_type: OrderType::Market,
                    amount: quantity,
                    price: Some(fill_price),
                    layer: Some(1),
                    raw: submitted.raw,
                };
                OrdersRepository::record_open(&self.pool, &record).await?;
                info!(
                    "tenant {}: new ladder on {symbol}, layer 1 @ {fill_price}",
                    tenant.id
                );
                Ok(true)
            }
            LadderAction::TakeProfit {
                quantity,
                total_cost,
            } => {
                let request = OrderRequest::market(&symbol, Side::Sell, quantity).reduce_only();
                let submitted = exchange.submit_order(&request).await?;
                let confirmed = with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
                    exchange.confirm_order(&submitted.order_id, &symbol)
                })
                .await?;
                let sale_price = confirmed.avg_price.unwrap_or(current_price);
                let profit = sale_price * quantity - total_cost;

                let closed = OrdersRepository::close_all_open(
                    &self.pool,
                    tenant.id,
                    &symbol,
                    profit,
                    &submitted.raw,
                )
                .await?;
                info!(
                    "tenant {}: take-profit on {symbol}, sold {quantity} across {closed} layers, profit {profit:.4}",
                    tenant.id
                );
                Ok(true)
            }
            LadderAction::AddLayer {
                layer,
                price,
                quantity,
            } => {
                let request = OrderRequest::limit(&symbol, Side::Buy, quantity, price);
                let submitted = exchange.submit_order(&request).await?;

                let record = NewOrder {
                    tenant_id: tenant.id,
                    exchange: tenant.exchange,
                    order_id: submitted.order_id,
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    amount: quantity,
                    price: Some(price),
                    layer: Some(layer),
                    raw: submitted.raw,
                };
                OrdersRepository::record_open(&self.pool, &record).await?;
                info!(
                    "tenant {}: ladder layer {layer} on {symbol} @ {price}",
                    tenant.id
                );
                Ok(true)
            }
            LadderAction::Hold { reason } => {
                debug!("tenant {}: {symbol} holding ({reason:?})", tenant.id);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{
        confirmed_fill, market, memory_pool, mock_connector, mock_exchange, seed_dca_tenant,
        submitted,
    };

    fn snapshot() -> LadderSnapshot {
        LadderSnapshot {
            layer_count: 0,
            total_amount: 0.0,
            total_cost: 0.0,
            current_price: 100.0,
            quote_balance: 100.0,
            order_size: 15.0,
            max_layers: 5,
            quantity_precision: 3,
            price_precision: 2,
        }
    }

    #[test]
    fn starts_an_empty_ladder_when_funded() {
        let action = decide(&snapshot()).unwrap();
        assert_eq!(action, LadderAction::Start { quantity: 0.15 });
    }

    #[test]
    fn holds_an_empty_ladder_without_balance() {
        let mut s = snapshot();
        s.quote_balance = 10.0;
        assert_eq!(
            decide(&s).unwrap(),
            LadderAction::Hold {
                reason: HoldReason::InsufficientBalance
            }
        );
    }

    #[test]
    fn takes_profit_above_the_margin() {
        let mut s = snapshot();
        s.layer_count = 2;
        s.total_amount = 0.3;
        s.total_cost = 30.0; // average 100
        s.current_price = 101.5; // exactly at the 1.5% margin
        assert_eq!(
            decide(&s).unwrap(),
            LadderAction::TakeProfit {
                quantity: 0.3,
                total_cost: 30.0
            }
        );
    }

    #[test]
    fn take_profit_outranks_exhaustion() {
        let mut s = snapshot();
        s.layer_count = 5; // ladder full
        s.total_amount = 0.75;
        s.total_cost = 75.0;
        s.current_price = 110.0;
        assert!(matches!(
            decide(&s).unwrap(),
            LadderAction::TakeProfit { .. }
        ));
    }

    #[test]
    fn adds_a_layer_when_price_reaches_the_next_rung() {
        let mut s = snapshot();
        s.layer_count = 1;
        s.total_amount = 0.15;
        s.total_cost = 15.0; // average 100
        s.current_price = 97.9; // next rung at 100 * (1 - 0.02) = 98
        let action = decide(&s).unwrap();
        match action {
            LadderAction::AddLayer {
                layer,
                price,
                quantity,
            } => {
                assert_eq!(layer, 2);
                assert_eq!(price, 98.0);
                assert_eq!(quantity, 0.153); // 15 / 98 rounded to 3 decimals
            }
            other => panic!("expected AddLayer, got {other:?}"),
        }
    }

    #[test]
    fn waits_above_the_next_rung() {
        let mut s = snapshot();
        s.layer_count = 1;
        s.total_amount = 0.15;
        s.total_cost = 15.0;
        s.current_price = 99.0;
        assert_eq!(
            decide(&s).unwrap(),
            LadderAction::Hold {
                reason: HoldReason::AboveNextLayer
            }
        );
    }

    #[test]
    fn exhausted_ladder_holds_below_all_rungs() {
        let mut s = snapshot();
        s.layer_count = 5;
        s.total_amount = 0.75;
        s.total_cost = 75.0;
        s.current_price = 80.0;
        assert_eq!(
            decide(&s).unwrap(),
            LadderAction::Hold {
                reason: HoldReason::Exhausted
            }
        );
    }

    #[tokio::test]
    async fn first_tick_records_exactly_one_layer() {
        let pool = memory_pool().await;
        let tenant = seed_dca_tenant(&pool, "BTCUSDT", 15.0, 5).await;

        let mut connector = mock_connector();
        connector.expect_connect().returning(|_| {
            let mut mock = mock_exchange();
            mock.expect_market().returning(|_| Ok(market(3, 2)));
            mock.expect_last_price().returning(|_| Ok(100.0));
            mock.expect_balance().returning(|_| Ok(500.0));
            mock.expect_submit_order()
                .withf(|req| {
                    req.side == Side::Buy
                        && req.order_type == OrderType::Market
                        && req.quantity == 0.15
                })
                .times(1)
                .returning(|_| Ok(submitted("dca-1")));
            mock.expect_confirm_order()
                .returning(|_, _| Ok(confirmed_fill(Some(100.2), 0.15)));
            Ok(Arc::new(mock) as Arc<dyn exchange::Exchange>)
        });

        let engine = DcaEngine::new(pool.clone(), Arc::new(connector));
        let report = engine.run_all().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let layers = OrdersRepository::open_orders(&pool, tenant.id, "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].layer, Some(1));
        assert_eq!(layers[0].price, Some(100.2));
    }

    #[tokio::test]
    async fn take_profit_collapses_every_layer() {
        let pool = memory_pool().await;
        let tenant = seed_dca_tenant(&pool, "BTCUSDT", 15.0, 5).await;

        // two recorded layers, average 99
        for (order_id, layer, price, amount) in
            [("l1", 1u32, 100.0, 0.15), ("l2", 2u32, 98.0, 0.15)]
        {
            let record = NewOrder {
                tenant_id: tenant.id,
                exchange: tenant.exchange,
                order_id: order_id.to_string(),
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                amount,
                price: Some(price),
                layer: Some(layer),
                raw: serde_json::Value::Null,
            };
            OrdersRepository::record_open(&pool, &record).await.unwrap();
        }

        let mut connector = mock_connector();
        connector.expect_connect().returning(|_| {
            let mut mock = mock_exchange();
            mock.expect_market().returning(|_| Ok(market(3, 2)));
            // 99 * 1.015 = 100.485; price is past the target
            mock.expect_last_price().returning(|_| Ok(101.0));
            mock.expect_balance().returning(|_| Ok(500.0));
            mock.expect_submit_order()
                .withf(|req| {
                    req.side == Side::Sell && req.reduce_only && req.quantity == 0.3
                })
                .times(1)
                .returning(|_| Ok(submitted("sell-all")));
            mock.expect_confirm_order()
                .returning(|_, _| Ok(confirmed_fill(Some(101.0), 0.3)));
            Ok(Arc::new(mock) as Arc<dyn exchange::Exchange>)
        });

        let engine = DcaEngine::new(pool.clone(), Arc::new(connector));
        let report = engine.run_all().await.unwrap();
        assert_eq!(report.processed, 1);

        assert!(OrdersRepository::open_orders(&pool, tenant.id, "BTCUSDT")
            .await
            .unwrap()
            .is_empty());

        let history = OrdersRepository::history(&pool, tenant.id).await.unwrap();
        assert_eq!(history.len(), 2);
        for record in &history {
            assert_eq!(record.status, common::models::OrderStatus::Closed);
            // proceeds 0.3 * 101 = 30.3, cost 29.7
            let profit = record.profit.unwrap();
            assert!((profit - 0.6).abs() < 1e-9, "profit was {profit}");
        }
    }

    #[tokio::test]
    async fn exhausted_ladder_places_nothing() {
        let pool = memory_pool().await;
        let tenant = seed_dca_tenant(&pool, "BTCUSDT", 15.0, 2).await;

        for (order_id, layer) in [("l1", 1u32), ("l2", 2u32)] {
            let record = NewOrder {
                tenant_id: tenant.id,
                exchange: tenant.exchange,
                order_id: order_id.to_string(),
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                amount: 0.15,
                price: Some(100.0),
                layer: Some(layer),
                raw: serde_json::Value::Null,
            };
            OrdersRepository::record_open(&pool, &record).await.unwrap();
        }

        let mut connector = mock_connector();
        connector.expect_connect().returning(|_| {
            let mut mock = mock_exchange();
            mock.expect_market().returning(|_| Ok(market(3, 2)));
            mock.expect_last_price().returning(|_| Ok(80.0));
            mock.expect_balance().returning(|_| Ok(500.0));
            mock.expect_submit_order().times(0);
            Ok(Arc::new(mock) as Arc<dyn exchange::Exchange>)
        });

        let engine = DcaEngine::new(pool.clone(), Arc::new(connector));
        let report = engine.run_all().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.held, 1);

        assert_eq!(
            OrdersRepository::open_orders(&pool, tenant.id, "BTCUSDT")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn one_broken_tenant_does_not_stop_the_walk() {
        let pool = memory_pool().await;
        let broken = seed_dca_tenant(&pool, "BTCUSDT", 15.0, 5).await;
        let healthy = seed_dca_tenant(&pool, "ETHUSDT", 15.0, 5).await;
        let broken_id = broken.id;

        let mut connector = mock_connector();
        connector.expect_connect().returning(move |tenant| {
            if tenant.id == broken_id {
                return Err(exchange::ExchangeError::Auth("expired key".into()));
            }
            let mut mock = mock_exchange();
            mock.expect_market().returning(|_| Ok(market(3, 2)));
            mock.expect_last_price().returning(|_| Ok(100.0));
            mock.expect_balance().returning(|_| Ok(500.0));
            mock.expect_submit_order().returning(|_| Ok(submitted("eth-1")));
            mock.expect_confirm_order()
                .returning(|_, _| Ok(confirmed_fill(Some(100.0), 0.15)));
            Ok(Arc::new(mock) as Arc<dyn exchange::Exchange>)
        });

        let engine = DcaEngine::new(pool.clone(), Arc::new(connector));
        let report = engine.run_all().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);

        assert_eq!(
            OrdersRepository::open_orders(&pool, healthy.id, "ETHUSDT")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
