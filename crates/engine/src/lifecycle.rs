use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use common::models::{OrderRecord, OrderType, Side, SignalParams};
use exchange::retry::with_retries;
use exchange::{Exchange, OrderRequest};

use crate::error::EngineError;
use crate::sizing::{self, round_to_precision};

pub const CALL_RETRIES: u32 = 3;
pub const CALL_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const POSITION_POLL_ATTEMPTS: u32 = 5;
pub const POSITION_POLL_DELAY: Duration = Duration::from_millis(500);

/// Confirmed result of one submitted order.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub entry_price: Option<f64>,
    pub status: String,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

/// Walks one order through submit -> confirm -> optional bracket. All calls
/// against a single tenant session run sequentially; later steps depend on
/// earlier results.
pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self { exchange }
    }

    /// Open a position. For market orders `amount` is a USDT notional and
    /// is converted at the last price; for limit orders it is already an
    /// explicit base quantity and passes through.
    pub async fn open(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        amount: f64,
        limit_price: Option<f64>,
        params: &SignalParams,
    ) -> Result<ExecutedOrder, EngineError> {
        let market = self.exchange.market(symbol)?;

        if params.leverage > 0 {
            self.exchange.set_leverage(symbol, params.leverage).await?;
        }

        let quantity = match order_type {
            OrderType::Market => {
                let last = with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
                    self.exchange.last_price(symbol)
                })
                .await?;
                let quantity = sizing::to_quantity(amount, last, market.quantity_precision)?;
                info!("converted {amount} USDT -> {quantity} {symbol}");
                quantity
            }
            OrderType::Limit => amount,
        };

        let request = match order_type {
            OrderType::Market => OrderRequest::market(symbol, side, quantity),
            OrderType::Limit => {
                let price = limit_price.ok_or(sizing::SizingError::PriceUnavailable)?;
                OrderRequest::limit(symbol, side, quantity, price)
            }
        };

        // Submission is never retried: a lost reply could mean a live order,
        // and a second submit would double it. Confirmation is a read and
        // retries safely.
        let submitted = self.exchange.submit_order(&request).await?;
        let confirmed = with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
            self.exchange.confirm_order(&submitted.order_id, symbol)
        })
        .await?;

        // Limit fills are not guaranteed yet, so the requested price is the
        // entry; market entries use the confirmed average fill.
        let entry_price = match order_type {
            OrderType::Limit => limit_price,
            OrderType::Market => confirmed.avg_price,
        };

        if params.bracket_enabled && order_type == OrderType::Market {
            if let Err(e) = self
                .place_bracket(symbol, side, quantity, entry_price, market.price_precision, params)
                .await
            {
                // A position without its bracket is safer to report than to
                // roll back; surface the main order as successful.
                warn!("bracket placement failed for {symbol}: {e}");
            }
        }

        Ok(ExecutedOrder {
            order_id: submitted.order_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            entry_price,
            status: confirmed.status,
            raw: submitted.raw,
        })
    }

    async fn place_bracket(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: Option<f64>,
        price_precision: u32,
        params: &SignalParams,
    ) -> Result<(), EngineError> {
        let Some(entry) = entry_price else {
            warn!("no entry price for {symbol}, skipping bracket");
            return Ok(());
        };
        if params.take_profit_pct <= 0.0 && params.stop_loss_pct <= 0.0 {
            return Ok(());
        }

        // The fill is confirmed but the position can lag; bounded wait.
        let mut active = false;
        for attempt in 1..=POSITION_POLL_ATTEMPTS {
            match self.exchange.positions(Some(symbol)).await {
                Ok(positions) if !positions.is_empty() => {
                    active = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!("position poll {attempt}/{POSITION_POLL_ATTEMPTS} for {symbol}: {e}")
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(POSITION_POLL_DELAY).await;
        }
        if !active {
            warn!("position for {symbol} never appeared, skipping bracket");
            return Ok(());
        }

        // Offsets point away from the position's risk: longs exit above and
        // stop below, shorts the other way around.
        let (tp_raw, sl_raw) = match side {
            Side::Buy => (
                entry * (1.0 + params.take_profit_pct / 100.0),
                entry * (1.0 - params.stop_loss_pct / 100.0),
            ),
            Side::Sell => (
                entry * (1.0 - params.take_profit_pct / 100.0),
                entry * (1.0 + params.stop_loss_pct / 100.0),
            ),
        };
        let opposite = side.opposite();

        if params.take_profit_pct > 0.0 {
            let tp_price = round_to_precision(tp_raw, price_precision);
            let request = OrderRequest::limit(symbol, opposite, quantity, tp_price).reduce_only();
            match self.exchange.submit_order(&request).await {
                Ok(order) => info!("TP placed @ {tp_price} ({})", order.order_id),
                Err(e) => warn!("TP failed for {symbol}: {e}"),
            }
        }

        if params.stop_loss_pct > 0.0 {
            let sl_price = round_to_precision(sl_raw, price_precision);
            let request = OrderRequest::market(symbol, opposite, quantity)
                .reduce_only()
                .stop_at(sl_price);
            match self.exchange.submit_order(&request).await {
                Ok(order) => info!("SL placed @ {sl_price} ({})", order.order_id),
                Err(e) => warn!("SL failed for {symbol}: {e}"),
            }
        }

        Ok(())
    }

    /// Close a previously recorded position with a reduce-only market order
    /// on the opposite side. Returns the executed order and the realized
    /// profit, signed by the record's original side.
    pub async fn close(&self, record: &OrderRecord) -> Result<(ExecutedOrder, f64), EngineError> {
        let side = record.side.opposite();
        let request = OrderRequest::market(&record.symbol, side, record.amount).reduce_only();

        let submitted = self.exchange.submit_order(&request).await?;
        let confirmed = with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
            self.exchange.confirm_order(&submitted.order_id, &record.symbol)
        })
        .await?;

        let close_price = match confirmed.avg_price {
            Some(price) => price,
            None => {
                with_retries(CALL_RETRIES, CALL_RETRY_DELAY, || {
                    self.exchange.last_price(&record.symbol)
                })
                .await?
            }
        };

        let open_notional = record.price.unwrap_or(close_price) * record.amount;
        let close_notional = close_price * record.amount;
        let profit = match record.side {
            Side::Buy => close_notional - open_notional,
            Side::Sell => open_notional - close_notional,
        };

        Ok((
            ExecutedOrder {
                order_id: submitted.order_id,
                symbol: record.symbol.clone(),
                side,
                order_type: OrderType::Market,
                quantity: record.amount,
                entry_price: Some(close_price),
                status: confirmed.status,
                raw: submitted.raw,
            },
            profit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{confirmed_fill, market, mock_exchange, signal_params, submitted};
    use common::models::{ExchangeId, OrderStatus};
    use exchange::Position;

    fn record(side: Side, amount: f64, price: f64) -> OrderRecord {
        OrderRecord {
            id: 1,
            tenant_id: uuid::Uuid::new_v4(),
            exchange: ExchangeId::Binance,
            order_id: "10".into(),
            symbol: "BTCUSDT".into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: Some(price),
            status: OrderStatus::Open,
            profit: None,
            layer: None,
            raw: serde_json::Value::Null,
            raw_close: None,
            created_at: chrono::Utc::now(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn market_open_sizes_from_notional_and_uses_fill_price() {
        let mut mock = mock_exchange();
        mock.expect_market().returning(|_| Ok(market(3, 1)));
        mock.expect_set_leverage()
            .withf(|symbol, leverage| symbol == "BTCUSDT" && *leverage == 2)
            .returning(|_, _| Ok(()));
        mock.expect_last_price().returning(|_| Ok(2.0));
        mock.expect_submit_order()
            .withf(|req| {
                req.quantity == 3.0 && req.side == Side::Buy && !req.reduce_only
            })
            .times(1)
            .returning(|_| Ok(submitted("55")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(Some(2.01), 3.0)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let mut params = signal_params();
        params.leverage = 2;
        let executed = executor
            .open("BTCUSDT", Side::Buy, OrderType::Market, 6.0, None, &params)
            .await
            .unwrap();

        assert_eq!(executed.order_id, "55");
        assert_eq!(executed.quantity, 3.0);
        assert_eq!(executed.entry_price, Some(2.01));
    }

    #[tokio::test]
    async fn limit_open_passes_quantity_through_and_keeps_requested_price() {
        let mut mock = mock_exchange();
        mock.expect_market().returning(|_| Ok(market(3, 1)));
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_last_price().times(0);
        mock.expect_submit_order()
            .withf(|req| req.quantity == 0.5 && req.price == Some(99.5))
            .times(1)
            .returning(|_| Ok(submitted("56")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(None, 0.0)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let executed = executor
            .open(
                "BTCUSDT",
                Side::Buy,
                OrderType::Limit,
                0.5,
                Some(99.5),
                &signal_params(),
            )
            .await
            .unwrap();

        assert_eq!(executed.entry_price, Some(99.5));
    }

    #[tokio::test]
    async fn bracket_places_reduce_only_legs_on_both_sides_of_entry() {
        let mut mock = mock_exchange();
        mock.expect_market().returning(|_| Ok(market(3, 1)));
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_last_price().returning(|_| Ok(100.0));
        mock.expect_positions().returning(|_| {
            Ok(vec![Position {
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                size: 0.06,
                entry_price: 100.0,
            }])
        });

        // main + TP + SL
        let mut sequence = mockall::Sequence::new();
        mock.expect_submit_order()
            .withf(|req| !req.reduce_only)
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(submitted("60")));
        mock.expect_submit_order()
            .withf(|req| {
                req.reduce_only
                    && req.side == Side::Sell
                    && req.order_type == OrderType::Limit
                    && req.price == Some(102.0)
            })
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(submitted("61")));
        mock.expect_submit_order()
            .withf(|req| {
                req.reduce_only && req.side == Side::Sell && req.stop_price == Some(99.0)
            })
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(submitted("62")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(Some(100.0), 0.06)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let mut params = signal_params();
        params.bracket_enabled = true;
        params.take_profit_pct = 2.0;
        params.stop_loss_pct = 1.0;

        executor
            .open("BTCUSDT", Side::Buy, OrderType::Market, 6.0, None, &params)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn short_bracket_flips_the_offsets() {
        let mut mock = mock_exchange();
        mock.expect_market().returning(|_| Ok(market(3, 1)));
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_last_price().returning(|_| Ok(100.0));
        mock.expect_positions().returning(|_| {
            Ok(vec![Position {
                symbol: "BTCUSDT".into(),
                side: Side::Sell,
                size: 0.06,
                entry_price: 100.0,
            }])
        });
        mock.expect_submit_order()
            .withf(|req| !req.reduce_only)
            .times(1)
            .returning(|_| Ok(submitted("70")));
        // TP below entry, SL above entry for a short
        mock.expect_submit_order()
            .withf(|req| req.reduce_only && req.side == Side::Buy && req.price == Some(98.0))
            .times(1)
            .returning(|_| Ok(submitted("71")));
        mock.expect_submit_order()
            .withf(|req| req.reduce_only && req.side == Side::Buy && req.stop_price == Some(101.0))
            .times(1)
            .returning(|_| Ok(submitted("72")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(Some(100.0), 0.06)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let mut params = signal_params();
        params.bracket_enabled = true;
        params.take_profit_pct = 2.0;
        params.stop_loss_pct = 1.0;

        executor
            .open("BTCUSDT", Side::Sell, OrderType::Market, 6.0, None, &params)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_position_skips_bracket_but_reports_success() {
        let mut mock = mock_exchange();
        mock.expect_market().returning(|_| Ok(market(3, 1)));
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_last_price().returning(|_| Ok(100.0));
        mock.expect_positions()
            .times(POSITION_POLL_ATTEMPTS as usize)
            .returning(|_| Ok(Vec::new()));
        // only the main order; no bracket legs
        mock.expect_submit_order()
            .times(1)
            .returning(|_| Ok(submitted("80")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(Some(100.0), 0.06)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let mut params = signal_params();
        params.bracket_enabled = true;
        params.take_profit_pct = 2.0;
        params.stop_loss_pct = 1.0;

        let executed = executor
            .open("BTCUSDT", Side::Buy, OrderType::Market, 6.0, None, &params)
            .await
            .unwrap();
        assert_eq!(executed.order_id, "80");
    }

    #[tokio::test]
    async fn close_inverts_side_and_signs_profit() {
        let mut mock = mock_exchange();
        mock.expect_submit_order()
            .withf(|req| req.reduce_only && req.side == Side::Sell && req.quantity == 0.1)
            .times(1)
            .returning(|_| Ok(submitted("90")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(Some(110.0), 0.1)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let (executed, profit) = executor.close(&record(Side::Buy, 0.1, 100.0)).await.unwrap();

        assert_eq!(executed.side, Side::Sell);
        assert!((profit - 1.0).abs() < 1e-9); // 0.1 * (110 - 100)
    }

    #[tokio::test]
    async fn closing_a_short_profits_when_price_fell() {
        let mut mock = mock_exchange();
        mock.expect_submit_order()
            .withf(|req| req.reduce_only && req.side == Side::Buy)
            .returning(|_| Ok(submitted("91")));
        mock.expect_confirm_order()
            .returning(|_, _| Ok(confirmed_fill(Some(90.0), 0.1)));

        let executor = OrderExecutor::new(Arc::new(mock));
        let (_, profit) = executor.close(&record(Side::Sell, 0.1, 100.0)).await.unwrap();

        assert!((profit - 1.0).abs() < 1e-9); // 0.1 * (100 - 90)
    }
}
