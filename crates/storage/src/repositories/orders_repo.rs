use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use common::models::{ExchangeId, NewOrder, OrderRecord, OrderStatus, OrderType, Side};

/// What actually happened inside one debit-and-record unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub recorded: bool,
    pub debited: bool,
}

pub struct OrdersRepository;

impl OrdersRepository {
    /// Append the order and deduct the action cost in one transaction. The
    /// exchange-side effect has already happened by the time this runs, so
    /// the unique (tenant, exchange, order_id) key makes a retried write a
    /// no-op instead of a double charge, and a raced-out debit never
    /// un-logs the order.
    pub async fn record_open_and_debit(
        pool: &SqlitePool,
        order: &NewOrder,
        cost: i64,
    ) -> Result<RecordOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let inserted = insert_order(&mut tx, order).await?;
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(RecordOutcome {
                recorded: false,
                debited: false,
            });
        }

        let debited =
            sqlx::query("UPDATE tenants SET credit = credit - ? WHERE id = ? AND credit >= ?")
                .bind(cost)
                .bind(order.tenant_id.to_string())
                .bind(cost)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;
        tx.commit().await?;

        if !debited {
            warn!(
                "tenant {} executed order {} but had no credit left to debit",
                order.tenant_id, order.order_id
            );
        }
        Ok(RecordOutcome {
            recorded: true,
            debited,
        })
    }

    /// Append without touching credit (DCA layers).
    pub async fn record_open(pool: &SqlitePool, order: &NewOrder) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let inserted = insert_order(&mut tx, order).await?;
        tx.commit().await?;
        Ok(inserted > 0)
    }

    /// Mark one record closed and deduct the action cost together. Only an
    /// `open` record transitions, so a retry cannot re-close or re-debit.
    pub async fn close_and_debit(
        pool: &SqlitePool,
        record_id: i64,
        tenant_id: Uuid,
        profit: f64,
        raw_close: &serde_json::Value,
        cost: i64,
    ) -> Result<RecordOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let closed = sqlx::query(
            r#"
                UPDATE orders
                SET status = 'closed', profit = ?, raw_close = ?, closed_at = ?
                WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(profit)
        .bind(raw_close.to_string())
        .bind(Utc::now())
        .bind(record_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if closed == 0 {
            tx.rollback().await?;
            return Ok(RecordOutcome {
                recorded: false,
                debited: false,
            });
        }

        let debited =
            sqlx::query("UPDATE tenants SET credit = credit - ? WHERE id = ? AND credit >= ?")
                .bind(cost)
                .bind(tenant_id.to_string())
                .bind(cost)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;
        tx.commit().await?;

        if !debited {
            warn!("tenant {tenant_id} closed record {record_id} with no credit left to debit");
        }
        Ok(RecordOutcome {
            recorded: true,
            debited,
        })
    }

    /// Collapse every open record of a ladder in one statement.
    pub async fn close_all_open(
        pool: &SqlitePool,
        tenant_id: Uuid,
        symbol: &str,
        profit: f64,
        raw_close: &serde_json::Value,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
                UPDATE orders
                SET status = 'closed', profit = ?, raw_close = ?, closed_at = ?
                WHERE tenant_id = ? AND symbol = ? AND status = 'open'
            "#,
        )
        .bind(profit)
        .bind(raw_close.to_string())
        .bind(Utc::now())
        .bind(tenant_id.to_string())
        .bind(symbol)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn open_orders(
        pool: &SqlitePool,
        tenant_id: Uuid,
        symbol: &str,
    ) -> Result<Vec<OrderRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
                SELECT * FROM orders
                WHERE tenant_id = ? AND symbol = ? AND status = 'open'
                ORDER BY layer ASC, id ASC
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(symbol)
        .fetch_all(pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn history(
        pool: &SqlitePool,
        tenant_id: Uuid,
    ) -> Result<Vec<OrderRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM orders WHERE tenant_id = ? ORDER BY id DESC")
            .bind(tenant_id.to_string())
            .fetch_all(pool)
            .await?;
        rows.iter().map(row_to_order).collect()
    }
}

async fn insert_order(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    order: &NewOrder,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
            INSERT INTO orders (
                tenant_id, exchange, order_id, symbol, side, order_type,
                amount, price, status, layer, raw, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, ?)
            ON CONFLICT(tenant_id, exchange, order_id) DO NOTHING
        "#,
    )
    .bind(order.tenant_id.to_string())
    .bind(order.exchange.as_str())
    .bind(&order.order_id)
    .bind(&order.symbol)
    .bind(order.side.as_str())
    .bind(order.order_type.as_str())
    .bind(order.amount)
    .bind(order.price)
    .bind(order.layer.map(|l| l as i64))
    .bind(order.raw.to_string())
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

fn decode_err(column: &str, message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

fn row_to_order(row: &SqliteRow) -> Result<OrderRecord, sqlx::Error> {
    let tenant_id: String = row.try_get("tenant_id")?;
    let tenant_id =
        Uuid::parse_str(&tenant_id).map_err(|e| decode_err("tenant_id", e.to_string()))?;

    let exchange: String = row.try_get("exchange")?;
    let exchange: ExchangeId = exchange
        .parse()
        .map_err(|e: String| decode_err("exchange", e))?;
    let side: String = row.try_get("side")?;
    let side: Side = side.parse().map_err(|e: String| decode_err("side", e))?;
    let order_type: String = row.try_get("order_type")?;
    let order_type: OrderType = order_type
        .parse()
        .map_err(|e: String| decode_err("order_type", e))?;

    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "open" => OrderStatus::Open,
        "closed" => OrderStatus::Closed,
        other => return Err(decode_err("status", format!("unknown status {other}"))),
    };

    let raw: Option<String> = row.try_get("raw")?;
    let raw = raw
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(serde_json::Value::Null);
    let raw_close: Option<String> = row.try_get("raw_close")?;
    let raw_close = raw_close.and_then(|text| serde_json::from_str(&text).ok());

    Ok(OrderRecord {
        id: row.try_get("id")?,
        tenant_id,
        exchange,
        order_id: row.try_get("order_id")?,
        symbol: row.try_get("symbol")?,
        side,
        order_type,
        amount: row.try_get("amount")?,
        price: row.try_get("price")?,
        status,
        profit: row.try_get("profit")?,
        layer: row.try_get::<Option<i64>, _>("layer")?.map(|l| l as u32),
        raw,
        raw_close,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        closed_at: row.try_get::<Option<DateTime<Utc>>, _>("closed_at")?,
    })
}
