use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use common::models::{
    Credentials, DcaParams, ExchangeId, PreferredSide, SignalParams, StrategyConfig, TenantConfig,
};

pub struct TenantsRepository;

impl TenantsRepository {
    pub async fn insert(pool: &SqlitePool, tenant: &TenantConfig) -> Result<(), sqlx::Error> {
        let mut query = sqlx::query(
            r#"
                INSERT INTO tenants (
                    id, enabled, credit, exchange, api_key, api_secret, strategy,
                    preferred_side, long_size, short_size, leverage, take_profit,
                    stop_loss, bracket_enabled, dca_pair, dca_order_size, dca_max_layers
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant.id.to_string())
        .bind(tenant.enabled)
        .bind(tenant.credit)
        .bind(tenant.exchange.as_str())
        .bind(&tenant.credentials.api_key)
        .bind(&tenant.credentials.api_secret)
        .bind(tenant.strategy.mode());

        query = match &tenant.strategy {
            StrategyConfig::Signal(params) => query
                .bind(params.preferred_side.as_str())
                .bind(params.long_size)
                .bind(params.short_size)
                .bind(params.leverage as i64)
                .bind(params.take_profit_pct)
                .bind(params.stop_loss_pct)
                .bind(params.bracket_enabled)
                .bind(Option::<String>::None)
                .bind(Option::<f64>::None)
                .bind(Option::<i64>::None),
            StrategyConfig::Dca(params) => query
                .bind(Option::<String>::None)
                .bind(Option::<f64>::None)
                .bind(Option::<f64>::None)
                .bind(Option::<i64>::None)
                .bind(Option::<f64>::None)
                .bind(Option::<f64>::None)
                .bind(Option::<bool>::None)
                .bind(&params.pair)
                .bind(params.order_size)
                .bind(params.max_layers as i64),
        };

        query.execute(pool).await?;
        Ok(())
    }

    pub async fn fetch(pool: &SqlitePool, id: Uuid) -> Result<Option<TenantConfig>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
        row.map(|r| row_to_tenant(&r)).transpose()
    }

    /// Tenants a signal may be dispatched to: enabled, in signal mode, above
    /// the credit floor, with non-empty credentials for their venue. Credit
    /// eligibility is decided here, before dispatch, never after.
    pub async fn list_signal_eligible(
        pool: &SqlitePool,
        min_credit: i64,
    ) -> Result<Vec<TenantConfig>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
                SELECT * FROM tenants
                WHERE enabled = 1
                  AND strategy = 'signal'
                  AND credit >= ?
                  AND api_key != ''
                  AND api_secret != ''
            "#,
        )
        .bind(min_credit)
        .fetch_all(pool)
        .await?;
        rows.iter().map(row_to_tenant).collect()
    }

    pub async fn list_dca_enabled(pool: &SqlitePool) -> Result<Vec<TenantConfig>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM tenants WHERE enabled = 1 AND strategy = 'dca'",
        )
        .fetch_all(pool)
        .await?;
        rows.iter().map(row_to_tenant).collect()
    }

    pub async fn credit_of(pool: &SqlitePool, id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT credit FROM tenants WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(pool)
            .await
    }

    /// Conditional decrement; returns false when the balance would go
    /// negative. The caller decides whether that is fatal.
    pub async fn debit(pool: &SqlitePool, id: Uuid, cost: i64) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE tenants SET credit = credit - ? WHERE id = ? AND credit >= ?")
                .bind(cost)
                .bind(id.to_string())
                .bind(cost)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_enabled(
        pool: &SqlitePool,
        id: Uuid,
        enabled: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tenants SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }
}

fn decode_err(column: &str, message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

pub(crate) fn row_to_tenant(row: &SqliteRow) -> Result<TenantConfig, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id).map_err(|e| decode_err("id", e.to_string()))?;

    let exchange: String = row.try_get("exchange")?;
    let exchange: ExchangeId = exchange
        .parse()
        .map_err(|e: String| decode_err("exchange", e))?;

    let strategy_mode: String = row.try_get("strategy")?;
    let strategy = match strategy_mode.as_str() {
        "signal" => {
            let preferred: Option<String> = row.try_get("preferred_side")?;
            let preferred_side = match preferred {
                Some(value) => value
                    .parse::<PreferredSide>()
                    .map_err(|e| decode_err("preferred_side", e))?,
                None => PreferredSide::LongShort,
            };
            StrategyConfig::Signal(SignalParams {
                preferred_side,
                long_size: row.try_get::<Option<f64>, _>("long_size")?.unwrap_or(0.0),
                short_size: row.try_get::<Option<f64>, _>("short_size")?.unwrap_or(0.0),
                leverage: row.try_get::<Option<i64>, _>("leverage")?.unwrap_or(1) as u32,
                take_profit_pct: row.try_get::<Option<f64>, _>("take_profit")?.unwrap_or(0.0),
                stop_loss_pct: row.try_get::<Option<f64>, _>("stop_loss")?.unwrap_or(0.0),
                bracket_enabled: row
                    .try_get::<Option<bool>, _>("bracket_enabled")?
                    .unwrap_or(false),
            })
        }
        "dca" => StrategyConfig::Dca(DcaParams {
            pair: row.try_get::<Option<String>, _>("dca_pair")?.unwrap_or_default(),
            order_size: row
                .try_get::<Option<f64>, _>("dca_order_size")?
                .unwrap_or(0.0),
            max_layers: row
                .try_get::<Option<i64>, _>("dca_max_layers")?
                .unwrap_or(0) as u32,
        }),
        other => return Err(decode_err("strategy", format!("unknown mode {other}"))),
    };

    Ok(TenantConfig {
        id,
        enabled: row.try_get("enabled")?,
        credit: row.try_get("credit")?,
        exchange,
        credentials: Credentials::new(
            row.try_get::<String, _>("api_key")?,
            row.try_get::<String, _>("api_secret")?,
        ),
        strategy,
    })
}
