use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::time::timeout;
use tracing::{error, info};
use uuid::Uuid;

use common::models::{NewOrder, SignalAction, TenantConfig, TradeSignal};
use common::symbols::normalize_symbol;
use common::{ACTION_COST, MIN_CREDIT};
use exchange::Connector;
use storage::repositories::{OrdersRepository, TenantsRepository};

use crate::error::EngineError;
use crate::lifecycle::{ExecutedOrder, OrderExecutor};

/// Upper bound on one tenant's submit/confirm/bracket walk.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-tenant result of one dispatch round. Never persisted; serialized
/// straight into the caller's response.
#[derive(Debug, Serialize)]
pub struct DispatchOutcome {
    pub tenant: Uuid,
    pub action: SignalAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<ExecutedOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn success(tenant: Uuid, action: SignalAction, order: ExecutedOrder) -> Self {
        Self {
            tenant,
            action,
            order: Some(order),
            error: None,
        }
    }

    fn failure(tenant: Uuid, action: SignalAction, message: String) -> Self {
        Self {
            tenant,
            action,
            order: None,
            error: Some(message),
        }
    }
}

/// Selects eligible tenants for an inbound signal and fans execution out
/// one task per tenant. Tasks share nothing but the read-only signal.
pub struct Dispatcher {
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, connector: Arc<dyn Connector>) -> Self {
        Self { pool, connector }
    }

    pub async fn dispatch_signal(
        &self,
        signal: &TradeSignal,
    ) -> Result<Vec<DispatchOutcome>, sqlx::Error> {
        let symbol = normalize_symbol(&signal.symbol);
        let tenants = TenantsRepository::list_signal_eligible(&self.pool, MIN_CREDIT).await?;
        info!(
            "dispatching {} {} to {} eligible tenants",
            signal.action,
            symbol,
            tenants.len()
        );

        let action = signal.action;
        let mut tasks = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let pool = self.pool.clone();
            let connector = self.connector.clone();
            let signal = signal.clone();
            let symbol = symbol.clone();
            let tenant_id = tenant.id;

            let handle = tokio::spawn(async move {
                match timeout(
                    TASK_TIMEOUT,
                    run_tenant(pool, connector, tenant, signal, symbol),
                )
                .await
                {
                    Ok(Ok(order)) => DispatchOutcome::success(tenant_id, action, order),
                    Ok(Err(e)) => DispatchOutcome::failure(tenant_id, action, e.to_string()),
                    Err(_) => DispatchOutcome::failure(
                        tenant_id,
                        action,
                        "dispatch timed out".to_string(),
                    ),
                }
            });
            tasks.push((tenant_id, handle));
        }

        let (ids, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let joined = join_all(handles).await;

        let outcomes = ids
            .into_iter()
            .zip(joined)
            .map(|(tenant_id, joined)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("dispatch task for tenant {tenant_id} aborted: {e}");
                    DispatchOutcome::failure(tenant_id, action, "dispatch task aborted".to_string())
                }
            })
            .collect();
        Ok(outcomes)
    }
}

async fn run_tenant(
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
    tenant: TenantConfig,
    signal: TradeSignal,
    symbol: String,
) -> Result<ExecutedOrder, EngineError> {
    let Some(params) = tenant.strategy.as_signal() else {
        // Filtered out by eligibility; kept as a guard.
        return Err(EngineError::NoOpenPosition { symbol });
    };

    match signal.action {
        SignalAction::Open => {
            let open_records = OrdersRepository::open_orders(&pool, tenant.id, &symbol).await?;
            if open_records.iter().any(|record| record.layer.is_none()) {
                return Err(EngineError::PositionAlreadyOpen { symbol });
            }

            let exchange = connector.connect(&tenant).await?;
            let executor = OrderExecutor::new(exchange);
            // Side comes from the payload; the preferred side only sizes it.
            let executed = executor
                .open(
                    &symbol,
                    signal.side,
                    signal.order_type,
                    params.notional(),
                    signal.price,
                    params,
                )
                .await?;

            let record = NewOrder {
                tenant_id: tenant.id,
                exchange: tenant.exchange,
                order_id: executed.order_id.clone(),
                symbol: symbol.clone(),
                side: executed.side,
                order_type: executed.order_type,
                amount: executed.quantity,
                price: executed.entry_price,
                layer: None,
                raw: executed.raw.clone(),
            };
            OrdersRepository::record_open_and_debit(&pool, &record, ACTION_COST).await?;
            Ok(executed)
        }
        SignalAction::Close => {
            // Resolve the record before any exchange traffic; a close with
            // nothing open must not touch the venue.
            let open_records = OrdersRepository::open_orders(&pool, tenant.id, &symbol).await?;
            let record = open_records
                .into_iter()
                .find(|record| record.layer.is_none())
                .ok_or_else(|| EngineError::NoOpenPosition {
                    symbol: symbol.clone(),
                })?;

            let exchange = connector.connect(&tenant).await?;
            let executor = OrderExecutor::new(exchange);
            let (executed, profit) = executor.close(&record).await?;

            OrdersRepository::close_and_debit(
                &pool,
                record.id,
                tenant.id,
                profit,
                &executed.raw,
                ACTION_COST,
            )
            .await?;
            Ok(executed)
        }
    }
}
