use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use common::{Error, Order, OrderStatus, OrderType, Result, TraceEvent};

use crate::order_manager::OrderManager;

/// SQLite persistence for the Order Manager state, order history and the
/// decision trace.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        info!("Database ready");
        Ok(Self { pool })
    }

    /// Stable id of this deployment, created on first use. Prefixes order ids
    /// so they stay unique across restarts and databases.
    pub async fn session_id(&self) -> Result<String> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT value FROM session WHERE key = 'session_id'")
                .fetch_optional(&self.pool)
                .await?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        sqlx::query("INSERT INTO session (key, value) VALUES ('session_id', ?1)")
            .bind(&id)
            .execute(&self.pool)
            .await?;
        info!(session_id = %id, "New session created");
        Ok(id)
    }

    /// Write the manager state, every order touched by `events`, and the
    /// events themselves in one transaction.
    pub async fn persist(
        &self,
        manager: &OrderManager,
        events: &[TraceEvent],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let state_json = serde_json::to_string(manager)?;
        let recorded_at = now.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        for event in events {
            if let TraceEvent::OrderUpdated(order) = event {
                upsert_order(&mut tx, order).await?;
            }
            sqlx::query(
                "INSERT INTO trace_events (kind, symbol, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(event.kind())
            .bind(event.symbol())
            .bind(serde_json::to_string(event)?)
            .bind(&recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO portfolio_state (id, state_json, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state_json)
        .bind(&recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Last persisted manager state. A blob that does not decode is corrupt
    /// and must stop the process.
    pub async fn load_manager(&self) -> Result<Option<OrderManager>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT state_json FROM portfolio_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        match json {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::CorruptState(format!("portfolio_state: {e}"))),
        }
    }

    pub async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>> {
        let status: Option<OrderStatus> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = ?1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    pub async fn load_trace(&self) -> Result<Vec<TraceEvent>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT payload FROM trace_events ORDER BY seq")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|payload| {
                serde_json::from_str(payload)
                    .map_err(|e| Error::CorruptState(format!("trace_events: {e}")))
            })
            .collect()
    }
}

async fn upsert_order(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    order: &Order,
) -> Result<()> {
    let order_type = match order.order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
    };
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, symbol, side, order_type, quantity, limit_price, status,
            filled_quantity, avg_fill_price, exchange_order_id, reason,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            filled_quantity = excluded.filled_quantity,
            avg_fill_price = excluded.avg_fill_price,
            exchange_order_id = excluded.exchange_order_id,
            reason = excluded.reason,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&order.id)
    .bind(&order.symbol)
    .bind(order.side)
    .bind(order_type)
    .bind(order.quantity.to_string())
    .bind(order.limit_price.map(|p| p.to_string()))
    .bind(order.status)
    .bind(order.filled_quantity.to_string())
    .bind(order.avg_fill_price.to_string())
    .bind(order.exchange_order_id.as_deref())
    .bind(order.reason.as_deref())
    .bind(order.created_at.to_rfc3339())
    .bind(order.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
