use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::warn;
use uuid::Uuid;
use crate::error::{LedgerError, StoreError};
use crate::models::*;
use crate::schema::*;
use super::{AlertStore, MovementLog, ReservationStore, StockLedger, StockStore, TxFuture};

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStockStore {
    pool: DbPool,
}

impl PgStockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl StockStore for PgStockStore {
    type Tx = AsyncPgConnection;

    async fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut AsyncPgConnection) -> TxFuture<'c, T> + Send + 'static,
    {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        conn.transaction::<T, StoreError, _>(|conn| Box::pin(work(conn)))
            .await
    }
}

/// The row is gone or the guard failed; tell the two apart for the caller.
async fn explain_miss(
    conn: &mut AsyncPgConnection,
    variant_id: Uuid,
    detail: impl FnOnce(&VariantStock) -> LedgerError,
) -> LedgerError {
    match variant_stock::table
        .find(variant_id)
        .first::<VariantStock>(conn)
        .await
        .optional()
    {
        Ok(Some(row)) => detail(&row),
        Ok(None) => LedgerError::NotFound(variant_id),
        Err(e) => LedgerError::from(e),
    }
}

#[async_trait]
impl StockLedger for AsyncPgConnection {
    async fn stock(&mut self, variant_id: Uuid) -> Result<Option<VariantStock>, StoreError> {
        let row = variant_stock::table
            .find(variant_id)
            .first::<VariantStock>(self)
            .await
            .optional()?;
        Ok(row)
    }

    async fn insert_variant(&mut self, variant: NewVariantStock) -> Result<VariantStock, StoreError> {
        let row = diesel::insert_into(variant_stock::table)
            .values(&variant)
            .get_result::<VariantStock>(self)
            .await?;
        Ok(row)
    }

    async fn try_reserve(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError> {
        let updated = diesel::update(
            variant_stock::table
                .filter(variant_stock::variant_id.eq(variant_id))
                .filter(variant_stock::is_active.eq(true))
                .filter((variant_stock::quantity_on_hand - variant_stock::quantity_reserved).ge(quantity)),
        )
        .set((
            variant_stock::quantity_reserved.eq(variant_stock::quantity_reserved + quantity),
            variant_stock::updated_at.eq(Utc::now()),
        ))
        .get_result::<VariantStock>(self)
        .await
        .optional()?;

        match updated {
            Some(after) => {
                let mut before = after.clone();
                before.quantity_reserved -= quantity;
                Ok(StockChange { before, after })
            }
            None => Err(explain_miss(self, variant_id, |row| {
                if row.is_active {
                    LedgerError::InsufficientStock {
                        variant_id,
                        requested: quantity,
                        available: row.quantity_available(),
                    }
                } else {
                    LedgerError::Inactive(variant_id)
                }
            })
            .await),
        }
    }

    async fn release_reserved(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError> {
        let updated = diesel::update(
            variant_stock::table
                .filter(variant_stock::variant_id.eq(variant_id))
                .filter(variant_stock::quantity_reserved.ge(quantity)),
        )
        .set((
            variant_stock::quantity_reserved.eq(variant_stock::quantity_reserved - quantity),
            variant_stock::updated_at.eq(Utc::now()),
        ))
        .get_result::<VariantStock>(self)
        .await
        .optional()?;

        if let Some(after) = updated {
            let mut before = after.clone();
            before.quantity_reserved += quantity;
            return Ok(StockChange { before, after });
        }

        // Double release: lock the row and floor the counter at zero.
        let before = variant_stock::table
            .find(variant_id)
            .for_update()
            .first::<VariantStock>(self)
            .await
            .optional()?
            .ok_or(LedgerError::NotFound(variant_id))?;
        warn!(
            %variant_id,
            reserved = before.quantity_reserved,
            quantity,
            "Releasing more than is reserved, flooring at zero"
        );
        let after = diesel::update(variant_stock::table.find(variant_id))
            .set((
                variant_stock::quantity_reserved.eq(0),
                variant_stock::updated_at.eq(Utc::now()),
            ))
            .get_result::<VariantStock>(self)
            .await?;
        Ok(StockChange { before, after })
    }

    async fn confirm_sale(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError> {
        let updated = diesel::update(
            variant_stock::table
                .filter(variant_stock::variant_id.eq(variant_id))
                .filter(variant_stock::quantity_reserved.ge(quantity))
                .filter(variant_stock::quantity_on_hand.ge(quantity)),
        )
        .set((
            variant_stock::quantity_on_hand.eq(variant_stock::quantity_on_hand - quantity),
            variant_stock::quantity_reserved.eq(variant_stock::quantity_reserved - quantity),
            variant_stock::updated_at.eq(Utc::now()),
        ))
        .get_result::<VariantStock>(self)
        .await
        .optional()?;

        match updated {
            Some(after) => {
                let mut before = after.clone();
                before.quantity_on_hand += quantity;
                before.quantity_reserved += quantity;
                Ok(StockChange { before, after })
            }
            None => Err(explain_miss(self, variant_id, |row| LedgerError::InvariantViolation {
                variant_id,
                detail: format!(
                    "sale of {} against on_hand {} / reserved {}",
                    quantity, row.quantity_on_hand, row.quantity_reserved
                ),
            })
            .await),
        }
    }

    async fn adjust_on_hand(&mut self, variant_id: Uuid, delta: i32) -> Result<StockChange, LedgerError> {
        // Locked read; the sum is range-checked here, not in SQL.
        let before = variant_stock::table
            .find(variant_id)
            .for_update()
            .first::<VariantStock>(self)
            .await
            .optional()?
            .ok_or(LedgerError::NotFound(variant_id))?;

        let target = before.quantity_on_hand.checked_add(delta).ok_or(LedgerError::OutOfRange {
            variant_id,
            on_hand: before.quantity_on_hand,
            delta,
        })?;
        if target < 0 || target < before.quantity_reserved {
            return Err(LedgerError::InvariantViolation {
                variant_id,
                detail: format!(
                    "on_hand {} + {} would fall below reserved {}",
                    before.quantity_on_hand, delta, before.quantity_reserved
                ),
            });
        }

        let after = diesel::update(variant_stock::table.find(variant_id))
            .set((
                variant_stock::quantity_on_hand.eq(target),
                variant_stock::updated_at.eq(Utc::now()),
            ))
            .get_result::<VariantStock>(self)
            .await?;
        Ok(StockChange { before, after })
    }
}

#[async_trait]
impl ReservationStore for AsyncPgConnection {
    async fn insert_reservation(&mut self, reservation: NewReservation) -> Result<Reservation, StoreError> {
        let row = diesel::insert_into(reservations::table)
            .values(&reservation)
            .get_result::<Reservation>(self)
            .await?;
        Ok(row)
    }

    async fn reservation(&mut self, id: Uuid) -> Result<Option<Reservation>, StoreError> {
        let row = reservations::table
            .find(id)
            .first::<Reservation>(self)
            .await
            .optional()?;
        Ok(row)
    }

    async fn finish_reservation(
        &mut self,
        id: Uuid,
        transition: Transition,
    ) -> Result<Option<Reservation>, StoreError> {
        let still_active = reservations::table
            .filter(reservations::id.eq(id))
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()));
        let changes = (
            reservations::status.eq(transition.to.as_str()),
            reservations::order_ref.eq(transition.order_ref),
            reservations::release_reason.eq(transition.reason),
            reservations::updated_at.eq(transition.at),
        );

        let row = match transition.guard {
            ExpiryGuard::Any => {
                diesel::update(still_active)
                    .set(changes)
                    .get_result::<Reservation>(self)
                    .await
            }
            ExpiryGuard::LiveAt(at) => {
                diesel::update(still_active.filter(reservations::expires_at.gt(at)))
                    .set(changes)
                    .get_result::<Reservation>(self)
                    .await
            }
            ExpiryGuard::LapsedAt(at) => {
                diesel::update(still_active.filter(reservations::expires_at.le(at)))
                    .set(changes)
                    .get_result::<Reservation>(self)
                    .await
            }
        }
        .optional()?;
        Ok(row)
    }

    async fn extend_reservation(
        &mut self,
        id: Uuid,
        expected: DateTime<Utc>,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>, StoreError> {
        let row = diesel::update(
            reservations::table
                .filter(reservations::id.eq(id))
                .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
                .filter(reservations::expires_at.eq(expected))
                .filter(reservations::expires_at.gt(now)),
        )
        .set((
            reservations::expires_at.eq(new_expiry),
            reservations::updated_at.eq(now),
        ))
        .get_result::<Reservation>(self)
        .await
        .optional()?;
        Ok(row)
    }

    async fn lapsed_reservations(&mut self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Reservation>, StoreError> {
        let rows = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
            .filter(reservations::expires_at.le(now))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .load::<Reservation>(self)
            .await?;
        Ok(rows)
    }

    async fn reservation_counts(&mut self, now: DateTime<Utc>) -> Result<ReservationCounts, StoreError> {
        let active_count = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
            .filter(reservations::expires_at.gt(now))
            .count()
            .get_result::<i64>(self)
            .await?;
        let needs_cleanup_count = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
            .filter(reservations::expires_at.le(now))
            .count()
            .get_result::<i64>(self)
            .await?;
        let expired_count = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Expired.as_str()))
            .count()
            .get_result::<i64>(self)
            .await?;
        Ok(ReservationCounts {
            active_count,
            expired_count,
            needs_cleanup_count,
        })
    }

    async fn active_reserved_total(&mut self, variant_id: Uuid) -> Result<i64, StoreError> {
        let total = reservations::table
            .filter(reservations::variant_id.eq(variant_id))
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
            .select(diesel::dsl::sum(reservations::quantity))
            .get_result::<Option<i64>>(self)
            .await?;
        Ok(total.unwrap_or(0))
    }
}

#[async_trait]
impl MovementLog for AsyncPgConnection {
    async fn append_movement(&mut self, movement: NewStockMovement) -> Result<StockMovement, StoreError> {
        let row = diesel::insert_into(stock_movements::table)
            .values(&movement)
            .get_result::<StockMovement>(self)
            .await?;
        Ok(row)
    }

    async fn movements(&mut self, variant_id: Uuid, limit: i64) -> Result<Vec<StockMovement>, StoreError> {
        let rows = stock_movements::table
            .filter(stock_movements::variant_id.eq(variant_id))
            .order((stock_movements::created_at.desc(), stock_movements::id.desc()))
            .limit(limit)
            .load::<StockMovement>(self)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl AlertStore for AsyncPgConnection {
    async fn open_alerts(&mut self, variant_id: Uuid) -> Result<Vec<StockAlert>, StoreError> {
        let rows = stock_alerts::table
            .filter(stock_alerts::variant_id.eq(variant_id))
            .filter(stock_alerts::is_resolved.eq(false))
            .load::<StockAlert>(self)
            .await?;
        Ok(rows)
    }

    async fn raise_alert(&mut self, alert: NewStockAlert) -> Result<StockAlert, StoreError> {
        let row = diesel::insert_into(stock_alerts::table)
            .values(&alert)
            .get_result::<StockAlert>(self)
            .await?;
        Ok(row)
    }

    async fn resolve_alerts(&mut self, variant_id: Uuid, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let resolved = diesel::update(
            stock_alerts::table
                .filter(stock_alerts::variant_id.eq(variant_id))
                .filter(stock_alerts::is_resolved.eq(false)),
        )
        .set((
            stock_alerts::is_resolved.eq(true),
            stock_alerts::resolved_at.eq(Some(at)),
        ))
        .execute(self)
        .await?;
        Ok(resolved)
    }
}
