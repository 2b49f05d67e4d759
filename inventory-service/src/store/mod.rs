//! Storage seam for the reservation engine.
//!
//! A [`StockStore`] hands out one transaction handle at a time. The handle
//! exposes the ledger, reservation, movement log and alert primitives; every
//! mutating primitive is a single conditional statement so that the check and
//! the effect cannot be split by a concurrent caller.

mod memory;
mod postgres;

pub use memory::{MemoryStockStore, MemoryTx};
pub use postgres::{DbPool, PgStockStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;
use crate::error::{LedgerError, StoreError};
use crate::models::*;

pub type TxFuture<'c, T> = BoxFuture<'c, Result<T, StoreError>>;

/// Per-variant counters.
#[async_trait]
pub trait StockLedger: Send {
    async fn stock(&mut self, variant_id: Uuid) -> Result<Option<VariantStock>, StoreError>;

    async fn insert_variant(&mut self, variant: NewVariantStock) -> Result<VariantStock, StoreError>;

    /// Increments `reserved` iff the variant is active and `on_hand - reserved >= quantity`.
    async fn try_reserve(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError>;

    /// Decrements `reserved`, floored at zero.
    async fn release_reserved(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError>;

    /// Decrements both `on_hand` and `reserved`.
    async fn confirm_sale(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError>;

    /// Moves `on_hand` by `delta` without letting it drop below `reserved`
    /// or leave the `i32` range.
    async fn adjust_on_hand(&mut self, variant_id: Uuid, delta: i32) -> Result<StockChange, LedgerError>;
}

#[async_trait]
pub trait ReservationStore: Send {
    async fn insert_reservation(&mut self, reservation: NewReservation) -> Result<Reservation, StoreError>;

    async fn reservation(&mut self, id: Uuid) -> Result<Option<Reservation>, StoreError>;

    /// Applies `transition` only if the row is still `active` and the guard holds.
    /// `None` means another writer got there first or the guard failed.
    async fn finish_reservation(
        &mut self,
        id: Uuid,
        transition: Transition,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Moves `expires_at` from `expected` to `new_expiry` if the row is active,
    /// still unexpired at `now` and nobody moved it in between.
    async fn extend_reservation(
        &mut self,
        id: Uuid,
        expected: DateTime<Utc>,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Active reservations with `expires_at <= now`, oldest expiry first.
    async fn lapsed_reservations(&mut self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Reservation>, StoreError>;

    async fn reservation_counts(&mut self, now: DateTime<Utc>) -> Result<ReservationCounts, StoreError>;

    /// Sum of quantities over the variant's active reservations.
    async fn active_reserved_total(&mut self, variant_id: Uuid) -> Result<i64, StoreError>;
}

/// Append-only audit trail.
#[async_trait]
pub trait MovementLog: Send {
    async fn append_movement(&mut self, movement: NewStockMovement) -> Result<StockMovement, StoreError>;

    /// Newest first.
    async fn movements(&mut self, variant_id: Uuid, limit: i64) -> Result<Vec<StockMovement>, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send {
    async fn open_alerts(&mut self, variant_id: Uuid) -> Result<Vec<StockAlert>, StoreError>;

    async fn raise_alert(&mut self, alert: NewStockAlert) -> Result<StockAlert, StoreError>;

    async fn resolve_alerts(&mut self, variant_id: Uuid, at: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub trait StockTx: StockLedger + ReservationStore + MovementLog + AlertStore {}

impl<T> StockTx for T where T: StockLedger + ReservationStore + MovementLog + AlertStore {}

#[async_trait]
pub trait StockStore: Send + Sync + 'static {
    type Tx: StockTx;

    /// Runs `work` in one transaction. `Ok` commits, `Err` rolls everything back.
    async fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut Self::Tx) -> TxFuture<'c, T> + Send + 'static;
}
