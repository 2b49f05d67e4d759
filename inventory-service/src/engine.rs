//! Reservation engine.
//!
//! Owns every write to the stock counters and every reservation status change.
//! Each operation runs in a single store transaction: the ledger primitive,
//! the reservation row and the movement log entry commit together or not at
//! all. Status changes are compare-and-swap updates keyed on `active`, so
//! concurrent confirm / release / sweep calls on one reservation resolve to
//! exactly one winner and the losers observe a terminal status.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::alerts::{self, StockLevel};
use crate::clock::Clock;
use crate::error::{EngineError, LedgerError, StoreError};
use crate::models::*;
use crate::store::{AlertStore, MovementLog, ReservationStore, StockLedger, StockStore};

const EXTEND_ATTEMPTS: usize = 3;

/// Largest single restock or correction accepted by `adjust_on_hand`.
pub const MAX_ADJUST_DELTA: i32 = 1_000_000;

fn add_minutes(at: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    Duration::try_minutes(minutes).and_then(|d| at.checked_add_signed(d))
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_hold_minutes: i64,
    pub max_hold_minutes: i64,
    /// Used for variants without their own `low_stock_threshold`.
    pub default_low_stock_threshold: i32,
    pub sweep_batch_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_hold_minutes: 15,
            max_hold_minutes: 60,
            default_low_stock_threshold: 5,
            sweep_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    NotFound,
    Inactive,
    InsufficientStock { requested: i32, available: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtendOutcome {
    Extended(Reservation),
    NotFound,
    /// Terminal, or past its expiry and waiting for the sweeper.
    NotActive(ReservationStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// `replayed` is set when the reservation was already confirmed for the same order.
    Confirmed { reservation: Reservation, replayed: bool },
    NotFound,
    AlreadyTerminal(ReservationStatus),
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    /// `replayed` is set when the hold had already been released, cancelled or expired.
    Released { reservation: Reservation, replayed: bool },
    NotFound,
    AlreadyTerminal(ReservationStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdjustOutcome {
    Adjusted(StockSnapshot),
    NotFound,
    /// The new on-hand figure would drop below what is currently reserved.
    BelowReserved { on_hand: i32, reserved: i32 },
    /// The new on-hand figure does not fit the counter.
    OutOfRange { on_hand: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockSnapshot {
    pub variant_id: Uuid,
    pub sku: String,
    pub quantity_on_hand: i32,
    pub quantity_reserved: i32,
    pub quantity_available: i32,
    pub low_stock_threshold: i32,
    pub level: StockLevel,
    pub is_active: bool,
}

impl StockSnapshot {
    pub fn of(stock: &VariantStock, default_threshold: i32) -> Self {
        Self {
            variant_id: stock.variant_id,
            sku: stock.sku.clone(),
            quantity_on_hand: stock.quantity_on_hand,
            quantity_reserved: stock.quantity_reserved,
            quantity_available: stock.quantity_available(),
            low_stock_threshold: stock.threshold_or(default_threshold),
            level: alerts::level_of(stock, default_threshold),
            is_active: stock.is_active,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Resolved by a concurrent confirm / release / sweep before we got to it.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub variant_id: Uuid,
    pub ledger_reserved: i64,
    pub active_reserved: i64,
    pub consistent: bool,
}

pub struct ReservationEngine<S: StockStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: StockStore> ReservationEngine<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Catalog hook: creates the stock row for a new variant.
    pub async fn register_variant(&self, variant: NewVariantStock) -> Result<StockSnapshot, EngineError> {
        if variant.quantity_on_hand < 0 {
            return Err(EngineError::Invalid("quantity_on_hand must not be negative".to_string()));
        }
        if variant.low_stock_threshold.is_some_and(|t| t < 0) {
            return Err(EngineError::Invalid("low_stock_threshold must not be negative".to_string()));
        }
        let threshold = self.config.default_low_stock_threshold;
        let now = self.now();
        let stock = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let stock = tx.insert_variant(variant).await?;
                    alerts::sync_alerts(tx, &stock, threshold, now).await?;
                    Ok(stock)
                })
            })
            .await?;
        info!(variant_id = %stock.variant_id, sku = %stock.sku, on_hand = stock.quantity_on_hand, "Variant registered");
        Ok(StockSnapshot::of(&stock, threshold))
    }

    pub async fn stock(&self, variant_id: Uuid) -> Result<Option<StockSnapshot>, EngineError> {
        let threshold = self.config.default_low_stock_threshold;
        let stock = self
            .store
            .transaction(move |tx| Box::pin(async move { tx.stock(variant_id).await }))
            .await?;
        Ok(stock.map(|s| StockSnapshot::of(&s, threshold)))
    }

    pub async fn available(&self, variant_id: Uuid) -> Result<Option<i32>, EngineError> {
        Ok(self.stock(variant_id).await?.map(|s| s.quantity_available))
    }

    pub async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, EngineError> {
        let reservation = self
            .store
            .transaction(move |tx| Box::pin(async move { tx.reservation(id).await }))
            .await?;
        Ok(reservation)
    }

    pub async fn movements(&self, variant_id: Uuid, limit: i64) -> Result<Vec<StockMovement>, EngineError> {
        if limit <= 0 {
            return Err(EngineError::Invalid("limit must be positive".to_string()));
        }
        let movements = self
            .store
            .transaction(move |tx| Box::pin(async move { tx.movements(variant_id, limit).await }))
            .await?;
        Ok(movements)
    }

    pub async fn status(&self) -> Result<ReservationCounts, EngineError> {
        let now = self.now();
        let counts = self
            .store
            .transaction(move |tx| Box::pin(async move { tx.reservation_counts(now).await }))
            .await?;
        Ok(counts)
    }

    /// Places a hold of `quantity` units for `hold_minutes` (default when `None`).
    pub async fn reserve(
        &self,
        variant_id: Uuid,
        quantity: i32,
        hold_minutes: Option<i64>,
        cart_ref: Option<String>,
    ) -> Result<ReserveOutcome, EngineError> {
        if quantity <= 0 {
            return Err(EngineError::Invalid("quantity must be positive".to_string()));
        }
        let hold_minutes = hold_minutes.unwrap_or(self.config.default_hold_minutes);
        if hold_minutes <= 0 || hold_minutes > self.config.max_hold_minutes {
            return Err(EngineError::Invalid(format!(
                "hold must be between 1 and {} minutes",
                self.config.max_hold_minutes
            )));
        }

        let now = self.now();
        let expires_at = add_minutes(now, hold_minutes)
            .ok_or_else(|| EngineError::Invalid("hold duration out of range".to_string()))?;
        let threshold = self.config.default_low_stock_threshold;
        let outcome = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let change = match tx.try_reserve(variant_id, quantity).await {
                        Ok(change) => change,
                        Err(LedgerError::NotFound(_)) => return Ok(ReserveOutcome::NotFound),
                        Err(LedgerError::Inactive(_)) => return Ok(ReserveOutcome::Inactive),
                        Err(LedgerError::InsufficientStock { requested, available, .. }) => {
                            return Ok(ReserveOutcome::InsufficientStock { requested, available });
                        }
                        Err(other) => return Err(StoreError::from(other)),
                    };

                    let reservation = tx
                        .insert_reservation(NewReservation {
                            id: Uuid::new_v4(),
                            variant_id,
                            quantity,
                            status: ReservationStatus::Active.as_str().to_string(),
                            cart_ref: cart_ref.clone(),
                            created_at: now,
                            expires_at,
                            updated_at: now,
                        })
                        .await?;

                    let reason = match &cart_ref {
                        Some(cart) => format!("hold for cart {}", cart),
                        None => "hold".to_string(),
                    };
                    tx.append_movement(NewStockMovement::record(
                        &change,
                        MovementType::ReservationHold,
                        reason,
                        Some(reservation.id.to_string()),
                        now,
                    ))
                    .await?;
                    alerts::sync_alerts(tx, &change.after, threshold, now).await?;

                    Ok(ReserveOutcome::Reserved(reservation))
                })
            })
            .await?;

        match &outcome {
            ReserveOutcome::Reserved(r) => info!(
                reservation_id = %r.id,
                %variant_id,
                quantity,
                expires_at = %r.expires_at,
                "Stock reserved"
            ),
            ReserveOutcome::InsufficientStock { requested, available } => info!(
                %variant_id,
                requested,
                available,
                "Reservation rejected: insufficient stock"
            ),
            ReserveOutcome::NotFound | ReserveOutcome::Inactive => {
                debug!(%variant_id, ?outcome, "Reservation rejected")
            }
        }
        Ok(outcome)
    }

    /// Pushes out the expiry of a live hold, capped at `now + max_hold_minutes`.
    pub async fn extend(&self, reservation_id: Uuid, additional_minutes: i64) -> Result<ExtendOutcome, EngineError> {
        if additional_minutes <= 0 || additional_minutes > self.config.max_hold_minutes {
            return Err(EngineError::Invalid(format!(
                "additional_minutes must be between 1 and {}",
                self.config.max_hold_minutes
            )));
        }
        let now = self.now();
        let ceiling = add_minutes(now, self.config.max_hold_minutes)
            .ok_or_else(|| EngineError::Invalid("max hold duration out of range".to_string()))?;

        for _ in 0..EXTEND_ATTEMPTS {
            let Some(current) = self.reservation(reservation_id).await? else {
                return Ok(ExtendOutcome::NotFound);
            };
            let status = current.status()?;
            if status.is_terminal() {
                return Ok(ExtendOutcome::NotActive(status));
            }
            if current.is_lapsed_at(now) {
                return Ok(ExtendOutcome::NotActive(ReservationStatus::Expired));
            }

            let expected = current.expires_at;
            let new_expiry = add_minutes(expected, additional_minutes)
                .unwrap_or(ceiling)
                .min(ceiling)
                .max(expected);
            let extended = self
                .store
                .transaction(move |tx| {
                    Box::pin(async move { tx.extend_reservation(reservation_id, expected, new_expiry, now).await })
                })
                .await?;

            if let Some(reservation) = extended {
                info!(%reservation_id, expires_at = %reservation.expires_at, "Reservation extended");
                return Ok(ExtendOutcome::Extended(reservation));
            }
            debug!(%reservation_id, "Reservation changed during extend, retrying");
        }

        match self.reservation(reservation_id).await? {
            None => Ok(ExtendOutcome::NotFound),
            Some(r) => Ok(ExtendOutcome::NotActive(r.status()?)),
        }
    }

    /// Turns a live hold into a sale. Replays for the same order succeed without
    /// touching the ledger again.
    pub async fn confirm(&self, reservation_id: Uuid, order_ref: String) -> Result<ConfirmOutcome, EngineError> {
        if order_ref.trim().is_empty() {
            return Err(EngineError::Invalid("order_ref must not be empty".to_string()));
        }
        let now = self.now();
        let threshold = self.config.default_low_stock_threshold;
        let result = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let transition = Transition::confirm(order_ref.clone(), now);
                    let Some(reservation) = tx.finish_reservation(reservation_id, transition).await? else {
                        let Some(current) = tx.reservation(reservation_id).await? else {
                            return Ok(ConfirmOutcome::NotFound);
                        };
                        return Ok(match current.status()? {
                            ReservationStatus::Confirmed if current.order_ref.as_deref() == Some(order_ref.as_str()) => {
                                ConfirmOutcome::Confirmed { reservation: current, replayed: true }
                            }
                            ReservationStatus::Active | ReservationStatus::Expired => ConfirmOutcome::Expired,
                            status => ConfirmOutcome::AlreadyTerminal(status),
                        });
                    };

                    let change = tx.confirm_sale(reservation.variant_id, reservation.quantity).await?;
                    tx.append_movement(NewStockMovement::record(
                        &change,
                        MovementType::Sale,
                        format!("sale for order {}", order_ref),
                        Some(order_ref.clone()),
                        now,
                    ))
                    .await?;
                    alerts::sync_alerts(tx, &change.after, threshold, now).await?;

                    Ok(ConfirmOutcome::Confirmed { reservation, replayed: false })
                })
            })
            .await;

        let outcome = result.map_err(|e| {
            if let StoreError::InvariantViolation { variant_id, detail } = &e {
                error!(%reservation_id, %variant_id, %detail, "Stock invariant violated while confirming reservation");
            }
            EngineError::from(e)
        })?;

        match &outcome {
            ConfirmOutcome::Confirmed { reservation, replayed: false } => info!(
                %reservation_id,
                variant_id = %reservation.variant_id,
                quantity = reservation.quantity,
                order_ref = ?reservation.order_ref,
                "Reservation confirmed"
            ),
            ConfirmOutcome::Confirmed { replayed: true, .. } => {
                debug!(%reservation_id, "Confirm replayed for the same order")
            }
            other => info!(%reservation_id, outcome = ?other, "Confirm refused"),
        }
        Ok(outcome)
    }

    /// Gives a held quantity back, e.g. when a payment fails.
    pub async fn release(&self, reservation_id: Uuid, reason: impl Into<String>) -> Result<ReleaseOutcome, EngineError> {
        self.end_hold(reservation_id, Transition::release(ReservationStatus::Released, reason.into(), self.now()))
            .await
    }

    /// User-initiated cancellation; same as [`Self::release`] but recorded as `cancelled`.
    pub async fn cancel(&self, reservation_id: Uuid) -> Result<ReleaseOutcome, EngineError> {
        self.end_hold(
            reservation_id,
            Transition::release(ReservationStatus::Cancelled, "cancelled_by_user".to_string(), self.now()),
        )
        .await
    }

    async fn end_hold(&self, reservation_id: Uuid, transition: Transition) -> Result<ReleaseOutcome, EngineError> {
        let threshold = self.config.default_low_stock_threshold;
        let target = transition.to;
        let outcome = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let at = transition.at;
                    let reason = transition.reason.clone().unwrap_or_default();
                    let Some(reservation) = tx.finish_reservation(reservation_id, transition).await? else {
                        let Some(current) = tx.reservation(reservation_id).await? else {
                            return Ok(ReleaseOutcome::NotFound);
                        };
                        return Ok(match current.status()? {
                            ReservationStatus::Confirmed => ReleaseOutcome::AlreadyTerminal(ReservationStatus::Confirmed),
                            // Still active means an expiry guard refused the swap.
                            ReservationStatus::Active => ReleaseOutcome::AlreadyTerminal(ReservationStatus::Active),
                            _ => ReleaseOutcome::Released { reservation: current, replayed: true },
                        });
                    };

                    let change = tx.release_reserved(reservation.variant_id, reservation.quantity).await?;
                    tx.append_movement(NewStockMovement::record(
                        &change,
                        MovementType::ReservationRelease,
                        reason,
                        Some(reservation.id.to_string()),
                        at,
                    ))
                    .await?;
                    alerts::sync_alerts(tx, &change.after, threshold, at).await?;

                    Ok(ReleaseOutcome::Released { reservation, replayed: false })
                })
            })
            .await?;

        match &outcome {
            ReleaseOutcome::Released { reservation, replayed: false } => info!(
                %reservation_id,
                variant_id = %reservation.variant_id,
                quantity = reservation.quantity,
                status = %target,
                reason = ?reservation.release_reason,
                "Reservation released"
            ),
            other => debug!(%reservation_id, outcome = ?other, "Release was a no-op"),
        }
        Ok(outcome)
    }

    /// Expires and releases every active hold whose expiry is at or before `now`.
    /// Each reservation is handled in its own transaction; one failure does not
    /// stop the rest of the sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let limit = self.config.sweep_batch_size.max(1);
        let mut report = SweepReport::default();

        loop {
            let batch = self
                .store
                .transaction(move |tx| Box::pin(async move { tx.lapsed_reservations(now, limit).await }))
                .await?;
            let batch_len = batch.len();
            let mut progressed = false;

            for reservation in batch {
                report.scanned += 1;
                match self.end_hold(reservation.id, Transition::expire(now)).await {
                    Ok(ReleaseOutcome::Released { replayed: false, .. }) => {
                        report.expired += 1;
                        progressed = true;
                    }
                    Ok(_) => {
                        report.skipped += 1;
                        progressed = true;
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(reservation_id = %reservation.id, error = %e, "Failed to expire reservation");
                    }
                }
            }

            if (batch_len as i64) < limit || !progressed {
                break;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "Expired reservations swept"
            );
        }
        Ok(report)
    }

    /// Administrative restock or correction. Positive deltas are logged as
    /// `restock`, negative ones as `adjustment`.
    pub async fn adjust_on_hand(
        &self,
        variant_id: Uuid,
        delta: i32,
        reason: String,
    ) -> Result<AdjustOutcome, EngineError> {
        if delta == 0 || delta.unsigned_abs() > MAX_ADJUST_DELTA.unsigned_abs() {
            return Err(EngineError::Invalid(format!(
                "delta must be non-zero and at most {} in magnitude",
                MAX_ADJUST_DELTA
            )));
        }
        let now = self.now();
        let threshold = self.config.default_low_stock_threshold;
        let movement_type = if delta > 0 { MovementType::Restock } else { MovementType::Adjustment };

        let outcome = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let change = match tx.adjust_on_hand(variant_id, delta).await {
                        Ok(change) => change,
                        Err(LedgerError::NotFound(_)) => return Ok(AdjustOutcome::NotFound),
                        Err(LedgerError::OutOfRange { on_hand, .. }) => return Ok(AdjustOutcome::OutOfRange { on_hand }),
                        Err(LedgerError::InvariantViolation { .. }) => {
                            let current = tx.stock(variant_id).await?;
                            return Ok(match current {
                                Some(s) => AdjustOutcome::BelowReserved {
                                    on_hand: s.quantity_on_hand,
                                    reserved: s.quantity_reserved,
                                },
                                None => AdjustOutcome::NotFound,
                            });
                        }
                        Err(other) => return Err(StoreError::from(other)),
                    };
                    tx.append_movement(NewStockMovement::record(&change, movement_type, reason, None, now))
                        .await?;
                    alerts::sync_alerts(tx, &change.after, threshold, now).await?;
                    Ok(AdjustOutcome::Adjusted(StockSnapshot::of(&change.after, threshold)))
                })
            })
            .await?;

        match &outcome {
            AdjustOutcome::Adjusted(s) => info!(
                %variant_id,
                delta,
                on_hand = s.quantity_on_hand,
                movement = movement_type.as_str(),
                "Stock adjusted"
            ),
            other => warn!(%variant_id, delta, outcome = ?other, "Stock adjustment refused"),
        }
        Ok(outcome)
    }

    /// Compares the ledger's reserved counter with the sum of active holds.
    pub async fn reconcile(&self, variant_id: Uuid) -> Result<Option<ReconcileReport>, EngineError> {
        let report = self
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let Some(stock) = tx.stock(variant_id).await? else {
                        return Ok(None);
                    };
                    let active_reserved = tx.active_reserved_total(variant_id).await?;
                    let ledger_reserved = i64::from(stock.quantity_reserved);
                    Ok(Some(ReconcileReport {
                        variant_id,
                        ledger_reserved,
                        active_reserved,
                        consistent: ledger_reserved == active_reserved
                            && stock.quantity_on_hand >= stock.quantity_reserved,
                    }))
                })
            })
            .await?;

        if let Some(r) = &report {
            if !r.consistent {
                error!(
                    %variant_id,
                    ledger_reserved = r.ledger_reserved,
                    active_reserved = r.active_reserved,
                    "Reserved counter does not match active reservations"
                );
            }
        }
        Ok(report)
    }
}
