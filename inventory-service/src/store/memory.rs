use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::error::{LedgerError, StoreError};
use crate::models::*;
use super::{AlertStore, MovementLog, ReservationStore, StockLedger, StockStore, TxFuture};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    variants: HashMap<Uuid, VariantStock>,
    reservations: HashMap<Uuid, Reservation>,
    alerts: Vec<StockAlert>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: MemoryState,
    movements: Vec<StockMovement>,
}

/// In-process store for tests and local runs. Transactions run one at a time
/// against a snapshot of the variant, reservation and alert tables that
/// replaces the shared state on commit and is dropped on rollback. The
/// append-only movement log is moved into the transaction instead of copied,
/// and truncated back on rollback.
#[derive(Debug, Clone, Default)]
pub struct MemoryStockStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryTx {
    state: MemoryState,
    movements: Vec<StockMovement>,
}

#[async_trait]
impl StockStore for MemoryStockStore {
    type Tx = MemoryTx;

    async fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut MemoryTx) -> TxFuture<'c, T> + Send + 'static,
    {
        let mut shared = self.inner.lock().await;
        let committed = shared.movements.len();
        let mut tx = MemoryTx {
            state: shared.state.clone(),
            movements: std::mem::take(&mut shared.movements),
        };
        let result = work(&mut tx).await;
        if result.is_ok() {
            shared.state = tx.state;
        } else {
            tx.movements.truncate(committed);
        }
        shared.movements = tx.movements;
        result
    }
}

impl MemoryTx {
    fn variant_mut(&mut self, variant_id: Uuid) -> Result<&mut VariantStock, LedgerError> {
        self.state
            .variants
            .get_mut(&variant_id)
            .ok_or(LedgerError::NotFound(variant_id))
    }
}

#[async_trait]
impl StockLedger for MemoryTx {
    async fn stock(&mut self, variant_id: Uuid) -> Result<Option<VariantStock>, StoreError> {
        Ok(self.state.variants.get(&variant_id).cloned())
    }

    async fn insert_variant(&mut self, variant: NewVariantStock) -> Result<VariantStock, StoreError> {
        let duplicate = self.state.variants.contains_key(&variant.variant_id)
            || self.state.variants.values().any(|v| v.sku == variant.sku);
        if duplicate {
            return Err(StoreError::Database(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                Box::new(format!("variant {} / sku {} already exists", variant.variant_id, variant.sku)),
            )));
        }
        let now = Utc::now();
        let row = VariantStock {
            variant_id: variant.variant_id,
            product_id: variant.product_id,
            sku: variant.sku,
            quantity_on_hand: variant.quantity_on_hand,
            quantity_reserved: 0,
            low_stock_threshold: variant.low_stock_threshold,
            is_active: variant.is_active,
            created_at: now,
            updated_at: now,
        };
        self.state.variants.insert(row.variant_id, row.clone());
        Ok(row)
    }

    async fn try_reserve(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError> {
        let row = self.variant_mut(variant_id)?;
        if !row.is_active {
            return Err(LedgerError::Inactive(variant_id));
        }
        if row.quantity_on_hand - row.quantity_reserved < quantity {
            return Err(LedgerError::InsufficientStock {
                variant_id,
                requested: quantity,
                available: row.quantity_available(),
            });
        }
        let before = row.clone();
        row.quantity_reserved += quantity;
        row.updated_at = Utc::now();
        Ok(StockChange { before, after: row.clone() })
    }

    async fn release_reserved(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError> {
        let row = self.variant_mut(variant_id)?;
        let before = row.clone();
        if row.quantity_reserved < quantity {
            tracing::warn!(
                %variant_id,
                reserved = row.quantity_reserved,
                quantity,
                "Releasing more than is reserved, flooring at zero"
            );
        }
        row.quantity_reserved = (row.quantity_reserved - quantity).max(0);
        row.updated_at = Utc::now();
        Ok(StockChange { before, after: row.clone() })
    }

    async fn confirm_sale(&mut self, variant_id: Uuid, quantity: i32) -> Result<StockChange, LedgerError> {
        let row = self.variant_mut(variant_id)?;
        if row.quantity_reserved < quantity || row.quantity_on_hand < quantity {
            return Err(LedgerError::InvariantViolation {
                variant_id,
                detail: format!(
                    "sale of {} against on_hand {} / reserved {}",
                    quantity, row.quantity_on_hand, row.quantity_reserved
                ),
            });
        }
        let before = row.clone();
        row.quantity_on_hand -= quantity;
        row.quantity_reserved -= quantity;
        row.updated_at = Utc::now();
        Ok(StockChange { before, after: row.clone() })
    }

    async fn adjust_on_hand(&mut self, variant_id: Uuid, delta: i32) -> Result<StockChange, LedgerError> {
        let row = self.variant_mut(variant_id)?;
        let target = row.quantity_on_hand.checked_add(delta).ok_or(LedgerError::OutOfRange {
            variant_id,
            on_hand: row.quantity_on_hand,
            delta,
        })?;
        if target < 0 || target < row.quantity_reserved {
            return Err(LedgerError::InvariantViolation {
                variant_id,
                detail: format!(
                    "on_hand {} + {} would fall below reserved {}",
                    row.quantity_on_hand, delta, row.quantity_reserved
                ),
            });
        }
        let before = row.clone();
        row.quantity_on_hand = target;
        row.updated_at = Utc::now();
        Ok(StockChange { before, after: row.clone() })
    }
}

#[async_trait]
impl ReservationStore for MemoryTx {
    async fn insert_reservation(&mut self, reservation: NewReservation) -> Result<Reservation, StoreError> {
        let row = Reservation {
            id: reservation.id,
            variant_id: reservation.variant_id,
            quantity: reservation.quantity,
            status: reservation.status,
            cart_ref: reservation.cart_ref,
            order_ref: None,
            release_reason: None,
            created_at: reservation.created_at,
            expires_at: reservation.expires_at,
            updated_at: reservation.updated_at,
        };
        self.state.reservations.insert(row.id, row.clone());
        Ok(row)
    }

    async fn reservation(&mut self, id: Uuid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.state.reservations.get(&id).cloned())
    }

    async fn finish_reservation(
        &mut self,
        id: Uuid,
        transition: Transition,
    ) -> Result<Option<Reservation>, StoreError> {
        let Some(row) = self.state.reservations.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != ReservationStatus::Active.as_str() || !transition.admits(row.expires_at) {
            return Ok(None);
        }
        row.status = transition.to.as_str().to_string();
        row.order_ref = transition.order_ref;
        row.release_reason = transition.reason;
        row.updated_at = transition.at;
        Ok(Some(row.clone()))
    }

    async fn extend_reservation(
        &mut self,
        id: Uuid,
        expected: DateTime<Utc>,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>, StoreError> {
        let Some(row) = self.state.reservations.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != ReservationStatus::Active.as_str()
            || row.expires_at != expected
            || row.expires_at <= now
        {
            return Ok(None);
        }
        row.expires_at = new_expiry;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn lapsed_reservations(&mut self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Reservation>, StoreError> {
        let mut lapsed: Vec<Reservation> = self
            .state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active.as_str() && r.expires_at <= now)
            .cloned()
            .collect();
        lapsed.sort_by_key(|r| r.expires_at);
        lapsed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(lapsed)
    }

    async fn reservation_counts(&mut self, now: DateTime<Utc>) -> Result<ReservationCounts, StoreError> {
        let mut counts = ReservationCounts::default();
        for r in self.state.reservations.values() {
            match r.status()? {
                ReservationStatus::Active if r.expires_at > now => counts.active_count += 1,
                ReservationStatus::Active => counts.needs_cleanup_count += 1,
                ReservationStatus::Expired => counts.expired_count += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn active_reserved_total(&mut self, variant_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .state
            .reservations
            .values()
            .filter(|r| r.variant_id == variant_id && r.status == ReservationStatus::Active.as_str())
            .map(|r| i64::from(r.quantity))
            .sum())
    }
}

#[async_trait]
impl MovementLog for MemoryTx {
    async fn append_movement(&mut self, movement: NewStockMovement) -> Result<StockMovement, StoreError> {
        let row = StockMovement {
            id: self.movements.len() as i64 + 1,
            variant_id: movement.variant_id,
            movement_type: movement.movement_type,
            quantity_delta: movement.quantity_delta,
            quantity_before: movement.quantity_before,
            quantity_after: movement.quantity_after,
            reason: movement.reason,
            reference_id: movement.reference_id,
            created_at: movement.created_at,
        };
        self.movements.push(row.clone());
        Ok(row)
    }

    async fn movements(&mut self, variant_id: Uuid, limit: i64) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self
            .movements
            .iter()
            .rev()
            .filter(|m| m.variant_id == variant_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryTx {
    async fn open_alerts(&mut self, variant_id: Uuid) -> Result<Vec<StockAlert>, StoreError> {
        Ok(self
            .state
            .alerts
            .iter()
            .filter(|a| a.variant_id == variant_id && !a.is_resolved)
            .cloned()
            .collect())
    }

    async fn raise_alert(&mut self, alert: NewStockAlert) -> Result<StockAlert, StoreError> {
        let row = StockAlert {
            id: alert.id,
            variant_id: alert.variant_id,
            alert_type: alert.alert_type,
            available_quantity: alert.available_quantity,
            threshold: alert.threshold,
            is_resolved: alert.is_resolved,
            created_at: alert.created_at,
            resolved_at: None,
        };
        self.state.alerts.push(row.clone());
        Ok(row)
    }

    async fn resolve_alerts(&mut self, variant_id: Uuid, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut resolved = 0;
        for alert in self
            .state
            .alerts
            .iter_mut()
            .filter(|a| a.variant_id == variant_id && !a.is_resolved)
        {
            alert.is_resolved = true;
            alert.resolved_at = Some(at);
            resolved += 1;
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_variant(on_hand: i32) -> NewVariantStock {
        NewVariantStock {
            variant_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            sku: "AJ1-RETRO-10".to_string(),
            quantity_on_hand: on_hand,
            low_stock_threshold: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_no_trace() {
        let store = MemoryStockStore::new();
        let variant = new_variant(5);
        let variant_id = variant.variant_id;
        store
            .transaction(move |tx| Box::pin(async move { tx.insert_variant(variant).await }))
            .await
            .unwrap();

        let result: Result<(), StoreError> = store
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.try_reserve(variant_id, 3).await?;
                    Err(StoreError::Unexpected("abort".to_string()))
                })
            })
            .await;
        assert!(result.is_err());

        let stock = store
            .transaction(move |tx| Box::pin(async move { tx.stock(variant_id).await }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stock.quantity_reserved, 0);
    }

    #[tokio::test]
    async fn rollback_drops_pending_movements_only() {
        let store = MemoryStockStore::new();
        let variant = new_variant(5);
        let variant_id = variant.variant_id;
        store
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_variant(variant).await?;
                    let change = tx.try_reserve(variant_id, 1).await?;
                    let entry =
                        NewStockMovement::record(&change, MovementType::ReservationHold, "hold".into(), None, Utc::now());
                    tx.append_movement(entry).await
                })
            })
            .await
            .unwrap();

        let result: Result<(), StoreError> = store
            .transaction(move |tx| {
                Box::pin(async move {
                    let change = tx.try_reserve(variant_id, 1).await?;
                    let entry =
                        NewStockMovement::record(&change, MovementType::ReservationHold, "hold".into(), None, Utc::now());
                    tx.append_movement(entry).await?;
                    Err(StoreError::Unexpected("abort".to_string()))
                })
            })
            .await;
        assert!(result.is_err());

        let movements = store
            .transaction(move |tx| Box::pin(async move { tx.movements(variant_id, 10).await }))
            .await
            .unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].id, 1);
    }

    #[tokio::test]
    async fn ledger_primitives_guard_the_counters() {
        let store = MemoryStockStore::new();
        let variant = new_variant(3);
        let variant_id = variant.variant_id;

        let outcome = store
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_variant(variant).await?;
                    let first = tx.try_reserve(variant_id, 2).await.is_ok();
                    let second = matches!(
                        tx.try_reserve(variant_id, 2).await,
                        Err(LedgerError::InsufficientStock { available: 1, .. })
                    );
                    let undercut = matches!(
                        tx.adjust_on_hand(variant_id, -2).await,
                        Err(LedgerError::InvariantViolation { .. })
                    );
                    let oversell = matches!(
                        tx.confirm_sale(variant_id, 3).await,
                        Err(LedgerError::InvariantViolation { .. })
                    );
                    let floored = tx.release_reserved(variant_id, 5).await?;
                    Ok((first, second, undercut, oversell, floored.after.quantity_reserved))
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome, (true, true, true, true, 0));
    }

    #[tokio::test]
    async fn unknown_and_inactive_variants_are_rejected() {
        let store = MemoryStockStore::new();
        let mut variant = new_variant(3);
        variant.is_active = false;
        let variant_id = variant.variant_id;

        let (missing, inactive) = store
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.insert_variant(variant).await?;
                    let missing = matches!(tx.try_reserve(Uuid::new_v4(), 1).await, Err(LedgerError::NotFound(_)));
                    let inactive = matches!(tx.try_reserve(variant_id, 1).await, Err(LedgerError::Inactive(_)));
                    Ok((missing, inactive))
                })
            })
            .await
            .unwrap();

        assert!(missing);
        assert!(inactive);
    }
}
