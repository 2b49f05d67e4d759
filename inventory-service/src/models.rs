use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::variant_stock)]
#[diesel(primary_key(variant_id))]
pub struct VariantStock {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub quantity_on_hand: i32,
    pub quantity_reserved: i32,
    pub low_stock_threshold: Option<i32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VariantStock {
    pub fn quantity_available(&self) -> i32 {
        (self.quantity_on_hand - self.quantity_reserved).max(0)
    }

    pub fn threshold_or(&self, default_threshold: i32) -> i32 {
        self.low_stock_threshold.unwrap_or(default_threshold)
    }
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::variant_stock)]
pub struct NewVariantStock {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub quantity_on_hand: i32,
    #[serde(default)]
    pub low_stock_threshold: Option<i32>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Counter snapshots on either side of one ledger primitive.
#[derive(Debug, Clone)]
pub struct StockChange {
    pub before: VariantStock,
    pub after: VariantStock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Confirmed,
    Expired,
    Released,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Released => "released",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ReservationStatus::Active
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "expired" => Ok(ReservationStatus::Expired),
            "released" => Ok(ReservationStatus::Released),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(StoreError::Corrupt {
                column: "reservations.status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub cart_ref: Option<String>,
    pub order_ref: Option<String>,
    pub release_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn status(&self) -> Result<ReservationStatus, StoreError> {
        self.status.parse()
    }

    pub fn is_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub cart_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which side of the expiry instant a status change requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryGuard {
    Any,
    /// `expires_at > at`
    LiveAt(DateTime<Utc>),
    /// `expires_at <= at`
    LapsedAt(DateTime<Utc>),
}

/// A compare-and-swap from `active` into a terminal status.
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: ReservationStatus,
    pub order_ref: Option<String>,
    pub reason: Option<String>,
    pub guard: ExpiryGuard,
    pub at: DateTime<Utc>,
}

impl Transition {
    pub fn confirm(order_ref: String, at: DateTime<Utc>) -> Self {
        Self {
            to: ReservationStatus::Confirmed,
            order_ref: Some(order_ref),
            reason: None,
            guard: ExpiryGuard::LiveAt(at),
            at,
        }
    }

    pub fn release(to: ReservationStatus, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            to,
            order_ref: None,
            reason: Some(reason),
            guard: ExpiryGuard::Any,
            at,
        }
    }

    pub fn expire(at: DateTime<Utc>) -> Self {
        Self {
            to: ReservationStatus::Expired,
            order_ref: None,
            reason: Some("hold_expired".to_string()),
            guard: ExpiryGuard::LapsedAt(at),
            at,
        }
    }

    pub fn admits(&self, expires_at: DateTime<Utc>) -> bool {
        match self.guard {
            ExpiryGuard::Any => true,
            ExpiryGuard::LiveAt(at) => expires_at > at,
            ExpiryGuard::LapsedAt(at) => expires_at <= at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    ReservationHold,
    ReservationRelease,
    Sale,
    Restock,
    Adjustment,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::ReservationHold => "reservation_hold",
            MovementType::ReservationRelease => "reservation_release",
            MovementType::Sale => "sale",
            MovementType::Restock => "restock",
            MovementType::Adjustment => "adjustment",
        }
    }

    /// Holds and releases move the reserved counter; everything else moves on-hand.
    pub fn tracks_reserved(self) -> bool {
        matches!(self, MovementType::ReservationHold | MovementType::ReservationRelease)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_movements)]
pub struct StockMovement {
    pub id: i64,
    pub variant_id: Uuid,
    pub movement_type: String,
    pub quantity_delta: i32,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub reason: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock_movements)]
pub struct NewStockMovement {
    pub variant_id: Uuid,
    pub movement_type: String,
    pub quantity_delta: i32,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub reason: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewStockMovement {
    pub fn record(
        change: &StockChange,
        movement_type: MovementType,
        reason: String,
        reference_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (before, after) = if movement_type.tracks_reserved() {
            (change.before.quantity_reserved, change.after.quantity_reserved)
        } else {
            (change.before.quantity_on_hand, change.after.quantity_on_hand)
        };
        Self {
            variant_id: change.after.variant_id,
            movement_type: movement_type.as_str().to_string(),
            quantity_delta: after - before,
            quantity_before: before,
            quantity_after: after,
            reason,
            reference_id,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_alerts)]
pub struct StockAlert {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub alert_type: String,
    pub available_quantity: i32,
    pub threshold: i32,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock_alerts)]
pub struct NewStockAlert {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub alert_type: String,
    pub available_quantity: i32,
    pub threshold: i32,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCounts {
    pub active_count: i64,
    pub expired_count: i64,
    pub needs_cleanup_count: i64,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_commands)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub result: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(on_hand: i32, reserved: i32) -> VariantStock {
        VariantStock {
            variant_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            sku: "SNK-42-BLK".to_string(),
            quantity_on_hand: on_hand,
            quantity_reserved: reserved,
            low_stock_threshold: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn available_never_goes_negative() {
        assert_eq!(stock(10, 4).quantity_available(), 6);
        assert_eq!(stock(2, 5).quantity_available(), 0);
    }

    #[test]
    fn sale_movement_snapshots_on_hand() {
        let before = stock(10, 4);
        let mut after = before.clone();
        after.quantity_on_hand = 6;
        after.quantity_reserved = 0;
        let change = StockChange { before, after };

        let entry = NewStockMovement::record(&change, MovementType::Sale, "order A".into(), None, Utc::now());
        assert_eq!((entry.quantity_before, entry.quantity_after, entry.quantity_delta), (10, 6, -4));

        let entry = NewStockMovement::record(
            &change,
            MovementType::ReservationRelease,
            "payment_failed".into(),
            None,
            Utc::now(),
        );
        assert_eq!((entry.quantity_before, entry.quantity_after, entry.quantity_delta), (4, 0, -4));
    }

    #[test]
    fn status_round_trips_through_column_text() {
        for status in [
            ReservationStatus::Active,
            ReservationStatus::Confirmed,
            ReservationStatus::Expired,
            ReservationStatus::Released,
            ReservationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ReservationStatus>().unwrap(), status);
        }
        assert!("reserved".parse::<ReservationStatus>().is_err());
    }

    #[test]
    fn expiry_guards() {
        let now = Utc::now();
        let past = now - chrono::Duration::minutes(1);
        let future = now + chrono::Duration::minutes(1);

        assert!(Transition::confirm("o".into(), now).admits(future));
        assert!(!Transition::confirm("o".into(), now).admits(now));
        assert!(Transition::expire(now).admits(past));
        assert!(Transition::expire(now).admits(now));
        assert!(!Transition::expire(now).admits(future));
        assert!(Transition::release(ReservationStatus::Released, "r".into(), now).admits(past));
    }
}
