//! Low-stock / out-of-stock classification.
//!
//! Classification is a pure function of the ledger row. Alert records are
//! raised when a variant drops into `low_stock` or `out_of_stock` and resolved
//! when it climbs back to `in_stock`; stock counters are never touched here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use crate::error::StoreError;
use crate::models::{NewStockAlert, StockAlert, VariantStock};
use crate::store::{AlertStore, StockTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    OutOfStock,
    LowStock,
    InStock,
}

impl StockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            StockLevel::OutOfStock => "out_of_stock",
            StockLevel::LowStock => "low_stock",
            StockLevel::InStock => "in_stock",
        }
    }
}

pub fn classify(available: i32, threshold: i32) -> StockLevel {
    if available <= 0 {
        StockLevel::OutOfStock
    } else if available <= threshold {
        StockLevel::LowStock
    } else {
        StockLevel::InStock
    }
}

pub fn level_of(stock: &VariantStock, default_threshold: i32) -> StockLevel {
    classify(stock.quantity_available(), stock.threshold_or(default_threshold))
}

/// Brings the variant's open alerts in line with its current level.
/// Returns the alert raised, if any.
pub async fn sync_alerts<T: StockTx + ?Sized>(
    tx: &mut T,
    stock: &VariantStock,
    default_threshold: i32,
    at: DateTime<Utc>,
) -> Result<Option<StockAlert>, StoreError> {
    let threshold = stock.threshold_or(default_threshold);
    let level = classify(stock.quantity_available(), threshold);
    let open = tx.open_alerts(stock.variant_id).await?;

    if level == StockLevel::InStock {
        if !open.is_empty() {
            let resolved = tx.resolve_alerts(stock.variant_id, at).await?;
            info!(variant_id = %stock.variant_id, resolved, "Stock alerts cleared");
        }
        return Ok(None);
    }

    if open.iter().any(|a| a.alert_type == level.as_str()) {
        return Ok(None);
    }
    if !open.is_empty() {
        tx.resolve_alerts(stock.variant_id, at).await?;
    }

    let alert = tx
        .raise_alert(NewStockAlert {
            id: Uuid::new_v4(),
            variant_id: stock.variant_id,
            alert_type: level.as_str().to_string(),
            available_quantity: stock.quantity_available(),
            threshold,
            is_resolved: false,
            created_at: at,
        })
        .await?;
    info!(
        variant_id = %stock.variant_id,
        sku = %stock.sku,
        level = level.as_str(),
        available = alert.available_quantity,
        "Stock alert raised"
    );
    Ok(Some(alert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewVariantStock;
    use crate::store::{AlertStore, MemoryStockStore, StockLedger, StockStore};

    #[test]
    fn classification_boundaries() {
        assert_eq!(classify(0, 5), StockLevel::OutOfStock);
        assert_eq!(classify(1, 5), StockLevel::LowStock);
        assert_eq!(classify(5, 5), StockLevel::LowStock);
        assert_eq!(classify(6, 5), StockLevel::InStock);
        assert_eq!(classify(1, 0), StockLevel::InStock);
    }

    #[tokio::test]
    async fn alerts_follow_the_level() {
        let store = MemoryStockStore::new();
        let variant_id = Uuid::new_v4();

        let open = store
            .transaction(move |tx| {
                Box::pin(async move {
                    let now = Utc::now();
                    tx.insert_variant(NewVariantStock {
                        variant_id,
                        product_id: Uuid::new_v4(),
                        sku: "DUNK-LOW-9".to_string(),
                        quantity_on_hand: 10,
                        low_stock_threshold: Some(3),
                        is_active: true,
                    })
                    .await?;

                    let low = tx.try_reserve(variant_id, 8).await?.after;
                    assert!(sync_alerts(tx, &low, 5, now).await?.is_some());
                    // Same level again raises nothing new.
                    assert!(sync_alerts(tx, &low, 5, now).await?.is_none());

                    let out = tx.try_reserve(variant_id, 2).await?.after;
                    let raised = sync_alerts(tx, &out, 5, now).await?.map(|a| a.alert_type);
                    assert_eq!(raised.as_deref(), Some("out_of_stock"));

                    let back = tx.release_reserved(variant_id, 10).await?.after;
                    assert!(sync_alerts(tx, &back, 5, now).await?.is_none());
                    tx.open_alerts(variant_id).await
                })
            })
            .await
            .unwrap();

        assert!(open.is_empty());
    }
}
