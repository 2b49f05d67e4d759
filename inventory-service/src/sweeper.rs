use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};
use crate::engine::{ReservationEngine, SweepReport};
use crate::error::EngineError;
use crate::store::StockStore;

/// Releases lapsed holds on a fixed interval. Overlapping runs are harmless:
/// every release is a compare-and-swap on the reservation status.
pub struct ExpirySweeper<S: StockStore> {
    engine: Arc<ReservationEngine<S>>,
    interval: Duration,
}

impl<S: StockStore> ExpirySweeper<S> {
    pub fn new(engine: Arc<ReservationEngine<S>>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep_once().await {
                error!("Error sweeping expired reservations: {}", e);
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let now = self.engine.now();
        self.engine.sweep_expired(now).await
    }
}
