use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;
use shared::*;
use crate::engine::{ConfirmOutcome, ReleaseOutcome, ReservationEngine};
use crate::models::ProcessedCommand;
use crate::schema::processed_commands;
use crate::store::{DbPool, PgStockStore, StockStore};

const HANDLE_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Per-reservation result carried in a command reply.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationResult {
    pub reservation_id: Uuid,
    pub ok: bool,
    pub outcome: String,
}

/// Consumes payment callbacks and turns them into confirm / release calls.
pub struct CommandHandler {
    engine: Arc<ReservationEngine<PgStockStore>>,
    pool: DbPool,
    producer: FutureProducer,
    reply_topic: String,
}

impl CommandHandler {
    pub fn new(
        engine: Arc<ReservationEngine<PgStockStore>>,
        pool: DbPool,
        producer: FutureProducer,
        reply_topic: String,
    ) -> Self {
        Self { engine, pool, producer, reply_topic }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<Command>(json_str) {
                                Ok(command) => {
                                    let handled =
                                        with_retries(HANDLE_ATTEMPTS, RETRY_BACKOFF, || self.handle_command(&command)).await;
                                    if let Err(e) = handled {
                                        escalate_unhandled(&command, &e);
                                    }
                                }
                                Err(e) => warn!("Skipping malformed command: {}", e),
                            },
                            Err(e) => error!("Error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_command(&self, command: &Command) -> Result<()> {
        let mut conn = self.pool.get().await?;

        if let Some(existing) = self.check_idempotency(&mut conn, &command.idempotency_key).await? {
            info!(idempotency_key = %command.idempotency_key, "Command already processed, returning cached result");
            let reply = existing
                .result
                .and_then(|v| serde_json::from_value::<CommandReply>(v).ok())
                .map(|cached| CommandReply { id: Uuid::new_v4(), created_at: chrono::Utc::now(), ..cached })
                .unwrap_or_else(|| CommandReply::success(command.id, command.correlation_id, None));
            self.send_reply(reply).await?;
            return Ok(());
        }

        let reply = apply_command(&self.engine, command).await;

        self.store_processed_command(&mut conn, command, &reply).await?;
        self.send_reply(reply).await?;

        Ok(())
    }

    async fn check_idempotency(&self, conn: &mut AsyncPgConnection, key: &str) -> Result<Option<ProcessedCommand>> {
        let result = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(key))
            .first::<ProcessedCommand>(conn)
            .await
            .optional()?;
        Ok(result)
    }

    async fn store_processed_command(&self, conn: &mut AsyncPgConnection, command: &Command, reply: &CommandReply) -> Result<()> {
        let processed_command = ProcessedCommand {
            idempotency_key: command.idempotency_key.clone(),
            command_id: command.id,
            result: Some(serde_json::to_value(reply)?),
            processed_at: Some(chrono::Utc::now()),
        };

        // A concurrent redelivery may have recorded it first; the engine calls are idempotent either way.
        diesel::insert_into(processed_commands::table)
            .values(&processed_command)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;

        Ok(())
    }

    async fn send_reply(&self, reply: CommandReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.correlation_id.to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

/// Retries `op` up to `attempts` times with a linear backoff.
pub async fn with_retries<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Command handling failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The confirm a payment callback asked for, when the command is one.
pub fn reconciliation_target(command: &Command) -> Option<ConfirmReservationData> {
    match command.command_type {
        CommandType::ConfirmReservation => serde_json::from_value(command.payload.clone()).ok(),
        CommandType::ReleaseReservation => None,
    }
}

/// A command that could not be handled even after retries. Its offset is
/// still committed, so a paid confirm must be flagged for reconciliation here.
fn escalate_unhandled(command: &Command, err: &anyhow::Error) {
    match reconciliation_target(command) {
        Some(data) => error!(
            needs_reconciliation = true,
            command_id = %command.id,
            correlation_id = %command.correlation_id,
            reservation_ids = ?data.reservation_ids,
            order_ref = %data.order_ref,
            error = %err,
            "Payment confirmed but confirm command could not be processed"
        ),
        None => error!(
            command_id = %command.id,
            command_type = ?command.command_type,
            error = %err,
            "Error handling command"
        ),
    }
}

/// Runs one command against the engine and builds the reply. Never fails:
/// bad payloads and refused transitions become `Failed` replies.
pub async fn apply_command<S: StockStore>(engine: &ReservationEngine<S>, command: &Command) -> CommandReply {
    let results = match command.command_type {
        CommandType::ConfirmReservation => {
            let data: ConfirmReservationData = match serde_json::from_value(command.payload.clone()) {
                Ok(data) => data,
                Err(e) => return CommandReply::failed(command.id, command.correlation_id, format!("Invalid payload: {}", e)),
            };
            confirm_all(engine, command, data).await
        }
        CommandType::ReleaseReservation => {
            let data: ReleaseReservationData = match serde_json::from_value(command.payload.clone()) {
                Ok(data) => data,
                Err(e) => return CommandReply::failed(command.id, command.correlation_id, format!("Invalid payload: {}", e)),
            };
            release_all(engine, data).await
        }
    };

    let failures = results.iter().filter(|r| !r.ok).count();
    let body = serde_json::json!({ "reservations": results });
    if failures == 0 {
        CommandReply::success(command.id, command.correlation_id, Some(body))
    } else {
        CommandReply::failed_with(
            command.id,
            command.correlation_id,
            format!("{} of {} reservations failed", failures, results.len()),
            body,
        )
    }
}

async fn confirm_all<S: StockStore>(
    engine: &ReservationEngine<S>,
    command: &Command,
    data: ConfirmReservationData,
) -> Vec<ReservationResult> {
    let mut results = Vec::with_capacity(data.reservation_ids.len());
    for reservation_id in data.reservation_ids {
        let (ok, outcome) = match engine.confirm(reservation_id, data.order_ref.clone()).await {
            Ok(ConfirmOutcome::Confirmed { replayed, .. }) => {
                (true, if replayed { "already_confirmed" } else { "confirmed" }.to_string())
            }
            Ok(ConfirmOutcome::NotFound) => (false, "not_found".to_string()),
            Ok(ConfirmOutcome::Expired) => (false, "expired".to_string()),
            Ok(ConfirmOutcome::AlreadyTerminal(status)) => (false, format!("already_{}", status)),
            Err(e) => (false, format!("error: {}", e)),
        };
        if !ok {
            // Payment has been taken but the stock was not sold.
            error!(
                needs_reconciliation = true,
                %reservation_id,
                order_ref = %data.order_ref,
                correlation_id = %command.correlation_id,
                outcome = %outcome,
                "Payment confirmed but reservation could not be confirmed"
            );
        }
        results.push(ReservationResult { reservation_id, ok, outcome });
    }
    results
}

async fn release_all<S: StockStore>(engine: &ReservationEngine<S>, data: ReleaseReservationData) -> Vec<ReservationResult> {
    let mut results = Vec::with_capacity(data.reservation_ids.len());
    for reservation_id in data.reservation_ids {
        let (ok, outcome) = match engine.release(reservation_id, data.reason.clone()).await {
            Ok(ReleaseOutcome::Released { replayed: false, .. }) => (true, "released".to_string()),
            Ok(ReleaseOutcome::Released { replayed: true, .. }) => (true, "already_released".to_string()),
            Ok(ReleaseOutcome::NotFound) => (false, "not_found".to_string()),
            Ok(ReleaseOutcome::AlreadyTerminal(status)) => (false, format!("already_{}", status)),
            Err(e) => (false, format!("error: {}", e)),
        };
        if !ok {
            warn!(%reservation_id, outcome = %outcome, "Release command refused");
        }
        results.push(ReservationResult { reservation_id, ok, outcome });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{EngineConfig, ReserveOutcome};
    use crate::models::NewVariantStock;
    use crate::store::MemoryStockStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn setup() -> (ReservationEngine<MemoryStockStore>, Arc<ManualClock>, Uuid) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = ReservationEngine::new(MemoryStockStore::new(), clock.clone(), EngineConfig::default());
        let variant_id = Uuid::new_v4();
        engine
            .register_variant(NewVariantStock {
                variant_id,
                product_id: Uuid::new_v4(),
                sku: "AJ1-CHI-10".to_string(),
                quantity_on_hand: 4,
                low_stock_threshold: None,
                is_active: true,
            })
            .await
            .unwrap();
        (engine, clock, variant_id)
    }

    async fn hold(engine: &ReservationEngine<MemoryStockStore>, variant_id: Uuid, quantity: i32) -> Uuid {
        match engine.reserve(variant_id, quantity, Some(10), None).await.unwrap() {
            ReserveOutcome::Reserved(r) => r.id,
            other => panic!("expected a reservation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn confirm_command_sells_every_hold() {
        let (engine, _, variant_id) = setup().await;
        let a = hold(&engine, variant_id, 1).await;
        let b = hold(&engine, variant_id, 2).await;

        let command = Command::new(
            Uuid::new_v4(),
            CommandType::ConfirmReservation,
            serde_json::json!({ "reservation_ids": [a, b], "order_ref": "order-77" }),
        );
        let reply = apply_command(&engine, &command).await;
        assert_eq!(reply.status, CommandStatus::Success);
        assert_eq!(reply.correlation_id, command.correlation_id);

        let stock = engine.stock(variant_id).await.unwrap().unwrap();
        assert_eq!((stock.quantity_on_hand, stock.quantity_reserved), (1, 0));

        // Redelivery of the same confirm is still a success.
        let again = apply_command(&engine, &command).await;
        assert_eq!(again.status, CommandStatus::Success);
        assert_eq!(engine.stock(variant_id).await.unwrap().unwrap().quantity_on_hand, 1);
    }

    #[tokio::test]
    async fn confirm_of_an_expired_hold_fails_the_reply() {
        let (engine, clock, variant_id) = setup().await;
        let id = hold(&engine, variant_id, 1).await;
        clock.advance(chrono::Duration::minutes(11));

        let command = Command::new(
            Uuid::new_v4(),
            CommandType::ConfirmReservation,
            serde_json::json!({ "reservation_ids": [id], "order_ref": "order-late" }),
        );
        let reply = apply_command(&engine, &command).await;
        assert_eq!(reply.status, CommandStatus::Failed);
        let result = reply.result.unwrap();
        assert_eq!(result["reservations"][0]["outcome"], "expired");
    }

    #[tokio::test]
    async fn release_command_uses_the_payment_failed_reason() {
        let (engine, _, variant_id) = setup().await;
        let id = hold(&engine, variant_id, 3).await;

        let command = Command::new(
            Uuid::new_v4(),
            CommandType::ReleaseReservation,
            serde_json::json!({ "reservation_ids": [id] }),
        );
        let reply = apply_command(&engine, &command).await;
        assert_eq!(reply.status, CommandStatus::Success);

        let reservation = engine.reservation(id).await.unwrap().unwrap();
        assert_eq!(reservation.release_reason.as_deref(), Some("payment_failed"));
        assert_eq!(engine.available(variant_id).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retries(5, Duration::from_millis(1), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(anyhow::anyhow!("pool timed out"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn persistent_failures_give_up_after_the_last_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retries(3, Duration::from_millis(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("database unavailable"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(AtomicU32::load(&counter, Ordering::SeqCst), 3);
    }

    #[test]
    fn only_confirm_commands_need_reconciliation() {
        let id = Uuid::new_v4();
        let confirm = Command::new(
            Uuid::new_v4(),
            CommandType::ConfirmReservation,
            serde_json::json!({ "reservation_ids": [id], "order_ref": "order-5" }),
        );
        let target = reconciliation_target(&confirm).unwrap();
        assert_eq!(target.reservation_ids, vec![id]);
        assert_eq!(target.order_ref, "order-5");

        let release = Command::new(
            Uuid::new_v4(),
            CommandType::ReleaseReservation,
            serde_json::json!({ "reservation_ids": [id] }),
        );
        assert!(reconciliation_target(&release).is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_failed_reply() {
        let (engine, _, _) = setup().await;
        let command = Command::new(
            Uuid::new_v4(),
            CommandType::ConfirmReservation,
            serde_json::json!({ "order_ref": "missing ids" }),
        );
        let reply = apply_command(&engine, &command).await;
        assert_eq!(reply.status, CommandStatus::Failed);
        assert!(reply.error.unwrap().starts_with("Invalid payload"));
    }
}
