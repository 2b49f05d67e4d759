use anyhow::Result;
use clap::Parser;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use inventory_service::{api, clock::SystemClock, config::Args, engine::ReservationEngine, handlers, store::PgStockStore, sweeper::ExpirySweeper};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inventory_service=info,tower_http=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
    let args = Args::parse();

    // Run migrations first
    info!("Running database migrations...");
    inventory_service::run_migrations(&args.database_url)?;
    info!("Migrations completed successfully");

    let config = diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = Pool::builder().build(config).await?;

    let engine = Arc::new(ReservationEngine::new(
        PgStockStore::new(pool.clone()),
        Arc::new(SystemClock),
        args.engine_config(),
    ));

    let sweeper = ExpirySweeper::new(engine.clone(), args.sweep_interval());
    tokio::spawn(async move {
        sweeper.run().await;
    });

    match &args.kafka_brokers {
        Some(brokers) => {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()?;

            let consumer: StreamConsumer = ClientConfig::new()
                .set("group.id", "inventory-service")
                .set("bootstrap.servers", brokers)
                .set("enable.partition.eof", "false")
                .set("session.timeout.ms", "6000")
                .set("enable.auto.commit", "false")
                .create()?;
            consumer.subscribe(&[&args.command_topic])?;

            let command_handler = handlers::CommandHandler::new(engine.clone(), pool.clone(), producer, args.reply_topic.clone());
            tokio::spawn(async move {
                command_handler.run(consumer).await;
            });
            info!(topic = %args.command_topic, "Payment command consumer started");
        }
        None => warn!("KAFKA_BROKERS not set, payment command consumer disabled"),
    }

    let app = api::create_router(engine);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Inventory service web server started on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
