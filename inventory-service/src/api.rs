use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use crate::engine::*;
use crate::error::EngineError;
use crate::models::{NewVariantStock, Reservation, ReservationCounts, ReservationStatus, StockMovement};
use crate::store::StockStore;

pub struct AppState<S: StockStore> {
    pub engine: Arc<ReservationEngine<S>>,
}

impl<S: StockStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone() }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub variant_id: Uuid,
    pub quantity: i32,
    pub hold_minutes: Option<i64>,
    pub cart_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub additional_minutes: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub order_ref: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub delta: i32,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct MovementsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReservationResponse {
    pub reservation: Reservation,
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{} not found", what))
    }

    fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Invalid(msg) => Self::new(StatusCode::BAD_REQUEST, "invalid_request", msg),
            EngineError::Store(e) if e.is_unique_violation() => {
                Self::conflict("already_exists", "a variant with this id or sku already exists")
            }
            EngineError::Store(e) => {
                tracing::error!(error = %e, "Inventory request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

fn terminal(status: ReservationStatus) -> ApiError {
    ApiError::conflict("already_terminal", format!("reservation is already {}", status))
}

pub fn create_router<S: StockStore>(engine: Arc<ReservationEngine<S>>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/variants", post(register_variant::<S>))
        .route("/variants/:id", get(get_variant::<S>))
        .route("/variants/:id/movements", get(list_movements::<S>))
        .route("/variants/:id/adjust", post(adjust_variant::<S>))
        .route("/reservations", post(create_reservation::<S>))
        .route("/reservations/:id", get(get_reservation::<S>))
        .route("/reservations/:id/extend", post(extend_reservation::<S>))
        .route("/reservations/:id/confirm", post(confirm_reservation::<S>))
        .route("/reservations/:id/release", post(release_reservation::<S>))
        .route("/reservations/:id/cancel", post(cancel_reservation::<S>))
        .route("/maintenance/cleanup", post(run_cleanup::<S>))
        .route("/maintenance/status", get(cleanup_status::<S>))
        .with_state(AppState { engine })
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

async fn register_variant<S: StockStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<NewVariantStock>,
) -> Result<(StatusCode, Json<StockSnapshot>), ApiError> {
    let snapshot = state.engine.register_variant(request).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_variant<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(variant_id): Path<Uuid>,
) -> Result<Json<StockSnapshot>, ApiError> {
    state
        .engine
        .stock(variant_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("variant"))
}

async fn list_movements<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(variant_id): Path<Uuid>,
    Query(query): Query<MovementsQuery>,
) -> Result<Json<Vec<StockMovement>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(state.engine.movements(variant_id, limit).await?))
}

async fn adjust_variant<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(variant_id): Path<Uuid>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<StockSnapshot>, ApiError> {
    match state.engine.adjust_on_hand(variant_id, request.delta, request.reason).await? {
        AdjustOutcome::Adjusted(snapshot) => Ok(Json(snapshot)),
        AdjustOutcome::NotFound => Err(ApiError::not_found("variant")),
        AdjustOutcome::BelowReserved { on_hand, reserved } => Err(ApiError::conflict(
            "below_reserved",
            format!("on hand {} cannot drop below the {} units currently reserved", on_hand, reserved),
        )),
        AdjustOutcome::OutOfRange { on_hand } => Err(ApiError::conflict(
            "out_of_range",
            format!("adjusting on hand {} by {} is out of range", on_hand, request.delta),
        )),
    }
}

async fn create_reservation<S: StockStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    let outcome = state
        .engine
        .reserve(request.variant_id, request.quantity, request.hold_minutes, request.cart_ref)
        .await?;
    match outcome {
        ReserveOutcome::Reserved(reservation) => Ok((StatusCode::CREATED, Json(reservation))),
        ReserveOutcome::NotFound => Err(ApiError::not_found("variant")),
        ReserveOutcome::Inactive => Err(ApiError::conflict("inactive", "this item is no longer available")),
        ReserveOutcome::InsufficientStock { available, .. } => Err(ApiError::conflict(
            "insufficient_stock",
            format!("not enough available, reduce quantity (only {} left)", available),
        )),
    }
}

async fn get_reservation<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reservation>, ApiError> {
    state
        .engine
        .reservation(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("reservation"))
}

async fn extend_reservation<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<Reservation>, ApiError> {
    match state.engine.extend(id, request.additional_minutes).await? {
        ExtendOutcome::Extended(reservation) => Ok(Json(reservation)),
        ExtendOutcome::NotFound => Err(ApiError::not_found("reservation")),
        ExtendOutcome::NotActive(ReservationStatus::Expired) => Err(ApiError::conflict(
            "expired",
            "your hold expired, please re-add to cart",
        )),
        ExtendOutcome::NotActive(status) => Err(ApiError::conflict(
            "not_active",
            format!("reservation is {}", status),
        )),
    }
}

async fn confirm_reservation<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ReservationResponse>, ApiError> {
    match state.engine.confirm(id, request.order_ref).await? {
        ConfirmOutcome::Confirmed { reservation, replayed } => Ok(Json(ReservationResponse { reservation, replayed })),
        ConfirmOutcome::NotFound => Err(ApiError::not_found("reservation")),
        ConfirmOutcome::Expired => Err(ApiError::conflict("expired", "your hold expired, please re-add to cart")),
        ConfirmOutcome::AlreadyTerminal(status) => Err(terminal(status)),
    }
}

async fn release_reservation<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    request: Option<Json<ReleaseRequest>>,
) -> Result<Json<ReservationResponse>, ApiError> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "released".to_string());
    release_response(state.engine.release(id, reason).await?)
}

async fn cancel_reservation<S: StockStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReservationResponse>, ApiError> {
    release_response(state.engine.cancel(id).await?)
}

fn release_response(outcome: ReleaseOutcome) -> Result<Json<ReservationResponse>, ApiError> {
    match outcome {
        ReleaseOutcome::Released { reservation, replayed } => Ok(Json(ReservationResponse { reservation, replayed })),
        ReleaseOutcome::NotFound => Err(ApiError::not_found("reservation")),
        ReleaseOutcome::AlreadyTerminal(status) => Err(terminal(status)),
    }
}

async fn run_cleanup<S: StockStore>(State(state): State<AppState<S>>) -> Result<Json<SweepReport>, ApiError> {
    let now = state.engine.now();
    Ok(Json(state.engine.sweep_expired(now).await?))
}

async fn cleanup_status<S: StockStore>(State(state): State<AppState<S>>) -> Result<Json<ReservationCounts>, ApiError> {
    Ok(Json(state.engine.status().await?))
}
