//! HTTP/JSON surface. Each handler maps one request onto one engine call.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, parse_id};
use crate::model::*;
use crate::observability::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL, route_label};
use crate::validate::Violation;

type ApiResult<T> = Result<T, EngineError>;

pub fn router(engine: Arc<Engine>) -> Router {
    // `/patients/{key}` is a sort number for PUT/DELETE and a patient id
    // under `/reservations`; the router needs one parameter name per segment.
    Router::new()
        .route("/health", get(health))
        .route("/patients", get(find_patients).post(create_patient))
        .route(
            "/patients/{key}",
            put(update_patient).delete(delete_patient),
        )
        .route("/patients/{key}/reservations", get(patient_reservations))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/schedules/{id}/reservations", get(schedule_reservations))
        .route("/reservations", post(create_reservation))
        .route(
            "/reservations/{id}",
            get(get_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(engine)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = route_label(req.extensions().get::<MatchedPath>().map(MatchedPath::as_str));
    let method = req.method().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}

// ── Responses ────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
    pub message: String,
}

impl Ack {
    fn success(message: String) -> Json<Self> {
        Json(Self {
            status: "success".into(),
            message,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<ViolationBody>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ViolationBody {
    pub field: String,
    pub message: String,
}

impl From<&Violation> for ViolationBody {
    fn from(v: &Violation) -> Self {
        Self {
            field: v.field.to_string(),
            message: v.message.clone(),
        }
    }
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(..) => StatusCode::NOT_FOUND,
        EngineError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::CapacityExceeded { .. }
        | EngineError::InvalidTransition { .. }
        | EngineError::AlreadyExists(_)
        | EngineError::ScheduleInUse(_) => StatusCode::CONFLICT,
        EngineError::Contention(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::MalformedIdentifier(_) => StatusCode::BAD_REQUEST,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        } else {
            tracing::debug!("request rejected: {self}");
        }
        let violations = match &self {
            EngineError::ValidationFailed(v) => Some(v.iter().map(ViolationBody::from).collect()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            violations,
        };
        (status, Json(body)).into_response()
    }
}

// ── Extractors ───────────────────────────────────────────────────

/// `Json` whose rejections come back as `ValidationFailed` in the usual
/// error body, e.g. an unknown reservation status.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(body_violation(&rejection)),
        }
    }
}

fn body_violation(rejection: &JsonRejection) -> EngineError {
    EngineError::ValidationFailed(vec![Violation {
        field: "body",
        message: rejection.body_text(),
    }])
}

/// `Query` whose rejections are `MalformedIdentifier`: the only query
/// parameter the API takes is a lookup key.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => {
                tracing::debug!("query rejected: {}", rejection.body_text());
                let raw = parts.uri.query().unwrap_or_default();
                Err(EngineError::MalformedIdentifier(raw.to_string()))
            }
        }
    }
}

fn sort_number(raw: &str) -> ApiResult<i64> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::MalformedIdentifier(raw.to_string()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ── Patients ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PatientQuery {
    sort_number: Option<i64>,
}

async fn create_patient(
    State(engine): State<Arc<Engine>>,
    ApiJson(body): ApiJson<NewPatient>,
) -> ApiResult<(StatusCode, Json<Patient>)> {
    let patient = engine.create_patient(body).await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

async fn find_patients(
    State(engine): State<Arc<Engine>>,
    ApiQuery(query): ApiQuery<PatientQuery>,
) -> ApiResult<Json<Vec<Patient>>> {
    Ok(Json(engine.find_patients(query.sort_number).await?))
}

async fn update_patient(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
    ApiJson(patch): ApiJson<PatientPatch>,
) -> ApiResult<Json<Patient>> {
    Ok(Json(engine.update_patient(sort_number(&key)?, patch).await?))
}

async fn delete_patient(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Ack>> {
    let n = sort_number(&key)?;
    engine.delete_patient(n).await?;
    Ok(Ack::success(format!("patient with sort_number {n} deleted")))
}

async fn patient_reservations(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<Reservation>>> {
    Ok(Json(engine.list_reservations_by_patient(parse_id(&key)?).await?))
}

// ── Schedules ────────────────────────────────────────────────────

async fn create_schedule(
    State(engine): State<Arc<Engine>>,
    ApiJson(body): ApiJson<NewSchedule>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let schedule = engine.create_schedule(body).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn list_schedules(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(engine.list_schedules().await?))
}

async fn get_schedule(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(engine.get_schedule(parse_id(&id)?).await?))
}

async fn update_schedule(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<SchedulePatch>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(engine.update_schedule(parse_id(&id)?, patch).await?))
}

async fn delete_schedule(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Ack>> {
    let id = parse_id(&id)?;
    engine.delete_schedule(id).await?;
    Ok(Ack::success(format!("schedule {id} deleted")))
}

async fn schedule_reservations(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Reservation>>> {
    Ok(Json(engine.list_reservations_by_schedule(parse_id(&id)?).await?))
}

// ── Reservations ─────────────────────────────────────────────────

async fn create_reservation(
    State(engine): State<Arc<Engine>>,
    ApiJson(body): ApiJson<NewReservation>,
) -> ApiResult<(StatusCode, Json<Reservation>)> {
    let reservation = engine.create_reservation(body).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

async fn get_reservation(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(engine.get_reservation(parse_id(&id)?).await?))
}

async fn update_reservation(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<ReservationUpdate>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(engine.update_reservation(parse_id(&id)?, update).await?))
}

async fn delete_reservation(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Ack>> {
    let id: Ulid = parse_id(&id)?;
    engine.delete_reservation(id).await?;
    Ok(Ack::success(format!("reservation {id} deleted")))
}
