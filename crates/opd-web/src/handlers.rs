//! HTTP处理器

use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::NaiveDate;
use opd_admin::FlowMonitor;
use opd_core::{ErrorKind, FlowError, Stage, StationKey};
use opd_workflow::{BroadcastSink, FlowOrchestrator};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<FlowOrchestrator>,
    pub monitor: Option<Arc<FlowMonitor>>,
    pub events: Option<Arc<BroadcastSink>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<FlowOrchestrator>) -> Self {
        Self {
            orchestrator,
            monitor: None,
            events: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<FlowMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// 开启事件流，广播端须同时挂在编排引擎的事件接收端上
    pub fn with_events(mut self, events: Arc<BroadcastSink>) -> Self {
        self.events = Some(events);
        self
    }
}

/// 接口错误
#[derive(Debug)]
pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }

        let body = Json(json!({
            "error": true,
            "kind": self.0.kind().as_str(),
            "code": self.0.code(),
            "message": self.0.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_stage(stage: &str) -> ApiResult<Stage> {
    Ok(stage.parse::<Stage>()?)
}

fn parse_station(stage: &str, id: u32) -> ApiResult<StationKey> {
    Ok(StationKey::new(parse_stage(stage)?, id))
}

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "OPD Flow API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "metrics": "/metrics",
            "api": "/api/v1",
            "events": "/api/v1/events"
        }
    }))
}

/// 健康检查处理器
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match &state.monitor {
        Some(monitor) => Json(json!(monitor.health())),
        None => Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    }
}

/// Prometheus 指标
pub async fn metrics(State(state): State<AppState>) -> Response {
    let Some(monitor) = &state.monitor else {
        return (StatusCode::NOT_FOUND, "metrics are disabled").into_response();
    };
    match monitor.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// 流程事件流（Server-Sent Events）
pub async fn stream_events(
    State(state): State<AppState>,
) -> std::result::Result<
    Sse<impl futures_util::Stream<Item = std::result::Result<SseEvent, Infallible>>>,
    Response,
> {
    let Some(events) = &state.events else {
        return Err((StatusCode::NOT_FOUND, "event stream is disabled").into_response());
    };
    let mut rx = events.subscribe();

    let event_stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event)
                        .unwrap_or_else(|_| "{}".to_string());
                    yield Ok(SseEvent::default().event(event.as_str()).data(payload));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged behind, {} events dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// 取号请求
#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    #[serde(alias = "uhid")]
    pub patient_id: String,
    #[serde(alias = "doctor")]
    pub doctor_id: String,
}

/// 取号
pub async fn admit_token(
    State(state): State<AppState>,
    Json(request): Json<AdmitRequest>,
) -> ApiResult<impl IntoResponse> {
    info!(
        "Admitting patient {} for doctor {}",
        request.patient_id, request.doctor_id
    );
    let admission = state
        .orchestrator
        .admit(&request.patient_id, &request.doctor_id)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": admission.token.id.number,
            "date": admission.token.id.date,
            "issued_at": admission.token.issued_at,
            "assigned_station": admission.station,
            "position": admission.position,
            "patient_id": admission.token.patient_id,
            "doctor_id": admission.token.doctor_id
        })),
    ))
}

/// 阶段排队列表
pub async fn list_stage_queue(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let stage = parse_stage(&stage)?;
    let entries = state.orchestrator.list_stage_queue(stage).await?;
    Ok(Json(json!({
        "stage": stage,
        "entries": entries,
        "total": entries.len()
    })))
}

/// 阶段工位列表
pub async fn list_stations(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let stage = parse_stage(&stage)?;
    let stations = state.orchestrator.list_stations(stage).await?;
    Ok(Json(json!({
        "stage": stage,
        "stations": stations,
        "total": stations.len()
    })))
}

/// 新增工位请求
#[derive(Debug, Default, Deserialize)]
pub struct AddStationRequest {
    pub location: Option<String>,
    pub doctor_id: Option<String>,
}

/// 新增工位
pub async fn add_station(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    Json(request): Json<AddStationRequest>,
) -> ApiResult<impl IntoResponse> {
    let stage = parse_stage(&stage)?;
    let summary = state
        .orchestrator
        .add_station(stage, request.location, request.doctor_id)
        .await?;
    Ok((StatusCode::CREATED, Json(json!(summary))))
}

/// 工位队列
pub async fn station_queue(
    State(state): State<AppState>,
    Path((stage, id)): Path<(String, u32)>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_station(&stage, id)?;
    let queue = state.orchestrator.snapshot(key).await?;
    Ok(Json(json!({
        "station": key,
        "queue": queue,
        "total": queue.len()
    })))
}

/// 号码请求，未指定日期时取当天
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: u32,
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

/// 报到
pub async fn report_at_station(
    State(state): State<AppState>,
    Path((stage, id)): Path<(String, u32)>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_station(&stage, id)?;
    let token = state.orchestrator.token_id(request.token, request.date);
    let outcome = state.orchestrator.report_at_station(key, token).await?;
    Ok(Json(json!(outcome)))
}

/// 完成
pub async fn finish_at_station(
    State(state): State<AppState>,
    Path((stage, id)): Path<(String, u32)>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_station(&stage, id)?;
    let token = state.orchestrator.token_id(request.token, request.date);
    let outcome = state.orchestrator.finish_at_station(key, token).await?;
    Ok(Json(json!(outcome)))
}

/// 启用工位
pub async fn enable_station(
    State(state): State<AppState>,
    Path((stage, id)): Path<(String, u32)>,
) -> ApiResult<impl IntoResponse> {
    set_station_active(state, &stage, id, true).await
}

/// 停用工位
pub async fn disable_station(
    State(state): State<AppState>,
    Path((stage, id)): Path<(String, u32)>,
) -> ApiResult<impl IntoResponse> {
    set_station_active(state, &stage, id, false).await
}

async fn set_station_active(
    state: AppState,
    stage: &str,
    id: u32,
    active: bool,
) -> ApiResult<Json<serde_json::Value>> {
    let key = parse_station(stage, id)?;
    let transition = state.orchestrator.set_station_active(key, active).await?;
    Ok(Json(json!({
        "station": key,
        "transition": transition,
        "status": transition.status()
    })))
}

/// 删除工位
pub async fn remove_station(
    State(state): State<AppState>,
    Path((stage, id)): Path<(String, u32)>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_station(&stage, id)?;
    let removal = state.orchestrator.remove_station(key).await?;
    Ok(Json(json!({
        "station": key,
        "result": removal
    })))
}

/// 医生列表
pub async fn list_doctors(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let doctors = state.orchestrator.list_doctors().await?;
    Ok(Json(json!({
        "doctors": doctors,
        "total": doctors.len()
    })))
}

/// 启用医生
pub async fn enable_doctor(
    State(state): State<AppState>,
    Path(doctor_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let change = state.orchestrator.set_doctor_active(&doctor_id, true).await?;
    Ok(Json(json!(change)))
}

/// 停用医生
pub async fn disable_doctor(
    State(state): State<AppState>,
    Path(doctor_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let change = state.orchestrator.set_doctor_active(&doctor_id, false).await?;
    Ok(Json(json!(change)))
}

/// 患者列表
pub async fn list_patients(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let patients = state.orchestrator.list_patients().await?;
    Ok(Json(json!({
        "patients": patients,
        "total": patients.len()
    })))
}

/// 患者详情
pub async fn get_patient(
    State(state): State<AppState>,
    Path(uhid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let patient = state.orchestrator.get_patient(&uhid).await?;
    Ok(Json(json!(patient)))
}
