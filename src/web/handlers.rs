//! HTTP request handlers.

use super::AppState;
use crate::db::{DataTargetKind, DbError, DeliveryLogEntry, DeviceType};
use crate::envelope::{DecodedPayloadEnvelope, RawUplinkEnvelope, Topic};
use crate::ingest::IngestError;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct ApiKeyQuery {
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
}

/// Error body in the shape existing device integrations already parse.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "statusCode": status.as_u16(), "message": message.into() })),
    )
        .into_response()
}

fn ingest_error_response(e: IngestError) -> Response {
    let status = match &e {
        IngestError::InvalidApiKey => StatusCode::FORBIDDEN,
        IngestError::DeviceTypeMismatch { .. } => StatusCode::BAD_REQUEST,
        IngestError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        IngestError::Bus(_) | IngestError::Db(_) => {
            tracing::error!("Uplink could not be queued: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    error_response(status, e.to_string())
}

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => error_response(StatusCode::NOT_FOUND, "Not found"),
        e => {
            tracing::error!("Database error: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ============================================================================
// Ingestion
// ============================================================================

pub async fn handle_receive_data(
    State(state): State<AppState>,
    Query(query): Query<ApiKeyQuery>,
    body: Bytes,
) -> Response {
    let api_key = query.api_key.unwrap_or_default();
    match state.ingest.receive_generic_http(&api_key, &body) {
        Ok(delivery) => {
            tracing::debug!(partition = delivery.partition, offset = delivery.offset, "Accepted HTTP uplink");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ingest_error_response(e),
    }
}

pub async fn handle_sigfox_uplink(
    State(state): State<AppState>,
    Query(query): Query<ApiKeyQuery>,
    body: Bytes,
) -> Response {
    let api_key = query.api_key.unwrap_or_default();
    match state.ingest.receive_sigfox(&api_key, &body) {
        Ok(accepted) => match accepted.downlink {
            Some(downlink) => (StatusCode::OK, Json(downlink)).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(e) => ingest_error_response(e),
    }
}

// ============================================================================
// Decoder test endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPayloadDecoderRequest {
    pub code: String,
    pub iot_device_json_string: String,
    pub raw_payload_json_string: String,
}

pub async fn handle_test_payload_decoder(
    State(state): State<AppState>,
    req: Result<Json<TestPayloadDecoderRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match req {
        Ok(req) => req,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    match state
        .executor
        .execute_json_strings(&req.code, &req.iot_device_json_string, &req.raw_payload_json_string)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, format!("Got error: {}", e)),
    }
}

// ============================================================================
// Diagnostic bus injection
// ============================================================================

/// A Chirpstack-style LoRa uplink used when injecting raw requests by hand.
fn sample_lora_payload() -> Value {
    json!({
        "data": "AQEXAjEEAIsFCAcOPQ==",
        "freq": 867100000,
        "chan": 3,
        "tmst": 71333956,
        "utmms": 1597675976328i64,
        "rfch": 0,
        "stat": 1,
        "rssi": -39,
        "size": 26,
        "modu": "LORA",
        "datr": "SF12BW125",
        "codr": "4/5",
        "lsnr": 12
    })
}

pub async fn handle_inject_raw(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let device_type = match state.store.get_device(id) {
        Ok(device) => device.device_type(),
        Err(DbError::NotFound) => DeviceType::Lorawan,
        Err(e) => return db_error_response(e),
    };

    let envelope = RawUplinkEnvelope {
        device_id: id,
        raw_payload: sample_lora_payload(),
        device_type,
        unix_timestamp: Utc::now().timestamp_millis(),
    };
    match state.bus.publish(Topic::RawRequest, &envelope.key(), &envelope) {
        Ok(_) => {
            tracing::info!(device_id = id, "Injected raw request");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ingest_error_response(e.into()),
    }
}

pub async fn handle_inject_transformed(State(state): State<AppState>) -> Response {
    let envelope = DecodedPayloadEnvelope {
        device_id: 1,
        payload_decoder_id: None,
        payload: json!({ "test": 123 }),
    };
    match state
        .bus
        .publish(Topic::TransformedRequest, &envelope.key(), &envelope)
    {
        Ok(_) => {
            tracing::info!("Injected transformed payload");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ingest_error_response(e.into()),
    }
}

// ============================================================================
// Data targets
// ============================================================================

pub async fn handle_test_connection(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let target = match state.store.get_data_target(id) {
        Ok(target) => target,
        Err(e) => return db_error_response(e),
    };

    let DataTargetKind::Mqtt(config) = &target.kind else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Connection test is not supported for {} targets", target.target_type().as_str()),
        );
    };

    match state.senders.mqtt().test_connection(config).await {
        Ok(()) => Json(json!({ "status": "OK" })).into_response(),
        Err(e) => {
            tracing::info!(target_id = id, "MQTT connection test failed: {}", e);
            Json(json!({ "status": "ERROR", "message": e.to_string() })).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogView {
    pub data_target_id: i64,
    pub has_recent_error: bool,
    pub entries: Vec<DeliveryLogEntry>,
}

pub async fn handle_delivery_log(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(e) = state.store.get_data_target(id) {
        return db_error_response(e);
    }

    let since = Utc::now() - ChronoDuration::hours(24);
    let view = state.store.list_delivery_log(id).and_then(|entries| {
        let recent = state.store.targets_with_recent_error(&[id], since)?;
        Ok(DeliveryLogView {
            data_target_id: id,
            has_recent_error: recent.contains(&id),
            entries,
        })
    });

    match view {
        Ok(view) => Json(view).into_response(),
        Err(e) => db_error_response(e),
    }
}
