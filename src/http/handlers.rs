//! Handlers for the governed API surface.
//!
//! Governance has already run by the time a handler is reached, so each
//! one only does the domain work and reports its own failures through the
//! [`ErrorHandler`](crate::errors::ErrorHandler).

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{ApiError, ErrorType, ServiceError};
use crate::extensions::{EventPayload, EventType, Recommendation, ServiceEvent};
use crate::gate::Admitted;
use crate::http::middleware::Caller;
use crate::lifecycle::Services;
use crate::quota::QuotaStatus;
use crate::security::signed_url::{SignedUrl, SignedUrlRequest};

type HandlerResult<T> = Result<T, ApiError>;

/// Feature flag required for HD output.
pub const HD_OUTPUT_FEATURE: &str = "hd_output";

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub rate_limit_entries: usize,
    pub hooks: usize,
}

pub async fn health(State(services): State<Services>) -> Json<HealthStatus> {
    Json(HealthStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "ok",
        rate_limit_entries: services.limiter.entry_count(),
        hooks: services.extensions.hook_count(),
    })
}

fn require_user(services: &Services, caller: &Caller) -> HandlerResult<String> {
    caller.user_id.clone().ok_or_else(|| {
        services.errors.handle(
            &ServiceError::new(ErrorType::Authentication, "authentication_required"),
            caller.error_context(),
        )
    })
}

fn parse_body<T>(
    services: &Services,
    caller: &Caller,
    payload: Result<Json<T>, JsonRejection>,
) -> HandlerResult<T> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        services
            .errors
            .handle_error(&rejection, ErrorType::Validation, caller.error_context())
    })
}

fn file_event(event_type: EventType, caller: &Caller, user_id: &str, path: &str) -> ServiceEvent {
    let file_id = path.rsplit('/').next().unwrap_or(path).to_string();
    let event = ServiceEvent::new(
        event_type,
        "http",
        EventPayload::File {
            user_id: user_id.to_string(),
            file_id,
            path: path.to_string(),
        },
    );
    match &caller.request_id {
        Some(request_id) => event.with_request_id(request_id.clone()),
        None => event,
    }
}

/// Issue a signed URL for the caller.
///
/// The URL is always issued to the authenticated user. Bindings enabled in
/// config default to the caller's own IP and user agent.
pub async fn create_signed_url(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    payload: Result<Json<SignedUrlRequest>, JsonRejection>,
) -> HandlerResult<(StatusCode, Json<SignedUrl>)> {
    let user_id = require_user(&services, &caller)?;
    let mut request = parse_body(&services, &caller, payload)?;
    request.user_id = Some(user_id.clone());

    let config = &services.config.signed_urls;
    if config.bind_ip && request.ip_address.is_none() {
        request.ip_address = Some(caller.client_ip.clone());
    }
    if config.bind_user_agent && request.user_agent.is_none() {
        request.user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let signed = services
        .signed_urls
        .generate_signed_url(&request)
        .map_err(|e| services.errors.handle_classified(&e, caller.error_context()))?;

    services.emit(file_event(EventType::FileShared, &caller, &user_id, &signed.path));
    Ok((StatusCode::CREATED, Json(signed)))
}

pub async fn quota_status(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
) -> HandlerResult<Json<QuotaStatus>> {
    let user_id = require_user(&services, &caller)?;
    let status = services
        .quota
        .quota_status(&user_id)
        .await
        .map_err(|e| services.errors.handle_classified(&e, caller.error_context()))?;
    Ok(Json(status))
}

pub async fn recommendations(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
) -> HandlerResult<Json<Vec<Recommendation>>> {
    let user_id = require_user(&services, &caller)?;
    Ok(Json(services.recommendations.recommendations_for(&user_id)))
}

#[derive(Debug, Serialize)]
pub struct FileAccess {
    pub path: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Serve a protected file. Reaching this handler means the signed URL held.
pub async fn download_file(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
    Extension(admitted): Extension<Admitted>,
    Path(_file): Path<String>,
) -> HandlerResult<Json<FileAccess>> {
    let Some(validated) = admitted.signed_url else {
        return Err(services.errors.handle(
            &ServiceError::new(ErrorType::Authorization, "missing_signature"),
            caller.error_context(),
        ));
    };

    let user_id = validated.user_id.clone().or_else(|| caller.user_id.clone());
    if let Some(user_id) = &user_id {
        services.emit(file_event(EventType::FileDownloaded, &caller, user_id, &validated.path));
    }

    Ok(Json(FileAccess {
        path: validated.path,
        method: validated.method,
        user_id,
        expires_at: validated.expires_at,
        metadata: validated.metadata,
    }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionRequest {
    pub input_format: String,
    pub output_format: String,
    #[serde(default)]
    pub file_size_bytes: u64,
    #[serde(default)]
    pub hd_output: bool,
}

#[derive(Debug, Serialize)]
pub struct ConversionAccepted {
    pub conversion_id: String,
    pub status: &'static str,
}

fn require_formats(
    services: &Services,
    caller: &Caller,
    input_format: &str,
    output_format: &str,
) -> HandlerResult<()> {
    for (field, value) in [("input_format", input_format), ("output_format", output_format)] {
        if value.trim().is_empty() {
            return Err(services.errors.handle(
                &ServiceError::validation(format!("{field} is required")),
                caller.error_context(),
            ));
        }
    }
    Ok(())
}

/// Tie a conversion event to its job and, when known, the request.
fn correlate(event: ServiceEvent, caller: &Caller, conversion_id: &str) -> ServiceEvent {
    let event = event.with_correlation_id(conversion_id);
    match &caller.request_id {
        Some(request_id) => event.with_request_id(request_id.clone()),
        None => event,
    }
}

/// Accept a conversion job. Quota was charged by the middleware.
pub async fn create_conversion(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<ConversionRequest>, JsonRejection>,
) -> HandlerResult<(StatusCode, Json<ConversionAccepted>)> {
    let user_id = require_user(&services, &caller)?;
    let request = parse_body(&services, &caller, payload)?;
    require_formats(&services, &caller, &request.input_format, &request.output_format)?;

    if request.hd_output {
        let allowed = services
            .quota
            .check_feature_access(&user_id, HD_OUTPUT_FEATURE)
            .await
            .map_err(|e| services.errors.handle_classified(&e, caller.error_context()))?;
        if !allowed {
            return Err(services.errors.handle(
                &ServiceError::new(
                    ErrorType::Authorization,
                    format!("feature '{HD_OUTPUT_FEATURE}' is not available on this plan"),
                ),
                caller.error_context(),
            ));
        }
    }

    let conversion_id = Uuid::new_v4().to_string();
    let event = ServiceEvent::new(
        EventType::ConversionRequested,
        "http",
        EventPayload::Conversion {
            user_id,
            conversion_id: conversion_id.clone(),
            input_format: request.input_format.to_lowercase(),
            output_format: request.output_format.to_lowercase(),
            file_size_bytes: request.file_size_bytes,
            duration_ms: None,
            error: None,
        },
    );
    services.emit(correlate(event, &caller, &conversion_id));

    tracing::info!(%conversion_id, "Conversion accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(ConversionAccepted {
            conversion_id,
            status: "queued",
        }),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionOutcome {
    Completed,
    Failed,
}

/// Outcome reported by the conversion worker for a queued job.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversionResult {
    pub status: ConversionOutcome,
    pub input_format: String,
    pub output_format: String,
    #[serde(default)]
    pub file_size_bytes: u64,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Record the outcome of a conversion on behalf of the job's owner.
pub async fn report_conversion_result(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
    Path(conversion_id): Path<String>,
    payload: Result<Json<ConversionResult>, JsonRejection>,
) -> HandlerResult<StatusCode> {
    let user_id = require_user(&services, &caller)?;
    let result = parse_body(&services, &caller, payload)?;
    require_formats(&services, &caller, &result.input_format, &result.output_format)?;

    let (event_type, error) = match result.status {
        ConversionOutcome::Completed => (EventType::ConversionCompleted, None),
        ConversionOutcome::Failed => (
            EventType::ConversionFailed,
            Some(result.error.unwrap_or_else(|| "conversion failed".to_string())),
        ),
    };
    let event = ServiceEvent::new(
        event_type,
        "http",
        EventPayload::Conversion {
            user_id,
            conversion_id: conversion_id.clone(),
            input_format: result.input_format.to_lowercase(),
            output_format: result.output_format.to_lowercase(),
            file_size_bytes: result.file_size_bytes,
            duration_ms: result.duration_ms,
            error,
        },
    );
    services.emit(correlate(event, &caller, &conversion_id));

    tracing::info!(%conversion_id, %event_type, "Conversion result recorded");
    Ok(StatusCode::NO_CONTENT)
}

/// Forward a third-party notification to hooks subscribed to webhooks.
pub async fn receive_webhook(
    State(services): State<Services>,
    Extension(caller): Extension<Caller>,
    Path(source): Path<String>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> HandlerResult<StatusCode> {
    let body = parse_body(&services, &caller, payload)?;
    let mut event = ServiceEvent::new(EventType::Webhook, format!("webhook:{source}"), EventPayload::Webhook(body));
    if let Some(request_id) = &caller.request_id {
        event = event.with_request_id(request_id.clone());
    }
    services.emit(event);
    Ok(StatusCode::ACCEPTED)
}
