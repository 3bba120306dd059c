//! HTTP boundary: the axum app, request buffering with the body-size
//! cap, and the translation of runtime outcomes into wire responses.
//! The dispatcher catches everything — a handler failure never unwinds
//! past this layer.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::FluxionConfig;
use crate::error::WorkerError;
use crate::meta;
use crate::protocol::{HeaderValues, ResponsePayload};
use crate::runtime::{FileRuntime, IncomingRequest, RuntimeError, ServeOutcome};
use crate::static_files::StaticFileReply;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<FileRuntime>,
    pub max_request_bytes: u64,
}

/// Assemble the router: meta endpoints plus the dynamic fallback.
pub fn build_app(runtime: Arc<FileRuntime>, max_request_bytes: u64) -> Router {
    let state = AppState {
        runtime,
        max_request_bytes,
    };
    Router::new()
        .route("/_fluxion/routes", get(meta::routes))
        .route("/_fluxion/healthz", get(meta::healthz))
        .route("/_fluxion/workers", get(meta::workers))
        .fallback(dynamic_request)
        .with_state(state)
}

/// Bind and serve until ctrl-c, then close the runtime.
pub async fn run(config: FluxionConfig) -> anyhow::Result<()> {
    let runtime = FileRuntime::new(&config).await?;
    let app = build_app(runtime.clone(), config.max_request_bytes);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 listening on http://{}", listener.local_addr()?);

    let compression = CompressionLayer::new().gzip(true).br(true);
    let mut stacked = app.layer(TraceLayer::new_for_http()).layer(compression);
    if env::var("CORS_PERMISSIVE").is_ok() {
        stacked = stacked.layer(CorsLayer::permissive());
    }

    axum::serve(
        listener,
        stacked.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    runtime.close();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
}

async fn dynamic_request(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());
    let ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let bytes = match axum::body::to_bytes(body, state.max_request_bytes as usize).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({
                    "message": format!(
                        "request body too large (limit {} bytes)",
                        state.max_request_bytes
                    )
                }),
            )
        }
    };

    let incoming = IncomingRequest {
        method: method.clone(),
        path,
        url: url.clone(),
        headers: collect_headers(&parts.headers),
        body: bytes,
        ip,
    };

    match state.runtime.serve(incoming).await {
        Ok(ServeOutcome::Handler(payload)) => handler_response(payload),
        Ok(ServeOutcome::Static(reply)) => static_response(reply),
        Ok(ServeOutcome::NotFound) => json_response(
            StatusCode::NOT_FOUND,
            json!({
                "message": "Route not found",
                "method": method.as_str(),
                "url": url,
            }),
        ),
        Err(err) => error_response(err),
    }
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, HeaderValues)> {
    let mut out = Vec::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        match values.len() {
            0 => {}
            1 => out.push((
                name.as_str().to_string(),
                HeaderValues::Single(values.into_iter().next().expect("checked len")),
            )),
            _ => out.push((name.as_str().to_string(), HeaderValues::Multi(values))),
        }
    }
    out
}

fn handler_response(payload: ResponsePayload) -> Response {
    let status = StatusCode::from_u16(payload.status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::builder().status(status);
    for (name, value) in &payload.headers {
        // hyper recomputes the framing headers from the actual body.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        response = response.header(name, value);
    }
    let body = payload.body.map(Body::from).unwrap_or_else(Body::empty);
    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn static_response(reply: StaticFileReply) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::try_from(reply.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, reply.content_length.into());

    let body = match reply.file {
        Some(file) => Body::from_stream(ReaderStream::new(file)),
        None => Body::empty(),
    };
    (headers, body).into_response()
}

fn error_response(err: RuntimeError) -> Response {
    match err {
        RuntimeError::Load(_) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "message": "Internal Server Error" }),
        ),
        RuntimeError::Handler(payload) => match payload.code {
            // Coded failures describe the limit that was hit.
            Some(code) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": payload.message, "code": code.as_str() }),
            ),
            None => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": "Internal Server Error", "error": payload.name }),
            ),
        },
        RuntimeError::Worker(worker_err) => {
            let status = match &worker_err {
                WorkerError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
                WorkerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let mut body = json!({ "message": worker_err.to_string() });
            if let Some(code) = worker_err.code() {
                body["code"] = json!(code.as_str());
            }
            json_response(status, body)
        }
        RuntimeError::Io(io_err) => {
            error!("i/o error while serving request: {io_err}");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": "Internal Server Error" }),
            )
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}
