//! Mock estimation API server
//!
//! Serves the queue REST surface from the in-memory backend so the CLI can be
//! exercised end to end without the real service.
//!
//! Routes:
//! - POST /api/queue/{join,position,checkpoint,result,leave}
//! - GET  /api/queue/session
//! - GET  /api/clubs/{slug}/status, /api/clubs/{slug}/markers
//!
//! Usage:
//!   cargo run --bin mock_api -- --port 8000 --club berghain

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use queue_client::domain::types::{Coordinate, QueueOutcome, QueueType};
use queue_client::error::ApiError;
use queue_client::io::{EstimationClient, InMemoryEstimationClient, PositionReport};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mock_api")]
#[command(about = "In-memory queue estimation API for local runs")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Club slug to seed
    #[arg(long, default_value = "berghain")]
    club: String,
}

#[derive(Debug, Deserialize)]
struct JoinBody {
    #[serde(default = "default_club")]
    club_slug: String,
    #[serde(default)]
    queue_type: Option<QueueType>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

fn default_club() -> String {
    "berghain".to_string()
}

#[derive(Debug, Deserialize)]
struct CheckpointBody {
    marker_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    result: QueueOutcome,
}

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, body: Value) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn detail(status: StatusCode, message: &str) -> HttpResponse {
    respond(status, json!({ "detail": message }))
}

/// Status and detail text the real service uses for each failure
fn error_response(err: &ApiError) -> HttpResponse {
    match err {
        ApiError::AlreadyInQueue => detail(
            StatusCode::BAD_REQUEST,
            "You already have an active queue session. Leave or report result first.",
        ),
        ApiError::InvalidClub(_) => detail(StatusCode::NOT_FOUND, "Club not found"),
        ApiError::SessionNotFound => {
            detail(StatusCode::BAD_REQUEST, "No active queue session. Join the queue first.")
        }
        ApiError::MarkerNotFound => detail(StatusCode::NOT_FOUND, "Marker not found"),
        ApiError::Unauthorized => detail(StatusCode::UNAUTHORIZED, "Not authenticated"),
        ApiError::Server { status, detail: text } => {
            detail(StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), text)
        }
        ApiError::Network(_) | ApiError::InProgress(_) => {
            detail(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
    }
}

fn to_json<T: serde::Serialize>(result: Result<T, ApiError>) -> HttpResponse {
    match result.map(|v| serde_json::to_value(v)) {
        Ok(Ok(value)) => respond(StatusCode::OK, value),
        Ok(Err(e)) => detail(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        Err(e) => error_response(&e),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, HttpResponse> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| detail(StatusCode::BAD_REQUEST, &e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| detail(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()))
}

async fn handle_request(
    req: Request<Incoming>,
    backend: Arc<InMemoryEstimationClient>,
) -> Result<HttpResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::POST, ["api", "queue", "join"]) => match read_json::<JoinBody>(req).await {
            Ok(body) => {
                let coordinate = match (body.latitude, body.longitude) {
                    (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
                    _ => None,
                };
                let queue_type = body.queue_type.unwrap_or(QueueType::Main);
                to_json(backend.join(&body.club_slug, queue_type, coordinate).await)
            }
            Err(response) => response,
        },
        (&Method::GET, ["api", "queue", "session"]) => to_json(backend.fetch_session().await),
        (&Method::POST, ["api", "queue", "position"]) => {
            match read_json::<PositionReport>(req).await {
                Ok(report) => to_json(
                    backend
                        .report_position(report)
                        .await
                        .map(|()| json!({ "success": true, "message": "Position recorded" })),
                ),
                Err(response) => response,
            }
        }
        (&Method::POST, ["api", "queue", "checkpoint"]) => {
            match read_json::<CheckpointBody>(req).await {
                Ok(body) => to_json(backend.submit_checkpoint(body.marker_id).await),
                Err(response) => response,
            }
        }
        (&Method::POST, ["api", "queue", "result"]) => match read_json::<ResultBody>(req).await {
            Ok(body) => to_json(backend.submit_result(body.result).await),
            Err(response) => response,
        },
        (&Method::POST, ["api", "queue", "leave"]) => to_json(
            backend
                .leave_queue()
                .await
                .map(|()| json!({ "success": true, "message": "Left the queue" })),
        ),
        (&Method::GET, ["api", "clubs", slug, "status"]) => match backend.club_status(slug).await {
            Ok(Some(status)) => to_json(Ok(status)),
            Ok(None) => respond(
                StatusCode::OK,
                json!({ "message": "Status not available for this club" }),
            ),
            Err(e) => error_response(&e),
        },
        (&Method::GET, ["api", "clubs", slug, "markers"]) => to_json(backend.markers(slug).await),
        _ => detail(StatusCode::NOT_FOUND, "Not Found"),
    };

    info!(method = %method, path = %path, status = %response.status().as_u16(), "mock_api_request");
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let backend = Arc::new(InMemoryEstimationClient::seeded(&args.club));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %args.port, club = %args.club, "mock_api_started");

    let (shutdown_tx, mut shutdown) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let backend = backend.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let backend = backend.clone();
                                async move { handle_request(req, backend).await }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                warn!(peer = %peer, error = %e, "mock_api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "mock_api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mock_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
