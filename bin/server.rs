// Refugio Registry - Upload API Server
// Receives CSV submissions and exposes upload history + occupancy stats

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use refugio_registry::{
    get_refugio_stats, get_refugios, get_upload, get_upload_history, open_database,
    is_csv_upload, IngestionPipeline, UploadError, MAX_UPLOAD_BYTES,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

/// Error payload for rejected or failed uploads
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<String>>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    fn with_details(error: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details),
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/upload - CSV bulk upload
///
/// Multipart fields: file (the CSV), refugio_id, usuario_id.
async fn upload_csv(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut refugio_id: Option<i64> = None;
    let mut usuario_id: Option<i64> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse::new("No se subió ningún archivo válido")),
                )
                    .into_response();
            }
        };

        match field.name() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.csv")
                    .to_string();
                let content_type = field.content_type().map(|ct| ct.to_string());

                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, content_type, bytes.to_vec())),
                    Err(_) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(ErrorResponse::new("No se pudo leer el archivo")),
                        )
                            .into_response();
                    }
                }
            }
            Some("refugio_id") => {
                refugio_id = field.text().await.ok().and_then(|v| v.parse().ok());
            }
            Some("usuario_id") => {
                usuario_id = field.text().await.ok().and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }

    let Some((filename, content_type, data)) = file else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("No se subió ningún archivo válido")),
        )
            .into_response();
    };

    let Some(refugio_id) = refugio_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Debe especificar un refugio")),
        )
            .into_response();
    };

    let Some(usuario_id) = usuario_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Debe especificar el usuario que sube el archivo")),
        )
            .into_response();
    };

    if data.len() > MAX_UPLOAD_BYTES {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("El archivo es demasiado grande (máximo 5MB)")),
        )
            .into_response();
    }

    if !is_csv_upload(&filename, content_type.as_deref()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Solo se permiten archivos CSV")),
        )
            .into_response();
    }

    let mut conn = state.db.lock().unwrap();
    let pipeline = IngestionPipeline::sqlite();

    match pipeline.run(&mut conn, &data, &filename, refugio_id, usuario_id) {
        Ok(report) => {
            info!(upload_id = report.upload_id, "upload accepted");
            (StatusCode::OK, Json(ApiResponse::ok(report))).into_response()
        }
        Err(UploadError::Structure(err)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::with_details(
                "Estructura de CSV inválida",
                vec![err.to_string()],
            )),
        )
            .into_response(),
        Err(UploadError::Infrastructure(err)) => {
            error!(error = %err, "upload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Error procesando archivo CSV")),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct HistoryParams {
    refugio_id: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/uploads - Upload history, newest first
async fn list_uploads(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    match get_upload_history(&conn, params.refugio_id, limit) {
        Ok(uploads) => (StatusCode::OK, Json(ApiResponse::ok(uploads))).into_response(),
        Err(err) => {
            error!(error = %err, "error listing uploads");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Error interno del servidor")),
            )
                .into_response()
        }
    }
}

/// GET /api/uploads/:id - One upload's status and counts
async fn get_upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<i64>,
) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_upload(&conn, upload_id) {
        Ok(Some(batch)) => (StatusCode::OK, Json(ApiResponse::ok(batch))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Upload no encontrado")),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, upload_id, "error reading upload");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Error interno del servidor")),
            )
                .into_response()
        }
    }
}

/// GET /api/refugios - Shelter listing (anonymized)
async fn list_refugios(State(state): State<AppState>) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_refugios(&conn) {
        Ok(refugios) => (StatusCode::OK, Json(ApiResponse::ok(refugios))).into_response(),
        Err(err) => {
            error!(error = %err, "error listing refugios");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Error interno del servidor")),
            )
                .into_response()
        }
    }
}

/// GET /api/stats - Occupancy per refugio (counts only, no person data)
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match get_refugio_stats(&conn) {
        Ok(stats) => (StatusCode::OK, Json(ApiResponse::ok(stats))).into_response(),
        Err(err) => {
            error!(error = %err, "error computing stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Error interno del servidor")),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refugio_registry=info,refugio_server=info".into()),
        )
        .init();

    let db_path = std::env::var("REFUGIO_DB").unwrap_or_else(|_| "refugios.db".to_string());
    let conn = open_database(std::path::Path::new(&db_path)).expect("Failed to open database");
    info!(db = %db_path, "database ready");

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload_csv))
        .route("/uploads", get(list_uploads))
        .route("/uploads/:id", get(get_upload_status))
        .route("/refugios", get(list_refugios))
        .route("/stats", get(get_stats))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        // The multipart envelope adds overhead on top of the 5 MiB file cap
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
        .layer(CorsLayer::permissive());

    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    info!(addr, "refugio-server listening");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
