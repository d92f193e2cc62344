use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tablegate_auth::{OidcAuthenticator, Principal};
use tablegate_contracts::{MutationRequest, MutationResult, QueryRequest, QueryResult};
use tablegate_engine::{Engine, EngineError};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{AuthMode, GatewayConfig, StartupError};

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    oidc: Option<OidcAuthenticator>,
    engine: Engine,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let oidc = if config.auth_mode == AuthMode::Oidc {
        let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc auth mode requires oidc config".to_string(),
        })?;

        Some(
            OidcAuthenticator::new(oidc_config)
                .await
                .map_err(|err| StartupError {
                    code: err.code,
                    message: err.message,
                })?,
        )
    } else {
        None
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.db_url)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to initialize database pool".to_string(),
        })?;

    let policy = config.schema_policy()?;
    let engine = Engine::new(pool, policy, config.engine_config());

    let state = AppState {
        config,
        oidc,
        engine,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/tables/{schema}/{table}/columns", get(table_columns))
        .route("/v1/tables/{schema}/{table}/query", post(query_table))
        .route("/v1/tables/{schema}/{table}/rows/{row_id}", post(update_row))
        .route("/v1/schema-cache/invalidate", post(invalidate_schema_cache))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    postgres: bool,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let postgres_ready = tokio::time::timeout(
        Duration::from_millis(state.config.statement_timeout_ms.max(50)),
        sqlx::query("SELECT 1").execute(state.engine.pool()),
    )
    .await
    .is_ok_and(|res| res.is_ok());

    let status = if postgres_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if postgres_ready { "ready" } else { "not_ready" },
            postgres: postgres_ready,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = extract_principal(&state, &headers).await
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ColumnResponse {
    name: String,
    declared_type: String,
    searchable: bool,
}

async fn table_columns(
    State(state): State<AppState>,
    Path((schema, table)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Vec<ColumnResponse>>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "table_columns",
        request_id = %request_id,
        schema = %schema,
        table = %table,
    );

    let result = async {
        let principal = extract_principal(&state, &headers).await?;
        let is_admin = principal.is_admin(&state.config.admin_role);

        let columns = state
            .engine
            .introspect(is_admin, &schema, &table)
            .await
            .map_err(engine_error_response)?;

        Ok(Json(
            columns
                .into_iter()
                .map(|c| ColumnResponse {
                    searchable: c.is_searchable,
                    name: c.name,
                    declared_type: c.declared_type,
                })
                .collect(),
        ))
    }
    .instrument(span)
    .await;

    observe(&result, "/v1/tables/columns", "GET", started);
    result
}

async fn query_table(
    State(state): State<AppState>,
    Path((schema, table)): Path<(String, String)>,
    headers: HeaderMap,
    req: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResult>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "query_table",
        request_id = %request_id,
        schema = %schema,
        table = %table,
    );

    let result = async {
        let principal = extract_principal(&state, &headers).await?;
        let is_admin = principal.is_admin(&state.config.admin_role);

        let Json(req) = req.map_err(invalid_body)?;

        let result = state
            .engine
            .query(is_admin, &schema, &table, &req)
            .await
            .map_err(engine_error_response)?;

        tracing::info!(
            total_count = result.total_count,
            returned = result.rows.len(),
            "query served"
        );

        Ok(Json(result))
    }
    .instrument(span)
    .await;

    observe(&result, "/v1/tables/query", "POST", started);
    result
}

async fn update_row(
    State(state): State<AppState>,
    Path((schema, table, row_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    req: Result<Json<MutationRequest>, JsonRejection>,
) -> Result<Json<MutationResult>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "update_row",
        request_id = %request_id,
        schema = %schema,
        table = %table,
    );

    let result = async {
        let principal = extract_principal(&state, &headers).await?;
        let is_admin = principal.is_admin(&state.config.admin_role);

        let Json(req) = req.map_err(invalid_body)?;

        let result = state
            .engine
            .mutate(is_admin, &schema, &table, &row_id, &req.updates)
            .await
            .map_err(engine_error_response)?;

        tracing::info!("row updated");

        Ok(Json(result))
    }
    .instrument(span)
    .await;

    observe(&result, "/v1/tables/rows", "POST", started);
    result
}

#[derive(Debug, Serialize)]
struct InvalidateResponse {
    status: &'static str,
}

/// Host-triggered signal that DDL ran against the database; the engine
/// drops any cached column metadata.
async fn invalidate_schema_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!("invalidate_schema_cache", request_id = %request_id);

    let result = async {
        let principal = extract_principal(&state, &headers).await?;
        if !principal.is_admin(&state.config.admin_role) {
            return Err(json_error(
                StatusCode::FORBIDDEN,
                "ERR_PERMISSION_DENIED",
                "schema cache invalidation requires the admin role".to_string(),
                false,
            ));
        }

        state.engine.invalidate_schema_cache();
        tracing::info!("schema cache invalidated");
        Ok(Json(InvalidateResponse {
            status: "invalidated",
        }))
    }
    .instrument(span)
    .await;

    observe(&result, "/v1/schema-cache/invalidate", "POST", started);
    result
}

fn observe<T>(result: &Result<T, ApiError>, route: &str, method: &str, started: Instant) {
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}

async fn extract_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    match state.config.auth_mode {
        AuthMode::Local => {
            validate_local_admin_secret(headers, state.config.local_admin_secret.as_deref())?;
            let principal_id = extract_principal_id(headers)?;
            // A caller holding the local secret is the admin; local mode
            // is restricted to loopback binds at startup.
            Ok(Principal {
                principal_id,
                roles: vec![state.config.admin_role.clone()],
            })
        }
        AuthMode::Oidc => {
            let Some(auth) = state.oidc.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_INTERNAL",
                    "oidc authenticator is not initialized".to_string(),
                    false,
                ));
            };

            auth.authenticate(headers)
                .await
                .map_err(|err| match err.code {
                    "ERR_AUTH_UNAVAILABLE" => json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        err.code,
                        err.message,
                        true,
                    ),
                    _ => json_error(StatusCode::UNAUTHORIZED, err.code, err.message, false),
                })
        }
    }
}

fn validate_local_admin_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided = headers
        .get("x-tablegate-admin-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());

    if provided != Some(expected_secret) {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "missing or invalid x-tablegate-admin-secret header".to_string(),
            false,
        ));
    }

    Ok(())
}

fn extract_principal_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-tablegate-principal-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing x-tablegate-principal-id header".to_string(),
                false,
            )
        })
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-tablegate-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<Ulid>().ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| Ulid::new().to_string())
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
            correlation_id: None,
        }),
    )
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_REQUEST",
        rejection.body_text(),
        false,
    )
}

/// Denied access and a genuinely missing table produce the same response
/// body and status, so probing requests learn nothing about which tables
/// exist.
fn engine_error_response(err: EngineError) -> ApiError {
    let (status, code, message, retryable, correlation_id) = match err {
        EngineError::InvalidIdentifier { .. } => (
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_IDENTIFIER",
            err.to_string(),
            false,
            None,
        ),
        EngineError::TableNotFound { .. } | EngineError::PermissionDenied => (
            StatusCode::NOT_FOUND,
            "ERR_TABLE_NOT_FOUND",
            "table not found".to_string(),
            false,
            None,
        ),
        EngineError::UnknownColumn { .. } => (
            StatusCode::BAD_REQUEST,
            "ERR_UNKNOWN_COLUMN",
            err.to_string(),
            false,
            None,
        ),
        EngineError::UnsupportedOperator { .. } => (
            StatusCode::BAD_REQUEST,
            "ERR_UNSUPPORTED_OPERATOR",
            err.to_string(),
            false,
            None,
        ),
        EngineError::InvalidPagination { .. } => (
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PAGINATION",
            err.to_string(),
            false,
            None,
        ),
        EngineError::InvalidValue { .. } => (
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_VALUE",
            err.to_string(),
            false,
            None,
        ),
        EngineError::NotFound => (
            StatusCode::NOT_FOUND,
            "ERR_ROW_NOT_FOUND",
            "row not found".to_string(),
            false,
            None,
        ),
        EngineError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_STATEMENT_TIMEOUT",
            "statement timed out".to_string(),
            true,
            None,
        ),
        EngineError::StoreError { correlation_id } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_STORE",
            "store error".to_string(),
            true,
            Some(correlation_id),
        ),
    };

    crate::metrics::observe_engine_error(code);

    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            message,
            retryable,
            correlation_id,
        }),
    )
}
