use crate::container::{self, ContainerError};
use crate::server::AppState;
use crate::settings::GenerateRequest;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, info, warn};

pub async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(%rejection, "rejected generate request body");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    let settings = match request.into_settings() {
        Ok(settings) => settings,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let ids = match state.id_allocator() {
        Ok(ids) => ids,
        Err(err) => {
            error!(%err, "cannot allocate container ids");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };
    let export = container::build(&settings, &ids);
    match export.verify() {
        Ok(()) => {}
        Err(ContainerError::UndeclaredVariable { name, .. })
            if settings.references_variable(&name) =>
        {
            warn!(%name, "identifier references an undeclared variable");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("measurement id or event name references undeclared variable `{name}`"),
            );
        }
        Err(err) => {
            error!(?err, id_base = ids.base(), "generated container failed verification");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }
    info!(
        premium = settings.premium,
        ajax = settings.ajax_enabled(),
        id_base = ids.base(),
        "container generated"
    );
    Json(export).into_response()
}

pub async fn health() -> &'static str {
    "ok"
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
