use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State},
    routing::get,
};

use crate::{
    certificate::verify::{self, VerificationQuery, VerificationResult},
    error::Result,
    server::Server,
};

#[utoipa::path(
    context_path = "/api/public",
    path = "/certificate/verify",
    method(get),
    params(VerificationQuery),
    responses(
        (status = 200, description = "Verification verdict; `isValid` is false for unknown, revoked or expired certificates", body = VerificationResult),
        (status = 400, description = "Missing certificate id")
    )
)]
pub async fn verify_certificate(
    State(server): State<Arc<Server>>,
    Query(query): Query<VerificationQuery>,
) -> Result<Json<VerificationResult>> {
    Ok(Json(verify::verify(&server.database, &query).await?))
}

pub fn get_public_scope() -> Router<Arc<Server>> {
    Router::new().nest(
        "/public",
        Router::new().route("/certificate/verify", get(verify_certificate)),
    )
}
