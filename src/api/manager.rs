use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    auth::Admin,
    certificate::{self, Revocation},
    coupon::{self, BatchRequest, Coupon, CouponUsage, NewCoupon},
    error::Result,
    server::Server,
};

#[utoipa::path(
    context_path = "/api/manager",
    path = "/coupons",
    method(post),
    request_body = NewCoupon,
    responses(
        (status = 201, description = "Coupon created", body = Coupon),
        (status = 400, description = "Invalid code or discount"),
        (status = 401, description = "Admin capability required"),
        (status = 409, description = "Code already exists")
    ),
    security(("capability" = []))
)]
#[axum::debug_handler]
pub async fn create_coupon(
    State(server): State<Arc<Server>>,
    Admin(admin): Admin,
    Json(req): Json<NewCoupon>,
) -> Result<(StatusCode, Json<Coupon>)> {
    let coupon = coupon::create_coupon(&server.database, &req, &admin.sub).await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/coupons/batch",
    method(post),
    request_body = BatchRequest,
    responses(
        (status = 201, description = "Generated coupons", body = Vec<Coupon>),
        (status = 400, description = "Count out of range"),
        (status = 401, description = "Admin capability required")
    ),
    security(("capability" = []))
)]
pub async fn generate_batch(
    State(server): State<Arc<Server>>,
    Admin(admin): Admin,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<Vec<Coupon>>)> {
    let coupons = coupon::generate_batch(&server.database, &req, &admin.sub).await?;
    info!("{} generated {} coupons", admin.sub, coupons.len());
    Ok((StatusCode::CREATED, Json(coupons)))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/coupons",
    method(get),
    responses(
        (status = 200, description = "All coupons, newest first", body = Vec<Coupon>),
        (status = 401, description = "Admin capability required")
    ),
    security(("capability" = []))
)]
pub async fn list_coupons(
    State(server): State<Arc<Server>>,
    _admin: Admin,
) -> Result<Json<Vec<Coupon>>> {
    Ok(Json(coupon::list_coupons(&server.database).await?))
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/coupons/{code}/usage",
    method(get),
    params(("code" = String, Path, description = "Coupon code, case-insensitive")),
    responses(
        (status = 200, description = "Redemptions of the coupon", body = Vec<CouponUsage>),
        (status = 404, description = "Unknown coupon")
    ),
    security(("capability" = []))
)]
pub async fn coupon_usage(
    State(server): State<Arc<Server>>,
    _admin: Admin,
    Path(code): Path<String>,
) -> Result<Json<Vec<CouponUsage>>> {
    Ok(Json(coupon::coupon_usage(&server.database, &code).await?))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    pub certificate_id: String,
}

#[utoipa::path(
    context_path = "/api/manager",
    path = "/certificates/revoke",
    method(post),
    request_body = RevokeRequest,
    responses(
        (status = 200, description = "Certificate revoked", body = Revocation),
        (status = 404, description = "Unknown certificate")
    ),
    security(("capability" = []))
)]
pub async fn revoke_certificate(
    State(server): State<Arc<Server>>,
    Admin(admin): Admin,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<Revocation>> {
    let revocation = certificate::revoke(&server.database, &req.certificate_id, &admin.sub).await?;
    Ok(Json(revocation))
}

pub fn get_manager_scope() -> Router<Arc<Server>> {
    Router::new().nest(
        "/manager",
        Router::new()
            .route("/coupons", post(create_coupon).get(list_coupons))
            .route("/coupons/batch", post(generate_batch))
            .route("/coupons/{code}/usage", get(coupon_usage))
            .route("/certificates/revoke", post(revoke_certificate)),
    )
}
