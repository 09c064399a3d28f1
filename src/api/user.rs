use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::Learner,
    certificate::{self, IssuedCertificate},
    chapter::ChapterId,
    coupon::{self, CouponQuote},
    error::{Error, Result},
    gating::{self, ChapterOutcome, Eligibility, FinalTestOutcome},
    payment::{self, Checkout},
    progress::{self, LearnerProgress},
    quiz::{self, QuizAttempt},
    server::Server,
};

/// Reject a body that names a different learner than the capability.
fn ensure_subject(learner: &Learner, user_id: Option<&str>) -> Result<()> {
    match user_id {
        Some(user_id) if !user_id.trim().is_empty() && user_id.trim() != learner.user_id() => Err(
            Error::unauthorized("userId does not match the capability holder"),
        ),
        _ => Ok(()),
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ProgressQuery {
    /// Recorded on first access, or when the stored email is empty.
    pub email: Option<String>,
    pub name: Option<String>,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/progress",
    method(get),
    params(ProgressQuery),
    responses(
        (status = 200, description = "Learner progress, created on first access"),
        (status = 401, description = "Missing or invalid capability")
    ),
    security(("capability" = []))
)]
pub async fn get_progress(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<LearnerProgress>> {
    let progress = progress::get_or_create(
        &server.database,
        learner.user_id(),
        query.email.as_deref(),
        query.name.as_deref(),
        server.config.chapter_count,
    )
    .await?;
    Ok(Json(progress))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuizRequest {
    /// Question id to chosen answer.
    #[schema(value_type = Object)]
    pub user_answers: Value,
    pub user_id: Option<String>,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/quiz/{chapter_id}",
    method(post),
    params(("chapter_id" = String, Path, description = "Chapter id such as CH-001")),
    request_body = QuizRequest,
    responses(
        (status = 200, description = "Quiz evaluated; unlocks the next chapter on a pass"),
        (status = 400, description = "Malformed answers or chapter id"),
        (status = 403, description = "Chapter is locked"),
        (status = 404, description = "Chapter or answer key not found")
    ),
    security(("capability" = []))
)]
pub async fn submit_chapter_quiz(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Path(chapter_id): Path<String>,
    Json(req): Json<QuizRequest>,
) -> Result<Json<ChapterOutcome>> {
    ensure_subject(&learner, req.user_id.as_deref())?;
    let chapter: ChapterId = chapter_id.parse()?;
    let outcome = gating::submit_chapter_quiz(
        &server.database,
        &server.config,
        learner.user_id(),
        chapter,
        &req.user_answers,
    )
    .await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/quiz/final-test",
    method(post),
    request_body = QuizRequest,
    responses(
        (status = 200, description = "Final test evaluated; unlocks the certificate on a pass"),
        (status = 403, description = "Chapters incomplete or payment missing")
    ),
    security(("capability" = []))
)]
pub async fn submit_final_test(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Json(req): Json<QuizRequest>,
) -> Result<Json<FinalTestOutcome>> {
    ensure_subject(&learner, req.user_id.as_deref())?;
    let outcome = gating::submit_final_test(
        &server.database,
        &server.config,
        learner.user_id(),
        &req.user_answers,
    )
    .await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/quiz-analytics",
    method(get),
    responses((status = 200, description = "Quiz attempts, newest first", body = Vec<QuizAttempt>)),
    security(("capability" = []))
)]
pub async fn quiz_analytics(
    State(server): State<Arc<Server>>,
    learner: Learner,
) -> Result<Json<Vec<QuizAttempt>>> {
    let attempts = quiz::quiz_analytics(&server.database, learner.user_id()).await?;
    Ok(Json(attempts))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/final-test/eligibility",
    method(get),
    responses(
        (status = 200, description = "Whether the final test can be taken", body = Eligibility),
        (status = 404, description = "No progress recorded")
    ),
    security(("capability" = []))
)]
pub async fn final_test_eligibility(
    State(server): State<Arc<Server>>,
    learner: Learner,
) -> Result<Json<Eligibility>> {
    let eligibility =
        gating::check_final_test_eligibility(&server.database, &server.config, learner.user_id())
            .await?;
    Ok(Json(eligibility))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponRequest {
    pub coupon_code: String,
    /// Name printed on the certificate.
    pub full_name: Option<String>,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/coupon/verify",
    method(post),
    request_body = CouponRequest,
    responses(
        (status = 200, description = "Coupon quote; `valid` is false for unknown, expired or exhausted codes", body = CouponQuote),
        (status = 403, description = "Chapters incomplete"),
        (status = 409, description = "Payment already completed")
    ),
    security(("capability" = []))
)]
pub async fn verify_coupon(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Json(req): Json<CouponRequest>,
) -> Result<Json<CouponQuote>> {
    let quote = coupon::verify_coupon(
        &server.database,
        &server.config,
        learner.user_id(),
        &req.coupon_code,
    )
    .await?;
    Ok(Json(quote))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/coupon/redeem",
    method(post),
    request_body = CouponRequest,
    responses(
        (status = 200, description = "Payment completed with a full-discount coupon"),
        (status = 400, description = "Coupon is invalid, expired or only partial"),
        (status = 409, description = "Coupon exhausted or payment already completed")
    ),
    security(("capability" = []))
)]
pub async fn redeem_coupon(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Json(req): Json<CouponRequest>,
) -> Result<Json<LearnerProgress>> {
    let progress = coupon::redeem_full_discount(
        &server.database,
        &server.config,
        learner.user_id(),
        &req.coupon_code,
        req.full_name.as_deref(),
    )
    .await?;
    Ok(Json(progress))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub full_name: String,
    pub coupon_code: Option<String>,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/payment/order",
    method(post),
    request_body = OrderRequest,
    responses(
        (status = 200, description = "Gateway order opened", body = Checkout),
        (status = 403, description = "Chapters incomplete"),
        (status = 503, description = "Payment gateway unavailable")
    ),
    security(("capability" = []))
)]
pub async fn create_order(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Json(req): Json<OrderRequest>,
) -> Result<Json<Checkout>> {
    let checkout = payment::create_order(
        &server.database,
        &server.config,
        server.gateway.as_ref(),
        learner.user_id(),
        req.coupon_code.as_deref(),
        &req.full_name,
    )
    .await?;
    Ok(Json(checkout))
}

/// Fields returned by the checkout widget after a successful payment.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    #[serde(alias = "razorpay_order_id")]
    pub order_id: String,
    #[serde(alias = "razorpay_payment_id")]
    pub payment_id: String,
    #[serde(alias = "razorpay_signature")]
    pub signature: String,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/payment/confirm",
    method(post),
    request_body = ConfirmRequest,
    responses(
        (status = 200, description = "Payment recorded"),
        (status = 401, description = "Signature mismatch or order of another learner"),
        (status = 409, description = "Coupon exhausted before confirmation")
    ),
    security(("capability" = []))
)]
pub async fn confirm_payment(
    State(server): State<Arc<Server>>,
    learner: Learner,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<LearnerProgress>> {
    let progress = payment::confirm_payment(
        &server.database,
        &server.config,
        &server.gateway_secret,
        learner.user_id(),
        &req.order_id,
        &req.payment_id,
        &req.signature,
    )
    .await?;
    Ok(Json(progress))
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/certificate",
    method(post),
    responses(
        (status = 200, description = "Issued, re-issued or existing certificate", body = IssuedCertificate),
        (status = 403, description = "Certificate not unlocked or revoked")
    ),
    security(("capability" = []))
)]
pub async fn issue_certificate(
    State(server): State<Arc<Server>>,
    learner: Learner,
) -> Result<Json<IssuedCertificate>> {
    let issued = server.issuer.issue(learner.user_id()).await?;
    Ok(Json(issued))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Deleted {
    pub deleted: bool,
}

#[utoipa::path(
    context_path = "/api/user",
    path = "/certificate",
    method(delete),
    responses(
        (status = 200, description = "Certificate record removed", body = Deleted),
        (status = 403, description = "Certificate is revoked")
    ),
    security(("capability" = []))
)]
pub async fn delete_certificate(
    State(server): State<Arc<Server>>,
    learner: Learner,
) -> Result<Json<Deleted>> {
    let deleted = certificate::delete_for_user(&server.database, learner.user_id()).await?;
    Ok(Json(Deleted { deleted }))
}

pub fn get_user_scope() -> Router<Arc<Server>> {
    Router::new().nest(
        "/user",
        Router::new()
            .route("/progress", get(get_progress))
            .route("/quiz/final-test", post(submit_final_test))
            .route("/quiz/{chapter_id}", post(submit_chapter_quiz))
            .route("/quiz-analytics", get(quiz_analytics))
            .route("/final-test/eligibility", get(final_test_eligibility))
            .route("/coupon/verify", post(verify_coupon))
            .route("/coupon/redeem", post(redeem_coupon))
            .route("/payment/order", post(create_order))
            .route("/payment/confirm", post(confirm_payment))
            .route(
                "/certificate",
                post(issue_certificate).delete(delete_certificate),
            ),
    )
}
