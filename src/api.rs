pub mod manager;
pub mod public;
pub mod user;

use std::sync::Arc;

use axum::Router;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::server::Server;

struct CapabilityScheme;

impl Modify for CapabilityScheme {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "capability",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        user::get_progress,
        user::submit_chapter_quiz,
        user::submit_final_test,
        user::quiz_analytics,
        user::final_test_eligibility,
        user::verify_coupon,
        user::redeem_coupon,
        user::create_order,
        user::confirm_payment,
        user::issue_certificate,
        user::delete_certificate,
        manager::create_coupon,
        manager::generate_batch,
        manager::list_coupons,
        manager::coupon_usage,
        manager::revoke_certificate,
        public::verify_certificate,
    ),
    modifiers(&CapabilityScheme),
    info(title = "cert-server", description = "Course progression, payment and certificate API")
)]
pub struct ApiDoc;

/// The whole `/api` tree bound to `server`.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .nest(
            "/api",
            Router::new()
                .merge(user::get_user_scope())
                .merge(manager::get_manager_scope())
                .merge(public::get_public_scope()),
        )
        .with_state(server)
}
