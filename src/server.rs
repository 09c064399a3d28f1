use std::sync::Arc;

use sqlx::SqlitePool;

use crate::{
    auth::{CapabilityKeys, Role},
    certificate::{
        Issuer,
        cipher::IdentityCipher,
        renderer::{CertificateRenderer, HttpRenderer},
    },
    config::{Config, Secrets},
    error::Result,
    payment::{PaymentGateway, RazorpayGateway},
};

/// Everything a request handler needs, shared behind an `Arc`.
pub struct Server {
    pub database: SqlitePool,
    pub config: Arc<Config>,
    pub issuer: Issuer,
    pub gateway: Arc<dyn PaymentGateway>,
    pub gateway_secret: String,
    pub capabilities: CapabilityKeys,
}

impl Server {
    /// Wire the production renderer and payment gateway from `config`.
    pub fn new(database: SqlitePool, config: Config, secrets: &Secrets) -> anyhow::Result<Self> {
        let renderer = Arc::new(HttpRenderer::new(&config.renderer)?);
        let gateway = Arc::new(RazorpayGateway::new(
            &config.gateway,
            &secrets.gateway_secret,
        )?);
        Ok(Self::with_parts(database, config, secrets, renderer, gateway))
    }

    pub fn with_parts(
        database: SqlitePool,
        config: Config,
        secrets: &Secrets,
        renderer: Arc<dyn CertificateRenderer>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let config = Arc::new(config);
        let issuer = Issuer::new(
            database.clone(),
            config.clone(),
            IdentityCipher::new(&secrets.certificate_key),
            renderer,
        );
        Self {
            database,
            config,
            issuer,
            gateway,
            gateway_secret: secrets.gateway_secret.clone(),
            capabilities: CapabilityKeys::new(&secrets.capability_secret),
        }
    }

    /// Capability for `user_id` valid for the configured lifetime.
    pub fn grant(&self, user_id: &str, role: Role) -> Result<String> {
        let ttl = time::Duration::minutes(self.config.capability_ttl_minutes);
        self.capabilities.issue(user_id, role, ttl)
    }
}
