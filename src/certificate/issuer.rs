use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use super::{
    Certificate, FALLBACK_PREFIX, Grade, find_by_user, percent,
    cipher::{IdentityCipher, IdentityPayload},
    renderer::{CertificateFields, CertificateRenderer, RenderOutcome, certificate_url},
    replace,
};
use crate::{
    config::Config,
    error::{Error, Result},
    progress::{self, QuizScore},
    utils::{format_long_date, now, one_year_and_a_day},
};

type IssueLocks = Cache<String, Arc<Mutex<()>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Issued,
    Reissued,
    /// The stored certificate is still current and was returned unchanged.
    Existing,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    pub certificate: Certificate,
    pub status: IssueStatus,
    /// Fields printed on the document; absent when nothing was rendered this time.
    pub fields: Option<CertificateFields>,
    /// False when the certificate was computed but could not be stored.
    pub persisted: bool,
    pub preview_url: Option<String>,
    pub download_url: Option<String>,
    /// The stored certificate is out of date but the renderer could not produce a new one.
    pub update_pending: bool,
}

/// Issues certificates, one request per learner at a time.
pub struct Issuer {
    database: SqlitePool,
    config: Arc<Config>,
    cipher: IdentityCipher,
    renderer: Arc<dyn CertificateRenderer>,
    locks: IssueLocks,
}

/// `CSG-` followed by the first 12 hex digits of sha256(`user_id|issue_date`), the issue
/// date in whole seconds so the id survives a storage round trip.
pub fn fallback_id(user_id: &str, issue_date: OffsetDateTime) -> String {
    let digest = Sha256::digest(format!("{user_id}|{}", issue_date.unix_timestamp()));
    let hex = hex::encode_upper(digest);
    format!("{FALLBACK_PREFIX}{}", &hex[..12])
}

impl Issuer {
    pub fn new(
        database: SqlitePool,
        config: Arc<Config>,
        cipher: IdentityCipher,
        renderer: Arc<dyn CertificateRenderer>,
    ) -> Self {
        let locks = Cache::builder()
            .max_capacity(10_000)
            .time_to_idle(Duration::from_secs(600))
            .build();
        Self {
            database,
            config,
            cipher,
            renderer,
            locks,
        }
    }

    pub fn cipher(&self) -> &IdentityCipher {
        &self.cipher
    }

    fn with_urls(&self, certificate: Certificate, status: IssueStatus) -> IssuedCertificate {
        let base = self.renderer.base_url();
        let (preview_url, download_url) = match &certificate.encryption_params {
            Some(params) => (
                Some(certificate_url(base, params, false)),
                Some(certificate_url(base, params, true)),
            ),
            None => (None, None),
        };
        IssuedCertificate {
            certificate,
            status,
            fields: None,
            persisted: true,
            preview_url,
            download_url,
            update_pending: false,
        }
    }

    /// Whether `existing` must be replaced to reflect `payload` and `result`.
    fn is_stale(
        &self,
        existing: &Certificate,
        payload: &IdentityPayload,
        result: Option<QuizScore>,
    ) -> bool {
        let Some(params) = &existing.encryption_params else {
            return true;
        };
        if existing.is_fallback() {
            return true;
        }
        if let Some(result) = result {
            if result.score > existing.final_test_score.unwrap_or(0) {
                return true;
            }
        }
        self.cipher
            .decrypt(params)
            .map_or(true, |plaintext| plaintext != payload.encode())
    }

    pub async fn issue(&self, user_id: &str) -> Result<IssuedCertificate> {
        if user_id.trim().is_empty() {
            return Err(Error::validation("user id is required"));
        }
        let lock = self
            .locks
            .get_with(user_id.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        let progress = progress::load(&self.database, user_id, self.config.chapter_count).await?;
        if !progress.certificate_unlocked {
            return Err(Error::forbidden(
                "the final test must be passed before a certificate is issued",
            ));
        }
        let name = progress
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("a name is required to issue a certificate"))?;
        let email = progress
            .email
            .as_deref()
            .ok_or_else(|| Error::validation("an email is required to issue a certificate"))?;

        let existing = find_by_user(&self.database, user_id).await?;
        if existing.as_ref().is_some_and(|c| c.revoked_at.is_some()) {
            return Err(Error::forbidden("this certificate has been revoked"));
        }
        // a worse retake never lowers an issued certificate
        let result = match (progress.final_test_result(), existing.as_ref()) {
            (Some(current), Some(cert)) => match (cert.final_test_score, cert.final_test_total) {
                (Some(score), Some(total)) if score > current.score => {
                    Some(QuizScore { score, total })
                }
                _ => Some(current),
            },
            (current, _) => current,
        };
        let percent = percent(result);
        let grade = Grade::from_percent(percent);
        let issue_date = existing.as_ref().map_or_else(now, |c| c.issue_date);
        let payload = IdentityPayload::new(name, user_id, email, percent, grade, issue_date.date())?;

        if let Some(existing) = existing.as_ref() {
            if !self.is_stale(existing, &payload, result) {
                return Ok(self.with_urls(existing.clone(), IssueStatus::Existing));
            }
        }

        let (params, reused) = self
            .cipher
            .seal(&payload, existing.as_ref().and_then(|c| c.encryption_params.as_ref()))?;
        let expiry_date = one_year_and_a_day(issue_date);
        let outcome = match (self.renderer.render(&params).await, existing.as_ref()) {
            // a rendered certificate is never traded for a local one
            (RenderOutcome::Failed(reason), Some(current)) if !current.is_fallback() => {
                warn!(
                    "renderer failed, keeping certificate {} for {}: {}",
                    current.certificate_id, user_id, reason
                );
                let mut kept = self.with_urls(current.clone(), IssueStatus::Existing);
                kept.update_pending = true;
                return Ok(kept);
            }
            (outcome, _) => outcome,
        };
        let outcome = outcome.or_fallback(|| CertificateFields {
            certificate_id: fallback_id(user_id, issue_date),
            completion_date: format_long_date(issue_date.date()),
            name: payload.name.clone(),
            email: payload.email.clone(),
            grade: grade.to_string(),
            percent: percent.to_string(),
            user_id: user_id.to_string(),
            valid_upto: format_long_date(expiry_date.date()),
        });
        let (fields, fallback_issued) = match outcome {
            RenderOutcome::Rendered(fields) => (fields, false),
            RenderOutcome::Fallback(fields) => (fields, true),
            RenderOutcome::Failed(reason) => return Err(Error::dependency(reason)),
        };

        let certificate = Certificate {
            certificate_id: fields.certificate_id.clone(),
            user_id: user_id.to_string(),
            name: payload.name.clone(),
            email: payload.email.clone(),
            issue_date,
            expiry_date,
            is_valid: true,
            final_test_score: result.map(|r| r.score),
            final_test_total: result.map(|r| r.total),
            percent,
            grade,
            encryption_params: Some(params),
            fallback_issued,
            revoked_at: None,
        };
        let persisted = match replace(&self.database, &certificate).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    reconcile = true,
                    user_id,
                    certificate_id = %certificate.certificate_id,
                    "certificate issued but not stored: {}",
                    e
                );
                false
            }
        };
        let status = if existing.is_some() {
            IssueStatus::Reissued
        } else {
            IssueStatus::Issued
        };
        info!(
            "{:?} certificate {} for {} (fallback={}, params reused={})",
            status, certificate.certificate_id, user_id, fallback_issued, reused
        );
        let mut issued = self.with_urls(certificate, status);
        issued.fields = Some(fields);
        issued.persisted = persisted;
        Ok(issued)
    }
}
