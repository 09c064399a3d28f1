use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};

use super::{Certificate, Grade, find_by_id};
use crate::{
    error::{Error, Result},
    utils::now,
};

#[derive(Debug, Clone, Deserialize, ToSchema, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct VerificationQuery {
    pub certificate_id: String,
    pub user_id: Option<String>,
    pub email: Option<String>,
}

/// What a verifier is allowed to see of a certificate.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateData {
    pub certificate_id: String,
    pub name: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issue_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
    pub grade: Grade,
    pub percent: u32,
    pub is_expired: bool,
    pub is_revoked: bool,
}

impl CertificateData {
    fn new(certificate: &Certificate, at: OffsetDateTime) -> Self {
        Self {
            certificate_id: certificate.certificate_id.clone(),
            name: certificate.name.clone(),
            email: certificate.email.clone(),
            issue_date: certificate.issue_date,
            expiry_date: certificate.expiry_date,
            grade: certificate.grade,
            percent: certificate.percent,
            is_expired: certificate.is_expired(at),
            is_revoked: !certificate.is_valid,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub is_valid: bool,
    pub message: String,
    pub certificate_data: Option<CertificateData>,
}

impl VerificationResult {
    fn rejected(message: &str) -> Self {
        Self {
            is_valid: false,
            message: message.to_string(),
            certificate_data: None,
        }
    }
}

/// Check a certificate id, optionally against the holder's user id and email. Never writes.
pub async fn verify(database: &SqlitePool, query: &VerificationQuery) -> Result<VerificationResult> {
    verify_at(database, query, now()).await
}

pub async fn verify_at(
    database: &SqlitePool,
    query: &VerificationQuery,
    at: OffsetDateTime,
) -> Result<VerificationResult> {
    if query.certificate_id.trim().is_empty() {
        return Err(Error::validation("certificate id is required"));
    }
    let Some(certificate) = find_by_id(database, &query.certificate_id).await? else {
        return Ok(VerificationResult::rejected(
            "This certificate is not valid or does not exist in our records.",
        ));
    };
    let user_mismatch = query
        .user_id
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty() && u.trim() != certificate.user_id);
    let email_mismatch = query.email.as_deref().is_some_and(|e| {
        !e.trim().is_empty() && !e.trim().eq_ignore_ascii_case(&certificate.email)
    });
    if user_mismatch || email_mismatch {
        return Ok(VerificationResult::rejected(
            "This certificate does not belong to the given holder.",
        ));
    }

    let data = CertificateData::new(&certificate, at);
    let (is_valid, message) = if !certificate.is_valid {
        (false, "This certificate has been revoked and is no longer valid.")
    } else if data.is_expired {
        (false, "This certificate has expired and is no longer valid.")
    } else {
        (true, "Certificate is valid")
    };
    Ok(VerificationResult {
        is_valid,
        message: message.to_string(),
        certificate_data: Some(data),
    })
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::{
        certificate::{replace, revoke, tests::sample},
        db::tests::test_database,
    };

    fn query(id: &str) -> VerificationQuery {
        VerificationQuery {
            certificate_id: id.to_string(),
            user_id: None,
            email: None,
        }
    }

    #[tokio::test]
    async fn valid_and_unknown() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CERT-1", "u1")).await.unwrap();
        let result = verify(&db, &query("CERT-1")).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.certificate_data.unwrap().name, "Asha Rao");

        let missing = verify(&db, &query("CERT-404")).await.unwrap();
        assert!(!missing.is_valid);
        assert!(missing.message.contains("does not exist"));
        assert!(missing.certificate_data.is_none());
    }

    #[tokio::test]
    async fn holder_must_match_when_given() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CERT-1", "u1")).await.unwrap();
        let mut q = query("CERT-1");
        q.email = Some("ASHA@example.org".into());
        q.user_id = Some("u1".into());
        assert!(verify(&db, &q).await.unwrap().is_valid);
        q.user_id = Some("u2".into());
        let result = verify(&db, &q).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.certificate_data.is_none());
    }

    #[tokio::test]
    async fn expired_even_when_stored_valid() {
        let (_dir, db) = test_database().await;
        let cert = sample("CERT-1", "u1");
        let later = cert.expiry_date + Duration::days(1);
        replace(&db, &cert).await.unwrap();
        let result = verify_at(&db, &query("CERT-1"), later).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.message.contains("expired"));
        assert!(result.certificate_data.unwrap().is_expired);

        // verification never writes back
        let stored = crate::certificate::find_by_id(&db, "CERT-1").await.unwrap().unwrap();
        assert!(stored.is_valid);
    }

    #[tokio::test]
    async fn revoked_is_reported_as_revoked() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CERT-1", "u1")).await.unwrap();
        revoke(&db, "CERT-1", "admin").await.unwrap();
        let result = verify(&db, &query("CERT-1")).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.message.contains("revoked"));
        assert!(result.certificate_data.unwrap().is_revoked);
    }
}
