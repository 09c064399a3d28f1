pub mod cipher;
pub mod issuer;
pub mod renderer;
pub mod verify;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

pub use cipher::{EncryptionParams, IdentityCipher, IdentityPayload};
pub use issuer::{IssueStatus, IssuedCertificate, Issuer};
pub use renderer::{CertificateFields, CertificateRenderer, HttpRenderer, RenderOutcome};
pub use verify::{VerificationResult, verify};

use crate::{
    db::is_unique_violation,
    error::{Error, Result},
    progress::QuizScore,
    utils::now,
};

/// Prefix of certificate ids synthesized locally while the renderer is unavailable.
pub const FALLBACK_PREFIX: &str = "CSG-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    C,
}

impl Grade {
    pub fn from_percent(percent: u32) -> Self {
        match percent {
            90.. => Grade::APlus,
            80..=89 => Grade::A,
            70..=79 => Grade::BPlus,
            60..=69 => Grade::B,
            _ => Grade::C,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "A+" => Ok(Grade::APlus),
            "A" => Ok(Grade::A),
            "B+" => Ok(Grade::BPlus),
            "B" => Ok(Grade::B),
            "C" => Ok(Grade::C),
            other => Err(Error::validation(format!("unknown grade {other}"))),
        }
    }
}

/// Rounded percentage of a final-test result; 100 when there is no usable score.
pub fn percent(result: Option<QuizScore>) -> u32 {
    match result {
        Some(QuizScore { score, total }) if total > 0 => (200 * score + total) / (2 * total),
        _ => 100,
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate_id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issue_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
    /// Cleared by revocation only; expiry is judged separately.
    pub is_valid: bool,
    pub final_test_score: Option<u32>,
    pub final_test_total: Option<u32>,
    pub percent: u32,
    pub grade: Grade,
    pub encryption_params: Option<EncryptionParams>,
    pub fallback_issued: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

impl Certificate {
    pub fn is_expired(&self, at: OffsetDateTime) -> bool {
        at > self.expiry_date
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_issued || self.certificate_id.starts_with(FALLBACK_PREFIX)
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    certificate_id: String,
    user_id: String,
    name: String,
    email: String,
    issue_date: OffsetDateTime,
    expiry_date: OffsetDateTime,
    is_valid: bool,
    final_test_score: Option<i64>,
    final_test_total: Option<i64>,
    percent: i64,
    grade: String,
    ciphertext_hex: Option<String>,
    iv_hex: Option<String>,
    tag_hex: Option<String>,
    fallback_issued: bool,
    revoked_at: Option<OffsetDateTime>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = Error;
    fn try_from(row: CertificateRow) -> Result<Self> {
        let encryption_params = match (row.ciphertext_hex, row.iv_hex, row.tag_hex) {
            (Some(ciphertext), Some(iv), Some(tag)) => Some(EncryptionParams { ciphertext, iv, tag }),
            _ => None,
        };
        Ok(Certificate {
            certificate_id: row.certificate_id,
            user_id: row.user_id,
            name: row.name,
            email: row.email,
            issue_date: row.issue_date,
            expiry_date: row.expiry_date,
            is_valid: row.is_valid,
            final_test_score: row.final_test_score.map(|s| s as u32),
            final_test_total: row.final_test_total.map(|t| t as u32),
            percent: row.percent as u32,
            grade: row.grade.parse()?,
            encryption_params,
            fallback_issued: row.fallback_issued,
            revoked_at: row.revoked_at,
        })
    }
}

const CERTIFICATE_COLUMNS: &str = "certificate_id, user_id, name, email, issue_date, expiry_date, \
    is_valid, final_test_score, final_test_total, percent, grade, ciphertext_hex, iv_hex, tag_hex, \
    fallback_issued, revoked_at";

pub async fn find_by_id(database: &SqlitePool, certificate_id: &str) -> Result<Option<Certificate>> {
    sqlx::query_as::<_, CertificateRow>(&format!(
        "SELECT {CERTIFICATE_COLUMNS} FROM certificate WHERE certificate_id = ?"
    ))
    .bind(certificate_id.trim())
    .fetch_optional(database)
    .await?
    .map(Certificate::try_from)
    .transpose()
}

pub async fn find_by_user(database: &SqlitePool, user_id: &str) -> Result<Option<Certificate>> {
    sqlx::query_as::<_, CertificateRow>(&format!(
        "SELECT {CERTIFICATE_COLUMNS} FROM certificate WHERE user_id = ?"
    ))
    .bind(user_id)
    .fetch_optional(database)
    .await?
    .map(Certificate::try_from)
    .transpose()
}

/// Store `certificate` as the user's only record, replacing any previous one even when the
/// id changed. An id already held by another user is a `Conflict`; nothing is removed then.
pub(crate) async fn replace(database: &SqlitePool, certificate: &Certificate) -> Result<()> {
    let params = certificate.encryption_params.as_ref();
    let mut tx = database.begin().await?;
    sqlx::query("DELETE FROM certificate WHERE user_id = ?")
        .bind(&certificate.user_id)
        .execute(&mut *tx)
        .await?;
    let inserted = sqlx::query(&format!(
        "INSERT INTO certificate ({CERTIFICATE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&certificate.certificate_id)
    .bind(&certificate.user_id)
    .bind(&certificate.name)
    .bind(&certificate.email)
    .bind(certificate.issue_date)
    .bind(certificate.expiry_date)
    .bind(certificate.is_valid)
    .bind(certificate.final_test_score.map(i64::from))
    .bind(certificate.final_test_total.map(i64::from))
    .bind(i64::from(certificate.percent))
    .bind(certificate.grade.as_str())
    .bind(params.map(|p| p.ciphertext.as_str()))
    .bind(params.map(|p| p.iv.as_str()))
    .bind(params.map(|p| p.tag.as_str()))
    .bind(certificate.fallback_issued)
    .bind(certificate.revoked_at)
    .execute(&mut *tx)
    .await;
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            tx.rollback().await?;
            return Err(Error::conflict(format!(
                "certificate id {} already belongs to another user",
                certificate.certificate_id
            )));
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Revocation {
    pub certificate_id: String,
    pub already_revoked: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

pub async fn revoke(database: &SqlitePool, certificate_id: &str, by: &str) -> Result<Revocation> {
    let revoked_at = now();
    let updated = sqlx::query(
        "UPDATE certificate SET is_valid = 0, revoked_at = ? WHERE certificate_id = ? AND is_valid = 1",
    )
    .bind(revoked_at)
    .bind(certificate_id)
    .execute(database)
    .await?;
    if updated.rows_affected() == 1 {
        info!("{} revoked certificate {}", by, certificate_id);
        return Ok(Revocation {
            certificate_id: certificate_id.to_string(),
            already_revoked: false,
            revoked_at: Some(revoked_at),
        });
    }
    let existing = find_by_id(database, certificate_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("certificate {certificate_id} not found")))?;
    Ok(Revocation {
        certificate_id: existing.certificate_id,
        already_revoked: true,
        revoked_at: existing.revoked_at,
    })
}

/// Remove the learner's certificate so the next request issues a fresh one.
/// A revoked certificate stays on record and cannot be deleted.
pub async fn delete_for_user(database: &SqlitePool, user_id: &str) -> Result<bool> {
    let deleted = sqlx::query("DELETE FROM certificate WHERE user_id = ? AND is_valid = 1")
        .bind(user_id)
        .execute(database)
        .await?;
    if deleted.rows_affected() > 0 {
        info!("{} deleted their certificate", user_id);
        return Ok(true);
    }
    if find_by_user(database, user_id).await?.is_some() {
        return Err(Error::forbidden("a revoked certificate cannot be deleted"));
    }
    Ok(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use time::Duration;

    use super::*;
    use crate::{db::tests::test_database, utils::one_year_and_a_day};

    pub(crate) fn sample(certificate_id: &str, user_id: &str) -> Certificate {
        let issue_date = now();
        Certificate {
            certificate_id: certificate_id.to_string(),
            user_id: user_id.to_string(),
            name: "Asha Rao".into(),
            email: "asha@example.org".into(),
            issue_date,
            expiry_date: one_year_and_a_day(issue_date),
            is_valid: true,
            final_test_score: Some(27),
            final_test_total: Some(30),
            percent: 90,
            grade: Grade::APlus,
            encryption_params: Some(EncryptionParams {
                ciphertext: "AA".into(),
                iv: "BB".into(),
                tag: "CC".into(),
            }),
            fallback_issued: false,
            revoked_at: None,
        }
    }

    #[test]
    fn grades_and_percentages() {
        assert_eq!(percent(Some(QuizScore { score: 9, total: 30 })), 30);
        assert_eq!(percent(Some(QuizScore { score: 29, total: 30 })), 97);
        assert_eq!(percent(Some(QuizScore { score: 1, total: 0 })), 100);
        assert_eq!(percent(None), 100);
        assert_eq!(Grade::from_percent(97), Grade::APlus);
        assert_eq!(Grade::from_percent(90), Grade::APlus);
        assert_eq!(Grade::from_percent(89), Grade::A);
        assert_eq!(Grade::from_percent(70), Grade::BPlus);
        assert_eq!(Grade::from_percent(60), Grade::B);
        assert_eq!(Grade::from_percent(30), Grade::C);
        assert_eq!("B+".parse::<Grade>().unwrap(), Grade::BPlus);
        assert_eq!(serde_json::to_value(Grade::APlus).unwrap(), "A+");
    }

    #[tokio::test]
    async fn one_record_per_user() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CERT-1", "u1")).await.unwrap();
        replace(&db, &sample("CERT-2", "u1")).await.unwrap();
        assert!(find_by_id(&db, "CERT-1").await.unwrap().is_none());
        let stored = find_by_user(&db, "u1").await.unwrap().unwrap();
        assert_eq!(stored.certificate_id, "CERT-2");
        assert_eq!(stored.grade, Grade::APlus);
        assert_eq!(stored.encryption_params.unwrap().iv, "BB");

        assert!(delete_for_user(&db, "u1").await.unwrap());
        assert!(!delete_for_user(&db, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn colliding_id_keeps_the_other_users_certificate() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CSG-1A2B3C4D5E6F", "u1")).await.unwrap();
        replace(&db, &sample("CERT-2", "u2")).await.unwrap();
        let clash = replace(&db, &sample("CSG-1A2B3C4D5E6F", "u2")).await;
        assert!(matches!(clash, Err(Error::Conflict(_))));

        let owner = find_by_id(&db, "CSG-1A2B3C4D5E6F").await.unwrap().unwrap();
        assert_eq!(owner.user_id, "u1");
        // the failed replacement rolled back, u2 keeps its previous record
        let u2 = find_by_user(&db, "u2").await.unwrap().unwrap();
        assert_eq!(u2.certificate_id, "CERT-2");
    }

    #[tokio::test]
    async fn revoked_certificates_cannot_be_deleted() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CERT-1", "u1")).await.unwrap();
        revoke(&db, "CERT-1", "admin").await.unwrap();
        assert!(matches!(delete_for_user(&db, "u1").await, Err(Error::Forbidden(_))));
        assert!(find_by_id(&db, "CERT-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoking_twice_reports_it() {
        let (_dir, db) = test_database().await;
        replace(&db, &sample("CERT-1", "u1")).await.unwrap();
        let first = revoke(&db, "CERT-1", "admin").await.unwrap();
        assert!(!first.already_revoked);
        let second = revoke(&db, "CERT-1", "admin").await.unwrap();
        assert!(second.already_revoked);
        assert!(second.revoked_at.is_some());
        let stored = find_by_id(&db, "CERT-1").await.unwrap().unwrap();
        assert!(!stored.is_valid);
        assert!(matches!(revoke(&db, "NOPE", "admin").await, Err(Error::NotFound(_))));
    }

    #[test]
    fn expiry_is_strict() {
        let cert = sample("CERT-1", "u1");
        assert!(!cert.is_expired(cert.expiry_date));
        assert!(cert.is_expired(cert.expiry_date + Duration::seconds(1)));
        assert!(sample("CSG-1A2B3C4D5E6F", "u1").is_fallback());
    }
}
