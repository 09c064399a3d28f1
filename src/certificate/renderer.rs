use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::cipher::EncryptionParams;
use crate::config::RendererConfig;

/// Certificate fields as printed on the rendered document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateFields {
    pub certificate_id: String,
    pub completion_date: String,
    pub name: String,
    pub email: String,
    pub grade: String,
    pub percent: String,
    pub user_id: String,
    pub valid_upto: String,
}

/// Wire shape of the renderer's `details` response.
#[derive(Debug, Deserialize)]
struct DetailsResponse {
    certificate_no_: String,
    #[serde(default)]
    completion_date_: String,
    #[serde(default)]
    name_: String,
    #[serde(default)]
    email_: String,
    #[serde(default)]
    grade_: String,
    #[serde(default)]
    percent_: String,
    #[serde(default)]
    uid_: String,
    #[serde(default)]
    valid_upto_: String,
}

impl From<DetailsResponse> for CertificateFields {
    fn from(r: DetailsResponse) -> Self {
        CertificateFields {
            certificate_id: r.certificate_no_,
            completion_date: r.completion_date_,
            name: r.name_,
            email: r.email_,
            grade: r.grade_,
            percent: r.percent_,
            user_id: r.uid_,
            valid_upto: r.valid_upto_,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered(CertificateFields),
    /// Fields synthesized locally after the renderer failed.
    Fallback(CertificateFields),
    Failed(String),
}

impl RenderOutcome {
    /// Turn a failure into locally synthesized fields.
    pub fn or_fallback(self, local: impl FnOnce() -> CertificateFields) -> RenderOutcome {
        match self {
            RenderOutcome::Failed(reason) => {
                warn!("certificate renderer failed, issuing locally: {}", reason);
                RenderOutcome::Fallback(local())
            }
            other => other,
        }
    }
}

#[async_trait]
pub trait CertificateRenderer: Send + Sync {
    async fn render(&self, params: &EncryptionParams) -> RenderOutcome;
    fn base_url(&self) -> &str;
}

pub struct HttpRenderer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRenderer {
    pub fn new(config: &RendererConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CertificateRenderer for HttpRenderer {
    async fn render(&self, params: &EncryptionParams) -> RenderOutcome {
        let url = format!("{}/details", self.base_url);
        let response = match self
            .client
            .get(&url)
            .query(&[
                ("param_ct_", params.ciphertext.as_str()),
                ("param_iv_", params.iv.as_str()),
                ("param_at_", params.tag.as_str()),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return RenderOutcome::Failed("renderer timed out".into()),
            Err(e) => return RenderOutcome::Failed(format!("renderer unreachable: {e}")),
        };
        let status = response.status();
        if !status.is_success() {
            return RenderOutcome::Failed(format!("renderer answered {status}"));
        }
        match response.json::<DetailsResponse>().await {
            Ok(details) if !details.certificate_no_.trim().is_empty() => {
                debug!("renderer issued {}", details.certificate_no_);
                RenderOutcome::Rendered(details.into())
            }
            Ok(_) => RenderOutcome::Failed("renderer returned no certificate number".into()),
            Err(e) => RenderOutcome::Failed(format!("unexpected renderer response: {e}")),
        }
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Preview or download link for a sealed certificate.
pub fn certificate_url(base_url: &str, params: &EncryptionParams, download: bool) -> String {
    let flag = if download {
        "request_is_true"
    } else {
        "request_is_false"
    };
    format!(
        "{}/certified?param_ct_={}&param_iv_={}&param_at_={}&download_={}",
        base_url.trim_end_matches('/'),
        params.ciphertext,
        params.iv,
        params.tag,
        flag
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EncryptionParams {
        EncryptionParams {
            ciphertext: "AB12".into(),
            iv: "00FF".into(),
            tag: "CD34".into(),
        }
    }

    #[test]
    fn urls_depend_only_on_params_and_mode() {
        let preview = certificate_url("https://render.example/", &params(), false);
        assert_eq!(
            preview,
            "https://render.example/certified?param_ct_=AB12&param_iv_=00FF&param_at_=CD34&download_=request_is_false"
        );
        let download = certificate_url("https://render.example", &params(), true);
        assert!(download.ends_with("download_=request_is_true"));
        assert_eq!(preview, certificate_url("https://render.example/", &params(), false));
    }

    #[test]
    fn details_response_maps_to_fields() {
        let details: DetailsResponse = serde_json::from_value(serde_json::json!({
            "certificate_no_": "CSG7-USER71903768",
            "completion_date_": "21 May 2025",
            "name_": "Asha Rao",
            "email_": "asha@example.org",
            "grade_": "A+",
            "percent_": "97",
            "uid_": "u1",
            "valid_upto_": "22 May 2026"
        }))
        .unwrap();
        let fields = CertificateFields::from(details);
        assert_eq!(fields.certificate_id, "CSG7-USER71903768");
        assert_eq!(fields.valid_upto, "22 May 2026");
    }

    #[test]
    fn only_failures_fall_back() {
        let local = || CertificateFields {
            certificate_id: "CSG-LOCAL".into(),
            completion_date: String::new(),
            name: String::new(),
            email: String::new(),
            grade: String::new(),
            percent: String::new(),
            user_id: String::new(),
            valid_upto: String::new(),
        };
        let failed = RenderOutcome::Failed("timeout".into()).or_fallback(local);
        assert!(matches!(failed, RenderOutcome::Fallback(f) if f.certificate_id == "CSG-LOCAL"));
        let rendered = RenderOutcome::Rendered(local()).or_fallback(|| unreachable!());
        assert!(matches!(rendered, RenderOutcome::Rendered(_)));
    }
}
