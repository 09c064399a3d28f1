use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: PathBuf,
    /// Number of chapters in the course, numbered from 1.
    pub chapter_count: u32,
    /// Questions served per chapter quiz; the pass threshold never uses fewer.
    pub chapter_quiz_questions: u32,
    /// Questions served in the final test; the pass threshold never uses fewer.
    pub final_test_questions: u32,
    /// Course price in whole currency units.
    pub course_price: u64,
    pub currency: String,
    pub capability_ttl_minutes: i64,
    pub renderer: RendererConfig,
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("database/cert.db"),
            chapter_count: 70,
            chapter_quiz_questions: 10,
            final_test_questions: 30,
            course_price: 999,
            currency: "INR".to_string(),
            capability_ttl_minutes: 15,
            renderer: RendererConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api-certicore.vercel.app".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub key_id: String,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.razorpay.com".to_string(),
            key_id: String::new(),
            timeout_secs: 15,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        if config.chapter_count == 0 {
            bail!("chapter_count must be at least 1");
        }
        Ok(config)
    }
}

/// Secrets are read from the environment (or `.env`), never from the config file.
#[derive(Clone)]
pub struct Secrets {
    /// AES-128 key for certificate identity encryption.
    pub certificate_key: [u8; 16],
    pub gateway_secret: String,
    pub capability_secret: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets { .. }")
    }
}

impl Secrets {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let key = dotenvy::var("CERT_SECRET_KEY").context("CERT_SECRET_KEY is not set")?;
        let certificate_key: [u8; 16] = key
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow::anyhow!("CERT_SECRET_KEY must be exactly 16 bytes"))?;
        let gateway_secret =
            dotenvy::var("RAZORPAY_KEY_SECRET").context("RAZORPAY_KEY_SECRET is not set")?;
        let capability_secret =
            dotenvy::var("CAPABILITY_SECRET").context("CAPABILITY_SECRET is not set")?;
        Ok(Self {
            certificate_key,
            gateway_secret,
            capability_secret,
        })
    }
}
