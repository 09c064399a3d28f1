use aes_gcm::{
    Aes128Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::Date;
use utoipa::ToSchema;

use super::Grade;
use crate::{
    error::{Error, Result},
    utils::{format_long_date, parse_long_date},
};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const SEPARATOR: char = ';';

/// The identity sealed into a certificate: `name;userId;email;percent;grade;DD Month YYYY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPayload {
    pub name: String,
    pub user_id: String,
    pub email: String,
    pub percent: u32,
    pub grade: Grade,
    pub issue_date: Date,
}

impl IdentityPayload {
    pub fn new(
        name: &str,
        user_id: &str,
        email: &str,
        percent: u32,
        grade: Grade,
        issue_date: Date,
    ) -> Result<Self> {
        for (field, value) in [("name", name), ("user id", user_id), ("email", email)] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("{field} is required for a certificate")));
            }
            if value.contains(SEPARATOR) {
                return Err(Error::validation(format!("{field} must not contain '{SEPARATOR}'")));
            }
        }
        Ok(Self {
            name: name.trim().to_string(),
            user_id: user_id.to_string(),
            email: email.trim().to_string(),
            percent,
            grade,
            issue_date,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{};{};{};{};{};{}",
            self.name,
            self.user_id,
            self.email,
            self.percent,
            self.grade,
            format_long_date(self.issue_date)
        )
    }

    pub fn decode(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [name, user_id, email, percent, grade, date] = parts.as_slice() else {
            return Err(Error::validation("identity payload must have six fields"));
        };
        let percent = percent
            .parse()
            .map_err(|_| Error::validation(format!("invalid percent {percent}")))?;
        let grade = grade.parse()?;
        let issue_date = parse_long_date(date)
            .ok_or_else(|| Error::validation(format!("invalid issue date {date}")))?;
        Self::new(name, user_id, email, percent, grade, issue_date)
    }
}

/// Uppercase hex of the AES-GCM output split the way the renderer expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionParams {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

/// AES-128-GCM over identity payloads.
pub struct IdentityCipher {
    cipher: Aes128Gcm,
}

impl std::fmt::Debug for IdentityCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityCipher { .. }")
    }
}

impl IdentityCipher {
    pub fn new(key: &[u8; 16]) -> Self {
        let key = Key::<Aes128Gcm>::from_slice(key);
        Self {
            cipher: Aes128Gcm::new(key),
        }
    }

    /// Encrypt under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptionParams> {
        let mut iv = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut iv);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| Error::Fatal(anyhow::anyhow!("certificate encryption failed: {e}")))?;
        // aes-gcm appends the tag to the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        Ok(EncryptionParams {
            ciphertext: hex::encode_upper(ciphertext),
            iv: hex::encode_upper(iv),
            tag: hex::encode_upper(tag),
        })
    }

    pub fn decrypt(&self, params: &EncryptionParams) -> Result<String> {
        let decode = |name: &str, value: &str| {
            hex::decode(value).map_err(|_| Error::validation(format!("{name} is not valid hex")))
        };
        let iv = decode("iv", &params.iv)?;
        let mut sealed = decode("ciphertext", &params.ciphertext)?;
        let tag = decode("tag", &params.tag)?;
        if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(Error::validation("encryption parameters have the wrong size"));
        }
        sealed.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| Error::validation("encryption parameters do not authenticate"))?;
        String::from_utf8(plaintext).map_err(|_| Error::validation("identity payload is not UTF-8"))
    }

    /// Reuse `existing` when it still seals exactly `payload`, otherwise encrypt anew.
    /// Returns the parameters and whether they were reused.
    pub fn seal(
        &self,
        payload: &IdentityPayload,
        existing: Option<&EncryptionParams>,
    ) -> Result<(EncryptionParams, bool)> {
        let plaintext = payload.encode();
        if let Some(existing) = existing {
            if self.decrypt(existing).is_ok_and(|p| p == plaintext) {
                return Ok((existing.clone(), true));
            }
        }
        Ok((self.encrypt(&plaintext)?, false))
    }
}
