//! Wire types for signing requests and the audit record of issued certificates.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use ssh_key::Certificate;

use crate::error::Result;
use crate::keycodec;

/// Status string for a successful [`SignResponse`].
pub const STATUS_OK: &str = "ok";

/// Status string for a failed [`SignResponse`].
pub const STATUS_ERROR: &str = "error";

/// A request to sign a public key, as posted to `/sign`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Public key in authorized-key text form.
    pub key: String,

    /// Requested expiry. Absent, zero or pre-epoch values mean "server maximum".
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,

    /// Justification for the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl SignRequest {
    /// Create a request for `key` that expires at `valid_until`.
    pub fn new(key: impl Into<String>, valid_until: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            valid_until: Some(valid_until),
            message: String::new(),
        }
    }

    /// Attach a justification message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Response to a `/sign` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    /// Either [`STATUS_OK`] or [`STATUS_ERROR`].
    pub status: String,

    /// The certificate text on success, the error message otherwise.
    pub response: String,
}

impl SignResponse {
    pub fn ok(cert: impl Into<String>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            response: cert.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            response: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Audit projection of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertRecord {
    pub key_id: String,
    pub principals: Vec<String>,
    #[serde(with = "record_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "record_time")]
    pub expires: DateTime<Utc>,
    pub revoked: bool,
    /// Authorized-key text of the certificate. Not exposed over JSON.
    #[serde(skip)]
    pub raw: String,
    #[serde(default)]
    pub message: String,
}

impl CertRecord {
    /// Build a record from a freshly signed certificate.
    pub fn from_certificate(cert: &Certificate) -> Result<Self> {
        Ok(Self {
            key_id: cert.key_id().to_string(),
            principals: cert.valid_principals().to_vec(),
            created_at: unix_to_utc(cert.valid_after()),
            expires: unix_to_utc(cert.valid_before()),
            revoked: false,
            raw: keycodec::marshal_certificate(cert)?,
            message: String::new(),
        })
    }

    /// Attach the justification from the sign request.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// True once `expires` is in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}

/// Convert certificate seconds to a UTC timestamp, saturating out-of-range values.
pub fn unix_to_utc(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// Records render times as "2017-04-11 10:00:00 +0000".
mod record_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        DateTime::parse_from_str(&text, FORMAT)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_request_wire_shape() {
        let json = r#"{"key":"ssh-ed25519 AAAA","valid_until":"2030-01-02T03:04:05Z","message":"deploy"}"#;
        let req: SignRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.key, "ssh-ed25519 AAAA");
        assert_eq!(req.message, "deploy");
        assert_eq!(
            req.valid_until.unwrap().to_rfc3339(),
            "2030-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn test_sign_request_optional_fields() {
        let req: SignRequest = serde_json::from_str(r#"{"key":"k"}"#).unwrap();
        assert!(req.valid_until.is_none());
        assert!(req.message.is_empty());
    }

    #[test]
    fn test_sign_response() {
        let ok = SignResponse::ok("cert");
        assert!(ok.is_ok());
        let err = SignResponse::error("Unauthorized: unauthorized");
        assert!(!err.is_ok());
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"status":"error","response":"Unauthorized: unauthorized"}"#
        );
    }

    #[test]
    fn test_record_json_hides_raw() {
        let record = CertRecord {
            key_id: "alice_1".into(),
            principals: vec!["alice".into()],
            created_at: unix_to_utc(1_491_904_800),
            expires: unix_to_utc(1_491_991_200),
            revoked: false,
            raw: "secret-ish".into(),
            message: String::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("raw").is_none());
        assert_eq!(json["created_at"], "2017-04-11 10:00:00 +0000");
        let back: CertRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.created_at, record.created_at);
    }

    #[test]
    fn test_unix_to_utc_saturates() {
        assert_eq!(unix_to_utc(u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(unix_to_utc(0).timestamp(), 0);
    }
}
