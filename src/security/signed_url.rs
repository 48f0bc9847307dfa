//! Capability URLs for protected resources.
//!
//! A signed URL carries every signed field in its query string, so
//! validation re-derives the HMAC from what the client sends back and needs
//! no server-side lookup. Changing any signed field invalidates the
//! signature.
//!
//! # Wire format
//! ```text
//! https://cdn.example.com/v1/files/abc.png
//!     ?expires_at=1735689600      unix seconds
//!     &method=GET
//!     &ip_address=203.0.113.9     only when bound
//!     &user_agent=...             only when bound
//!     &referer=...                only when bound
//!     &user_id=u_42               only when set
//!     &metadata=eyJ...            base64url JSON, only when non-empty
//!     &signature=9f2c...          hex HMAC-SHA256
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use url::Url;

use crate::clock::SharedClock;
use crate::config::SignedUrlConfig;
use crate::errors::{Classify, ErrorType};
use crate::observability::metrics;

type HmacSha256 = Hmac<Sha256>;

/// Parameters of a URL to sign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignedUrlRequest {
    /// Absolute resource path, e.g. `/v1/files/abc.png`.
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Lifetime; the configured default when unset.
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl SignedUrlRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: default_method(),
            ..Default::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn expires_in(mut self, lifetime: Duration) -> Self {
        self.expires_in_secs = Some(lifetime.as_secs());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn bind_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn bind_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn bind_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An issued capability URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub path: String,
    pub method: String,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The verified contents of a signed URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedUrl {
    pub path: String,
    pub method: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// Document the HMAC is computed over. Field order is part of the format.
#[derive(Serialize)]
struct CanonicalDocument<'a> {
    path: &'a str,
    method: &'a str,
    expires_at: i64,
    ip_address: &'a str,
    user_agent: &'a str,
    referer: &'a str,
    user_id: &'a str,
    metadata: &'a BTreeMap<String, Value>,
}

/// Errors while issuing a signed URL.
#[derive(Debug, Error)]
pub enum SignedUrlError {
    #[error("signing key is not configured")]
    MissingKey,

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("invalid resource path '{0}'")]
    InvalidPath(String),

    #[error("requested lifetime of {requested}s exceeds the maximum of {max}s")]
    ExpiryTooLong { requested: u64, max: u64 },

    #[error("failed to encode signed fields: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Classify for SignedUrlError {
    fn error_type(&self) -> ErrorType {
        match self {
            SignedUrlError::InvalidPath(_) | SignedUrlError::ExpiryTooLong { .. } => {
                ErrorType::Validation
            }
            SignedUrlError::MissingKey
            | SignedUrlError::InvalidBaseUrl(_)
            | SignedUrlError::Encoding(_) => ErrorType::System,
        }
    }
}

/// Why a signed URL was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("malformed_url")]
    MalformedUrl,
    #[error("missing_signature")]
    MissingSignature,
    #[error("missing_expiry")]
    MissingExpiry,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("expired")]
    Expired,
    #[error("ip_mismatch")]
    IpMismatch,
    #[error("user_agent_mismatch")]
    UserAgentMismatch,
    #[error("referer_mismatch")]
    RefererMismatch,
}

impl ValidationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationFailure::MalformedUrl => "malformed_url",
            ValidationFailure::MissingSignature => "missing_signature",
            ValidationFailure::MissingExpiry => "missing_expiry",
            ValidationFailure::InvalidSignature => "invalid_signature",
            ValidationFailure::Expired => "expired",
            ValidationFailure::IpMismatch => "ip_mismatch",
            ValidationFailure::UserAgentMismatch => "user_agent_mismatch",
            ValidationFailure::RefererMismatch => "referer_mismatch",
        }
    }
}

impl Classify for ValidationFailure {
    fn error_type(&self) -> ErrorType {
        match self {
            ValidationFailure::MalformedUrl
            | ValidationFailure::MissingSignature
            | ValidationFailure::MissingExpiry
            | ValidationFailure::Expired => ErrorType::Authorization,
            ValidationFailure::InvalidSignature
            | ValidationFailure::IpMismatch
            | ValidationFailure::UserAgentMismatch
            | ValidationFailure::RefererMismatch => ErrorType::Security,
        }
    }
}

/// Issues and verifies signed URLs. Holds no mutable state.
#[derive(Debug)]
pub struct SignedUrlService {
    config: SignedUrlConfig,
    base_url: Url,
    clock: SharedClock,
}

impl SignedUrlService {
    pub fn new(config: SignedUrlConfig, clock: SharedClock) -> Result<Self, SignedUrlError> {
        if config.signing_key.is_empty() {
            return Err(SignedUrlError::MissingKey);
        }
        let base_url = Url::parse(&config.base_url)?;
        Ok(Self {
            config,
            base_url,
            clock,
        })
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(self.config.signing_key.as_bytes()).ok()
    }

    fn digest(&self, document: &CanonicalDocument<'_>) -> Result<HmacSha256, SignedUrlError> {
        let payload = serde_json::to_vec(document)?;
        let mut mac = self.mac().ok_or(SignedUrlError::MissingKey)?;
        mac.update(&payload);
        Ok(mac)
    }

    /// Sign a request and render it as a self-contained URL.
    pub fn generate_signed_url(&self, request: &SignedUrlRequest) -> Result<SignedUrl, SignedUrlError> {
        if !request.path.starts_with('/') || request.path.contains(['?', '#']) {
            return Err(SignedUrlError::InvalidPath(request.path.clone()));
        }

        let lifetime = request
            .expires_in_secs
            .unwrap_or(self.config.default_expiry_secs);
        if lifetime > self.config.max_expiry_secs {
            return Err(SignedUrlError::ExpiryTooLong {
                requested: lifetime,
                max: self.config.max_expiry_secs,
            });
        }

        let mut url = self.base_url.join(&request.path)?;
        let path = url.path().to_string();
        let method = request.method.to_ascii_uppercase();
        let expires_at = i64::try_from(lifetime)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
            .ok_or(SignedUrlError::ExpiryTooLong {
                requested: lifetime,
                max: self.config.max_expiry_secs,
            })?
            .timestamp();

        let ip_address = request.ip_address.as_deref().unwrap_or_default();
        let user_agent = request.user_agent.as_deref().unwrap_or_default();
        let referer = request.referer.as_deref().unwrap_or_default();
        let user_id = request.user_id.as_deref().unwrap_or_default();

        let signature = hex::encode(
            self.digest(&CanonicalDocument {
                path: &path,
                method: &method,
                expires_at,
                ip_address,
                user_agent,
                referer,
                user_id,
                metadata: &request.metadata,
            })?
            .finalize()
            .into_bytes(),
        );

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("expires_at", &expires_at.to_string());
            query.append_pair("method", &method);
            for (key, value) in [
                ("ip_address", ip_address),
                ("user_agent", user_agent),
                ("referer", referer),
                ("user_id", user_id),
            ] {
                if !value.is_empty() {
                    query.append_pair(key, value);
                }
            }
            if !request.metadata.is_empty() {
                let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&request.metadata)?);
                query.append_pair("metadata", &encoded);
            }
            query.append_pair("signature", &signature);
        }

        let expires_at = DateTime::from_timestamp(expires_at, 0).unwrap_or_default();
        tracing::debug!(path = %path, method = %method, expires_at = %expires_at, "Issued signed URL");

        Ok(SignedUrl {
            url: url.into(),
            path,
            method,
            expires_at,
            signature,
            user_id: request.user_id.clone(),
        })
    }

    /// Signed `GET` URL with the default lifetime.
    pub fn generate_download_url(&self, path: &str, user_id: &str) -> Result<SignedUrl, SignedUrlError> {
        self.generate_signed_url(&SignedUrlRequest::new(path).user(user_id))
    }

    /// Signed `PUT` URL with the default lifetime.
    pub fn generate_upload_url(&self, path: &str, user_id: &str) -> Result<SignedUrl, SignedUrlError> {
        self.generate_signed_url(&SignedUrlRequest::new(path).method("PUT").user(user_id))
    }

    /// Verify a signed URL presented by a client.
    ///
    /// `url` may be absolute or an origin-relative `path?query` as seen by
    /// the HTTP layer. The signature is checked before expiry and bindings;
    /// bindings are only enforced when enabled in config.
    pub fn validate_signed_url(
        &self,
        url: &str,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Result<ValidatedUrl, ValidationFailure> {
        let result = self.validate_inner(url, client_ip, user_agent, referer);
        let outcome = match &result {
            Ok(_) => "valid",
            Err(failure) => failure.as_str(),
        };
        metrics::record_signed_url_validation(outcome);
        if let Err(failure) = &result {
            tracing::info!(reason = %failure, client_ip = ?client_ip, "Signed URL rejected");
        }
        result
    }

    fn validate_inner(
        &self,
        raw: &str,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Result<ValidatedUrl, ValidationFailure> {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .join(raw)
                .map_err(|_| ValidationFailure::MalformedUrl)?,
            Err(_) => return Err(ValidationFailure::MalformedUrl),
        };

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let param = |key: &str| params.get(key).map(String::as_str).unwrap_or_default();

        let signature = params
            .get("signature")
            .ok_or(ValidationFailure::MissingSignature)?;
        let expires_at: i64 = params
            .get("expires_at")
            .ok_or(ValidationFailure::MissingExpiry)?
            .parse()
            .map_err(|_| ValidationFailure::MalformedUrl)?;

        let metadata: BTreeMap<String, Value> = match params.get("metadata") {
            Some(encoded) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(|_| ValidationFailure::MalformedUrl)?;
                serde_json::from_slice(&bytes).map_err(|_| ValidationFailure::MalformedUrl)?
            }
            None => BTreeMap::new(),
        };

        let method = params
            .get("method")
            .cloned()
            .unwrap_or_else(default_method);
        let bound_ip = param("ip_address");
        let bound_user_agent = param("user_agent");
        let bound_referer = param("referer");
        let user_id = param("user_id");

        let mac = self
            .digest(&CanonicalDocument {
                path: url.path(),
                method: &method,
                expires_at,
                ip_address: bound_ip,
                user_agent: bound_user_agent,
                referer: bound_referer,
                user_id,
                metadata: &metadata,
            })
            .map_err(|_| ValidationFailure::InvalidSignature)?;
        let provided = hex::decode(signature).map_err(|_| ValidationFailure::InvalidSignature)?;
        mac.verify_slice(&provided)
            .map_err(|_| ValidationFailure::InvalidSignature)?;

        let expires = DateTime::from_timestamp(expires_at, 0).ok_or(ValidationFailure::MalformedUrl)?;
        if self.clock.now() > expires {
            return Err(ValidationFailure::Expired);
        }

        if self.config.bind_ip && !bound_ip.is_empty() && client_ip != Some(bound_ip) {
            return Err(ValidationFailure::IpMismatch);
        }
        if self.config.bind_user_agent
            && !bound_user_agent.is_empty()
            && user_agent != Some(bound_user_agent)
        {
            return Err(ValidationFailure::UserAgentMismatch);
        }
        if self.config.bind_referer && !bound_referer.is_empty() && referer != Some(bound_referer) {
            return Err(ValidationFailure::RefererMismatch);
        }

        Ok(ValidatedUrl {
            path: url.path().to_string(),
            method,
            expires_at: expires,
            user_id: (!user_id.is_empty()).then(|| user_id.to_string()),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::TimeZone;
    use std::sync::Arc;

    const KEY: &str = "test-signing-key-0123456789abcdef";

    fn service(config: SignedUrlConfig) -> (SignedUrlService, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap());
        let service = SignedUrlService::new(config, Arc::new(clock.clone())).unwrap();
        (service, clock)
    }

    fn config() -> SignedUrlConfig {
        SignedUrlConfig {
            signing_key: KEY.to_string(),
            base_url: "https://cdn.example.com".to_string(),
            ..Default::default()
        }
    }

    fn bound_request() -> SignedUrlRequest {
        SignedUrlRequest::new("/v1/files/cat.png")
            .user("u_42")
            .bind_ip("203.0.113.9")
            .bind_user_agent("Mozilla/5.0")
            .bind_referer("https://app.example.com/")
            .metadata("conversion_id", "conv_7")
            .expires_in(Duration::from_secs(600))
    }

    /// Rewrite one query parameter with a single character changed.
    fn tamper_param(raw: &str, key: &str) -> String {
        let mut url = Url::parse(raw).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        url.query_pairs_mut().clear();
        for (k, v) in pairs {
            let v = if k == key { flip_last(&v) } else { v };
            url.query_pairs_mut().append_pair(&k, &v);
        }
        url.to_string()
    }

    fn flip_last(value: &str) -> String {
        let mut chars: Vec<char> = value.chars().collect();
        let last = chars.pop().unwrap();
        let replacement = match last {
            '0'..='8' => char::from(last as u8 + 1),
            '9' => '0',
            'a' => 'b',
            _ => 'a',
        };
        chars.push(replacement);
        chars.into_iter().collect()
    }

    #[test]
    fn test_round_trip_with_bindings() {
        let mut cfg = config();
        cfg.bind_ip = true;
        cfg.bind_user_agent = true;
        cfg.bind_referer = true;
        let (service, _clock) = service(cfg);

        let signed = service.generate_signed_url(&bound_request()).unwrap();
        assert!(signed.url.starts_with("https://cdn.example.com/v1/files/cat.png?"));
        assert_eq!(signed.signature.len(), 64);

        let validated = service
            .validate_signed_url(
                &signed.url,
                Some("203.0.113.9"),
                Some("Mozilla/5.0"),
                Some("https://app.example.com/"),
            )
            .unwrap();
        assert_eq!(validated.path, "/v1/files/cat.png");
        assert_eq!(validated.method, "GET");
        assert_eq!(validated.user_id.as_deref(), Some("u_42"));
        assert_eq!(validated.metadata["conversion_id"], "conv_7");
    }

    #[test]
    fn test_tampering_any_signed_field_breaks_signature() {
        let (service, _clock) = service(config());
        let signed = service.generate_signed_url(&bound_request()).unwrap();

        for key in [
            "expires_at",
            "method",
            "ip_address",
            "user_agent",
            "referer",
            "user_id",
            "signature",
        ] {
            let tampered = tamper_param(&signed.url, key);
            assert_eq!(
                service.validate_signed_url(&tampered, Some("203.0.113.9"), None, None),
                Err(ValidationFailure::InvalidSignature),
                "tampering {key} should be detected"
            );
        }

        let tampered_path = signed.url.replacen("cat.png", "cat.pnh", 1);
        assert_eq!(
            service.validate_signed_url(&tampered_path, None, None, None),
            Err(ValidationFailure::InvalidSignature)
        );
    }

    #[test]
    fn test_tampered_metadata_is_rejected() {
        let (service, _clock) = service(config());
        let signed = service.generate_signed_url(&bound_request()).unwrap();

        let forged = URL_SAFE_NO_PAD.encode(br#"{"conversion_id":"conv_8"}"#);
        let mut url = Url::parse(&signed.url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        url.query_pairs_mut().clear();
        for (k, v) in pairs {
            let v = if k == "metadata" { forged.clone() } else { v };
            url.query_pairs_mut().append_pair(&k, &v);
        }

        assert_eq!(
            service.validate_signed_url(url.as_str(), None, None, None),
            Err(ValidationFailure::InvalidSignature)
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let (service, clock) = service(config());
        let issued_at = clock.now();
        let signed = service
            .generate_signed_url(&SignedUrlRequest::new("/v1/files/a.webp").expires_in(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(signed.expires_at, issued_at + TimeDelta::seconds(60));

        clock.set(signed.expires_at);
        assert!(service.validate_signed_url(&signed.url, None, None, None).is_ok());

        clock.set(signed.expires_at + TimeDelta::microseconds(1));
        assert_eq!(
            service.validate_signed_url(&signed.url, None, None, None),
            Err(ValidationFailure::Expired)
        );
    }

    #[test]
    fn test_bindings_only_enforced_when_enabled() {
        let (lenient, _clock) = service(config());
        let signed = lenient.generate_signed_url(&bound_request()).unwrap();
        assert!(lenient
            .validate_signed_url(&signed.url, Some("198.51.100.1"), Some("curl/8"), None)
            .is_ok());

        let mut cfg = config();
        cfg.bind_ip = true;
        cfg.bind_user_agent = true;
        let (strict, _clock) = service(cfg);
        assert_eq!(
            strict.validate_signed_url(&signed.url, Some("198.51.100.1"), Some("Mozilla/5.0"), None),
            Err(ValidationFailure::IpMismatch)
        );
        assert_eq!(
            strict.validate_signed_url(&signed.url, Some("203.0.113.9"), Some("curl/8"), None),
            Err(ValidationFailure::UserAgentMismatch)
        );
    }

    #[test]
    fn test_relative_urls_are_accepted() {
        let (service, _clock) = service(config());
        let signed = service.generate_download_url("/v1/files/x.jpg", "u_1").unwrap();
        let relative = &signed.url["https://cdn.example.com".len()..];

        let validated = service.validate_signed_url(relative, None, None, None).unwrap();
        assert_eq!(validated.user_id.as_deref(), Some("u_1"));
    }

    #[test]
    fn test_missing_parts() {
        let (service, _clock) = service(config());
        assert_eq!(
            service.validate_signed_url("/v1/files/x.jpg?expires_at=1", None, None, None),
            Err(ValidationFailure::MissingSignature)
        );
        assert_eq!(
            service.validate_signed_url("/v1/files/x.jpg?signature=00", None, None, None),
            Err(ValidationFailure::MissingExpiry)
        );
        assert_eq!(
            service.validate_signed_url("/v1/files/x.jpg?expires_at=soon&signature=00", None, None, None),
            Err(ValidationFailure::MalformedUrl)
        );
    }

    #[test]
    fn test_upload_url_signs_put() {
        let (service, _clock) = service(config());
        let signed = service.generate_upload_url("/v1/uploads/in.png", "u_9").unwrap();
        assert_eq!(signed.method, "PUT");

        let validated = service.validate_signed_url(&signed.url, None, None, None).unwrap();
        assert_eq!(validated.method, "PUT");
    }

    #[test]
    fn test_generation_limits() {
        let (service, _clock) = service(config());
        let too_long = SignedUrlRequest::new("/a").expires_in(Duration::from_secs(30 * 24 * 3_600));
        assert!(matches!(
            service.generate_signed_url(&too_long),
            Err(SignedUrlError::ExpiryTooLong { .. })
        ));
        assert!(matches!(
            service.generate_signed_url(&SignedUrlRequest::new("relative/path")),
            Err(SignedUrlError::InvalidPath(_))
        ));
        assert!(matches!(
            SignedUrlService::new(SignedUrlConfig::default(), crate::clock::system_clock()),
            Err(SignedUrlError::MissingKey)
        ));
    }

    #[test]
    fn test_unrepresentable_lifetime_is_rejected() {
        let mut unbounded = config();
        unbounded.max_expiry_secs = u64::MAX;
        let (service, _clock) = service(unbounded);

        let forever = SignedUrlRequest::new("/a").expires_in(Duration::from_secs(u64::MAX - 1));
        assert!(matches!(
            service.generate_signed_url(&forever),
            Err(SignedUrlError::ExpiryTooLong { .. })
        ));
    }
}
