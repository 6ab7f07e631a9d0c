use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::DeviceClass;

/// Session duration cap: how long a bound proxy/hosted token keeps working
/// after first use, independent of the schedule window.
pub const DEFAULT_GRACE_MS: u64 = 2 * 60 * 60 * 1000;
/// Unscheduled tokens must be started within this window of the first
/// access-page view.
pub const UNSCHEDULED_GRACE_MS: u64 = 10 * 60 * 1000;
/// Post-first-use interval during which fingerprint mismatches are tolerated
/// while the session cookie propagates.
pub const BOOTSTRAP_GRACE_MS: u64 = 20 * 1000;
/// Scheduled starts accept requests this much before `start_at_ms` to absorb
/// client clock skew.
pub const START_LENIENCY_MS: u64 = 2_000;
/// Floor on the persisted record TTL.
pub const MIN_TTL_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Participant is redirected to an external URL carrying the token.
    Token,
    /// Participant is tunneled through the reverse proxy.
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    #[default]
    Scheduled,
    Unscheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    #[default]
    UploadOnly,
    DownloadOnly,
    DownloadAndUpload,
}

impl DownloadPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UploadOnly => "upload_only",
            Self::DownloadOnly => "download_only",
            Self::DownloadAndUpload => "download_and_upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload_only" => Some(Self::UploadOnly),
            "download_only" => Some(Self::DownloadOnly),
            "download_and_upload" => Some(Self::DownloadAndUpload),
            _ => None,
        }
    }
}

/// Free-form policy block carried by the record. Unknown keys round-trip
/// through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_policy: Option<DownloadPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Persisted access-token record, keyed in the store by the opaque token
/// string. Immutable except for the lazy grace-window initialization and the
/// one-time binding writes; binding fields, once set, are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub mode: AccessMode,
    pub target_url: String,
    #[serde(default)]
    pub access_policy: AccessPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_devices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_config: Option<AccessConfig>,

    // Usage binding, set once at first successful use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_ua: Option<String>,

    // Hosted-document binding, independent of the proxy binding above.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_content_used_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_used_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_used_ua: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccessToken {
    pub fn new(mode: AccessMode, target_url: impl Into<String>) -> Self {
        Self {
            mode,
            target_url: target_url.into(),
            access_policy: AccessPolicy::default(),
            start_at_ms: None,
            expires_at_ms: None,
            grace_expires_at_ms: None,
            allowed_devices: None,
            access_config: None,
            used_at_ms: None,
            used_at: None,
            used_session_id: None,
            used_ip: None,
            used_ua: None,
            hosted_content_used_at_ms: None,
            hosted_used_ip: None,
            hosted_used_ua: None,
            extra: Map::new(),
        }
    }

    pub fn hosted(&self) -> bool {
        self.access_config
            .as_ref()
            .and_then(|c| c.hosted)
            .unwrap_or(false)
    }

    pub fn download_policy(&self) -> DownloadPolicy {
        self.access_config
            .as_ref()
            .and_then(|c| c.download_policy)
            .unwrap_or_default()
    }

    /// Empty or absent allowlist admits every device.
    pub fn device_allowed(&self, device: DeviceClass) -> bool {
        match self.allowed_devices.as_deref() {
            None | Some([]) => true,
            Some(allowed) => allowed.iter().any(|d| d == device.as_str()),
        }
    }

    /// Store TTL in seconds, derived from whichever expiry is present and
    /// floored at [`MIN_TTL_SECONDS`].
    pub fn ttl_seconds(&self, now_ms: u64) -> u64 {
        let expires = self
            .expires_at_ms
            .or(self.grace_expires_at_ms)
            .unwrap_or_else(|| now_ms.saturating_add(DEFAULT_GRACE_MS));
        (expires.saturating_sub(now_ms) / 1000).max(MIN_TTL_SECONDS)
    }

    /// Single-use consumption for `mode=token` records: timestamps only.
    pub fn mark_used(&mut self, now_ms: u64) {
        self.used_at_ms = Some(now_ms);
        self.used_at = Some(rfc3339_ms(now_ms));
    }

    /// One-time proxy usage binding.
    pub fn bind_proxy_use(&mut self, now_ms: u64, session_id: &str, ip: &str, ua: &str) {
        self.mark_used(now_ms);
        self.used_session_id = Some(session_id.to_string());
        self.used_ip = Some(ip.to_string());
        self.used_ua = Some(ua.to_string());
    }

    /// One-time hosted-document usage binding, separate from the proxy one.
    pub fn bind_hosted_use(&mut self, now_ms: u64, ip: &str, ua: &str) {
        self.hosted_content_used_at_ms = Some(now_ms);
        self.hosted_used_ip = Some(ip.to_string());
        self.hosted_used_ua = Some(ua.to_string());
    }
}

fn rfc3339_ms(now_ms: u64) -> String {
    DateTime::from_timestamp_millis(now_ms as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_json_round_trips_with_unknown_fields() {
        let raw = json!({
            "mode": "proxy",
            "target_url": "https://origin.example/app/index.html",
            "access_policy": "unscheduled",
            "grace_expires_at_ms": 1_700_000_000_000_u64,
            "allowed_devices": ["desktop"],
            "access_config": {
                "download_policy": "upload_only",
                "hosted": true,
                "experiment_label": "pilot-3"
            },
            "issued_by": "operator-7"
        });
        let record: AccessToken = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.mode, AccessMode::Proxy);
        assert_eq!(record.access_policy, AccessPolicy::Unscheduled);
        assert!(record.hosted());
        assert_eq!(record.download_policy(), DownloadPolicy::UploadOnly);

        // Unknown fields survive the round trip through the extra bags.
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["issued_by"], "operator-7");
        assert_eq!(back["access_config"]["experiment_label"], "pilot-3");
        assert!(back.get("used_at_ms").is_none());
    }

    #[test]
    fn ttl_prefers_expiry_then_grace_then_default() {
        let now = 1_000_000;
        let mut record = AccessToken::new(AccessMode::Token, "https://x.example/");
        assert_eq!(record.ttl_seconds(now), DEFAULT_GRACE_MS / 1000);

        record.grace_expires_at_ms = Some(now + 600_000);
        assert_eq!(record.ttl_seconds(now), 600);

        record.expires_at_ms = Some(now + 90_000);
        assert_eq!(record.ttl_seconds(now), 90);
    }

    #[test]
    fn ttl_never_drops_below_floor() {
        let mut record = AccessToken::new(AccessMode::Token, "https://x.example/");
        record.expires_at_ms = Some(1_000);
        assert_eq!(record.ttl_seconds(999_000), MIN_TTL_SECONDS);
    }

    #[test]
    fn empty_allowlist_admits_all_devices() {
        let mut record = AccessToken::new(AccessMode::Token, "https://x.example/");
        assert!(record.device_allowed(DeviceClass::Mobile));
        record.allowed_devices = Some(vec![]);
        assert!(record.device_allowed(DeviceClass::Mobile));
        record.allowed_devices = Some(vec!["desktop".to_string()]);
        assert!(!record.device_allowed(DeviceClass::Mobile));
        assert!(record.device_allowed(DeviceClass::Desktop));
    }

    #[test]
    fn mark_used_writes_both_timestamp_forms() {
        let mut record = AccessToken::new(AccessMode::Token, "https://x.example/");
        record.mark_used(1_700_000_000_123);
        assert_eq!(record.used_at_ms, Some(1_700_000_000_123));
        let iso = record.used_at.unwrap();
        assert!(iso.starts_with("2023-11-14T"), "{iso}");
        assert!(iso.ends_with('Z'));
    }
}
