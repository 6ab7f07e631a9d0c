#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Base URL participants reach the gateway under; anchors absolute
    /// `<base>` hrefs and the Secure flag on session cookies.
    pub public_base_url: String,
    /// Cap on inbound request bodies (verify payloads, telemetry envelopes,
    /// proxied uploads).
    pub max_body_bytes: usize,
    /// Shared legacy bundle namespace consulted when a prefixed hosted key
    /// misses.
    pub legacy_bundle_prefix: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://127.0.0.1:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
            legacy_bundle_prefix: "bundles".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn secure_cookies(&self) -> bool {
        self.public_base_url.starts_with("https:")
    }

    pub fn collect_url(&self) -> String {
        format!("{}/data/collect", self.public_base_url)
    }
}
