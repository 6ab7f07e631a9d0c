/// Best-effort identity signal derived from an inbound request. The session
/// id is the preferred binding key; IP and user-agent are the soft fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFingerprint {
    pub session_id: String,
    pub ip: String,
    pub user_agent: String,
}

impl ClientFingerprint {
    pub fn device(&self) -> Option<DeviceClass> {
        detect_device(&self.user_agent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
        }
    }
}

const TABLET_SIGNATURES: &[&str] = &["ipad", "tablet", "playbook", "silk"];
const MOBILE_SIGNATURES: &[&str] = &["mobile", "iphone", "ipod", "windows phone"];

/// Three-way classification of a user-agent string. An empty or missing
/// user-agent yields `None` and is treated as always-allowed by the device
/// gate.
pub fn detect_device(user_agent: &str) -> Option<DeviceClass> {
    let ua = user_agent.trim().to_ascii_lowercase();
    if ua.is_empty() {
        return None;
    }
    let android_non_mobile = ua.contains("android") && !ua.contains("mobile");
    if TABLET_SIGNATURES.iter().any(|s| ua.contains(s)) || android_non_mobile {
        return Some(DeviceClass::Tablet);
    }
    if MOBILE_SIGNATURES.iter().any(|s| ua.contains(s)) {
        return Some(DeviceClass::Mobile);
    }
    Some(DeviceClass::Desktop)
}
