use axum::http::HeaderMap;
use rand::RngCore;

use expgate_core::device::ClientFingerprint;
use expgate_core::token::{DEFAULT_GRACE_MS, MIN_TTL_SECONDS};

pub const SESSION_COOKIE: &str = "access_session";

/// Derives the best-effort client identity from inbound headers: session
/// cookie, forwarded client IP, user-agent.
pub fn client_fingerprint(headers: &HeaderMap) -> ClientFingerprint {
    ClientFingerprint {
        session_id: session_cookie(headers).unwrap_or_default(),
        ip: client_ip(headers).unwrap_or_default(),
        user_agent: header_str(headers, "user-agent").unwrap_or_default(),
    }
}

pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookie_header = header_str(headers, "cookie")?;
    for part in cookie_header.split(';') {
        if let Some((name, value)) = part.trim().split_once('=') {
            if name == SESSION_COOKIE {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        return Some(ip);
    }
    // x-forwarded-for lists the client first.
    header_str(headers, "x-forwarded-for")
        .map(|value| value.split(',').next().unwrap_or("").trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn new_session_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// `Set-Cookie` value scoping the session id to this token's proxy path for
/// the length of the session duration cap.
pub fn session_set_cookie(token: &str, session_id: &str, secure: bool) -> String {
    let max_age = (DEFAULT_GRACE_MS / 1000).max(MIN_TTL_SECONDS);
    format!(
        "{SESSION_COOKIE}={session_id}; Path=/proxy/{token}/; Max-Age={max_age}; SameSite=Lax{}",
        if secure { "; Secure" } else { "" }
    )
}
