use crate::device::ClientFingerprint;
use crate::token::{AccessToken, BOOTSTRAP_GRACE_MS};

/// Decides whether the current request's fingerprint is consistent with the
/// fingerprint recorded at first use. First decisive rule wins:
///
/// 1. Bound session id and presented session id: match iff equal.
/// 2. No bound session id: reject (the caller is the one establishing it).
/// 3. Bound session exists but none was presented (cookie not yet
///    round-tripped): reject on a known-and-different IP or user-agent.
/// 4. Within the bootstrap window of the original binding, accept when asked.
/// 5. Accept iff the record carries any recorded IP or user-agent at all.
///
/// Rule 5 is deliberately lenient so proxied sub-resource fetches that cannot
/// carry the cookie keep working; it is weaker than one-participant-per-token
/// and is kept as-is pending product review.
pub fn matches(
    record: &AccessToken,
    fingerprint: &ClientFingerprint,
    now_ms: u64,
    allow_bootstrap: bool,
) -> bool {
    let bound_session = nonempty(record.used_session_id.as_deref());
    match bound_session {
        Some(bound) if !fingerprint.session_id.is_empty() => {
            return bound == fingerprint.session_id
        }
        None => return false,
        Some(_) => {}
    }

    let bound_ip = nonempty(record.used_ip.as_deref());
    if let Some(bound) = bound_ip {
        if !fingerprint.ip.is_empty() && bound != fingerprint.ip {
            return false;
        }
    }
    let bound_ua = nonempty(record.used_ua.as_deref());
    if let Some(bound) = bound_ua {
        if !fingerprint.user_agent.is_empty() && bound != fingerprint.user_agent {
            return false;
        }
    }

    if allow_bootstrap {
        if let Some(used_at) = record.used_at_ms {
            if now_ms.saturating_sub(used_at) <= BOOTSTRAP_GRACE_MS {
                return true;
            }
        }
    }

    bound_ip.is_some() || bound_ua.is_some()
}

fn nonempty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}
