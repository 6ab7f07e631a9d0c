use crate::binding;
use crate::device::{detect_device, ClientFingerprint};
use crate::error::{GateError, GateResult};
use crate::token::{AccessMode, AccessPolicy, AccessToken, DEFAULT_GRACE_MS, START_LENIENCY_MS};

/// Outcome of a successful `/token/verify`. `dirty` tells the caller the
/// record changed and must be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyAccept {
    pub start_at_ms: u64,
    pub dirty: bool,
}

/// Outcome of a successful proxy authorization. When a fresh session id was
/// established it is returned so the handler can scope the cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAccess {
    pub start_at_ms: u64,
    pub dirty: bool,
    pub established_session: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostedAccess {
    pub dirty: bool,
}

/// Validates a token record against policy, short-circuiting on the first
/// failure: expiry, grace deadline, device allowlist, schedule start (with a
/// small leniency for clock skew). Returns the effective start time.
pub fn evaluate(record: &AccessToken, now_ms: u64, user_agent: &str) -> GateResult<u64> {
    if let Some(expires) = record.expires_at_ms {
        if now_ms > expires {
            return Err(GateError::Expired);
        }
    }
    if record.access_policy == AccessPolicy::Unscheduled {
        if let Some(grace) = record.grace_expires_at_ms {
            if now_ms > grace {
                return Err(GateError::GraceExpired);
            }
        }
    }
    if let Some(device) = detect_device(user_agent) {
        if !record.device_allowed(device) {
            return Err(GateError::DeviceNotAllowed);
        }
    }
    let start_at_ms = record.start_at_ms.unwrap_or(now_ms);
    if record.access_policy != AccessPolicy::Unscheduled
        && now_ms.saturating_add(START_LENIENCY_MS) < start_at_ms
    {
        return Err(GateError::TooEarly { start_at_ms });
    }
    Ok(start_at_ms)
}

/// `/token/verify` transition. `mode=token` non-hosted records are single
/// use; hosted records are consumed by the document fetch instead, so verify
/// keeps succeeding until that happens. `mode=proxy` records re-validate the
/// existing binding and the session duration cap.
pub fn verify(
    record: &mut AccessToken,
    fingerprint: &ClientFingerprint,
    now_ms: u64,
) -> GateResult<VerifyAccept> {
    let start_at_ms = evaluate(record, now_ms, &fingerprint.user_agent)?;
    match record.mode {
        AccessMode::Token => {
            if record.hosted() {
                if record.hosted_content_used_at_ms.is_some() {
                    return Err(GateError::AlreadyUsed);
                }
                return Ok(VerifyAccept {
                    start_at_ms,
                    dirty: false,
                });
            }
            if record.used_at_ms.is_some() {
                return Err(GateError::AlreadyUsed);
            }
            record.mark_used(now_ms);
            Ok(VerifyAccept {
                start_at_ms,
                dirty: true,
            })
        }
        AccessMode::Proxy => {
            if let Some(used_at) = record.used_at_ms {
                if !binding::matches(record, fingerprint, now_ms, true) {
                    return Err(GateError::AlreadyUsed);
                }
                if now_ms > used_at.saturating_add(DEFAULT_GRACE_MS) {
                    return Err(GateError::Expired);
                }
            }
            Ok(VerifyAccept {
                start_at_ms,
                dirty: false,
            })
        }
    }
}

/// Proxy-path authorization. A never-used token is claimed by this request;
/// a used one is re-validated against the recorded binding and the session
/// duration cap. `fresh_session_id` is the id the handler will scope into a
/// cookie when the request arrived without one.
///
/// The first-use claim is a plain read-then-write: two simultaneous first
/// requests can both claim, with the store's last write winning. Accepted —
/// the record store has no conditional put.
pub fn authorize_proxy(
    record: &mut AccessToken,
    fingerprint: &ClientFingerprint,
    now_ms: u64,
    fresh_session_id: Option<&str>,
) -> GateResult<ProxyAccess> {
    if record.mode != AccessMode::Proxy {
        return Err(GateError::InvalidMode);
    }
    let start_at_ms = evaluate(record, now_ms, &fingerprint.user_agent)?;

    if let Some(used_at) = record.used_at_ms {
        if !binding::matches(record, fingerprint, now_ms, true) {
            return Err(GateError::AlreadyUsed);
        }
        if now_ms > used_at.saturating_add(DEFAULT_GRACE_MS) {
            return Err(GateError::Expired);
        }
        // The cookie never round-tripped (e.g. first-load document request):
        // adopt the freshly generated session id as the binding id.
        if fingerprint.session_id.is_empty() {
            if let Some(fresh) = fresh_session_id {
                record.used_session_id = Some(fresh.to_string());
                return Ok(ProxyAccess {
                    start_at_ms,
                    dirty: true,
                    established_session: Some(fresh.to_string()),
                });
            }
        }
        return Ok(ProxyAccess {
            start_at_ms,
            dirty: false,
            established_session: None,
        });
    }

    let active_session = if fingerprint.session_id.is_empty() {
        fresh_session_id.unwrap_or("")
    } else {
        fingerprint.session_id.as_str()
    };
    record.bind_proxy_use(now_ms, active_session, &fingerprint.ip, &fingerprint.user_agent);
    Ok(ProxyAccess {
        start_at_ms,
        dirty: true,
        established_session: if fingerprint.session_id.is_empty() {
            fresh_session_id.map(str::to_string)
        } else {
            None
        },
    })
}

/// Hosted-content authorization. Document-shaped requests consume the
/// one-time hosted-document binding; sub-resources only pass the lifecycle
/// checks. The session duration cap applies whenever the proxy-style
/// `used_at_ms` is set, even though the document binding is separate.
pub fn authorize_hosted(
    record: &mut AccessToken,
    fingerprint: &ClientFingerprint,
    now_ms: u64,
    is_document: bool,
) -> GateResult<HostedAccess> {
    evaluate(record, now_ms, &fingerprint.user_agent)?;
    if let Some(used_at) = record.used_at_ms {
        if now_ms > used_at.saturating_add(DEFAULT_GRACE_MS) {
            return Err(GateError::Expired);
        }
    }
    if !is_document {
        return Ok(HostedAccess { dirty: false });
    }
    if record.hosted_content_used_at_ms.is_none() {
        record.bind_hosted_use(now_ms, &fingerprint.ip, &fingerprint.user_agent);
        return Ok(HostedAccess { dirty: true });
    }
    // Repeat document load: no cookie exists on hosted pages, so re-validate
    // the soft IP/UA signals the way the binding guard does.
    if let Some(bound_ip) = record.hosted_used_ip.as_deref().filter(|s| !s.is_empty()) {
        if !fingerprint.ip.is_empty() && bound_ip != fingerprint.ip {
            return Err(GateError::AlreadyUsed);
        }
    }
    if let Some(bound_ua) = record.hosted_used_ua.as_deref().filter(|s| !s.is_empty()) {
        if !fingerprint.user_agent.is_empty() && bound_ua != fingerprint.user_agent {
            return Err(GateError::AlreadyUsed);
        }
    }
    Ok(HostedAccess { dirty: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{AccessConfig, UNSCHEDULED_GRACE_MS};

    const NOW: u64 = 1_700_000_000_000;

    fn fp(session: &str, ip: &str, ua: &str) -> ClientFingerprint {
        ClientFingerprint {
            session_id: session.to_string(),
            ip: ip.to_string(),
            user_agent: ua.to_string(),
        }
    }

    fn desktop_ua() -> &'static str {
        "Mozilla/5.0 (X11; Linux x86_64) Chrome/120.0"
    }

    #[test]
    fn expired_rejects_regardless_of_mode() {
        for mode in [AccessMode::Token, AccessMode::Proxy] {
            let mut record = AccessToken::new(mode, "https://origin.example/");
            record.expires_at_ms = Some(NOW - 1);
            assert_eq!(evaluate(&record, NOW, desktop_ua()), Err(GateError::Expired));
        }
    }

    #[test]
    fn unscheduled_grace_deadline_rejects() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        record.access_policy = AccessPolicy::Unscheduled;
        record.grace_expires_at_ms = Some(NOW + UNSCHEDULED_GRACE_MS);
        assert!(evaluate(&record, NOW + UNSCHEDULED_GRACE_MS, desktop_ua()).is_ok());
        assert_eq!(
            evaluate(&record, NOW + UNSCHEDULED_GRACE_MS + 1_000, desktop_ua()),
            Err(GateError::GraceExpired)
        );
    }

    #[test]
    fn device_gate_rejects_mobile_against_desktop_allowlist() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        record.allowed_devices = Some(vec!["desktop".to_string()]);
        assert_eq!(
            evaluate(&record, NOW, "Mozilla/5.0 (iPhone) Mobile/15E148"),
            Err(GateError::DeviceNotAllowed)
        );
        assert!(evaluate(&record, NOW, desktop_ua()).is_ok());
        // Unknown user-agent is always allowed.
        assert!(evaluate(&record, NOW, "").is_ok());
    }

    #[test]
    fn scheduled_start_has_two_second_leniency() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        record.start_at_ms = Some(NOW);
        assert!(evaluate(&record, NOW - START_LENIENCY_MS, desktop_ua()).is_ok());
        assert_eq!(
            evaluate(&record, NOW - START_LENIENCY_MS - 1, desktop_ua()),
            Err(GateError::TooEarly { start_at_ms: NOW })
        );
    }

    #[test]
    fn token_mode_is_single_use() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        let accept = verify(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW).unwrap();
        assert!(accept.dirty);
        assert_eq!(record.used_at_ms, Some(NOW));

        let second = verify(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW + 1);
        assert_eq!(second, Err(GateError::AlreadyUsed));
        // A different client fares no better.
        let third = verify(&mut record, &fp("", "9.9.9.9", desktop_ua()), NOW + 2);
        assert_eq!(third, Err(GateError::AlreadyUsed));
    }

    #[test]
    fn hosted_token_verify_defers_to_document_binding() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        record.access_config = Some(AccessConfig {
            hosted: Some(true),
            ..AccessConfig::default()
        });
        // Repeated verify calls succeed while the document is unfetched.
        for i in 0..3 {
            let accept = verify(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW + i).unwrap();
            assert!(!accept.dirty);
        }
        record.bind_hosted_use(NOW + 10, "1.2.3.4", desktop_ua());
        assert_eq!(
            verify(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW + 11),
            Err(GateError::AlreadyUsed)
        );
    }

    #[test]
    fn proxy_first_use_claims_binding() {
        let mut record = AccessToken::new(AccessMode::Proxy, "https://origin.example/app/");
        let access =
            authorize_proxy(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW, Some("sess-a"))
                .unwrap();
        assert!(access.dirty);
        assert_eq!(access.established_session.as_deref(), Some("sess-a"));
        assert_eq!(record.used_session_id.as_deref(), Some("sess-a"));
        assert_eq!(record.used_ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn proxy_same_session_accepted_until_duration_cap() {
        let mut record = AccessToken::new(AccessMode::Proxy, "https://origin.example/app/");
        authorize_proxy(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW, Some("sess-a"))
            .unwrap();

        let same = fp("sess-a", "1.2.3.4", desktop_ua());
        let at_cap = authorize_proxy(&mut record, &same, NOW + DEFAULT_GRACE_MS, None).unwrap();
        assert!(!at_cap.dirty);

        let past_cap = authorize_proxy(&mut record, &same, NOW + DEFAULT_GRACE_MS + 1, None);
        assert_eq!(past_cap, Err(GateError::Expired));
    }

    #[test]
    fn proxy_foreign_session_rejected() {
        let mut record = AccessToken::new(AccessMode::Proxy, "https://origin.example/app/");
        authorize_proxy(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW, Some("sess-a"))
            .unwrap();
        let other = authorize_proxy(
            &mut record,
            &fp("sess-b", "1.2.3.4", desktop_ua()),
            NOW + 1_000,
            None,
        );
        assert_eq!(other, Err(GateError::AlreadyUsed));
    }

    #[test]
    fn proxy_rebinds_session_when_cookie_never_round_tripped() {
        let mut record = AccessToken::new(AccessMode::Proxy, "https://origin.example/app/");
        authorize_proxy(&mut record, &fp("", "1.2.3.4", desktop_ua()), NOW, Some("sess-a"))
            .unwrap();
        // Same client, still no cookie (within bootstrap): a new id is adopted.
        let again = authorize_proxy(
            &mut record,
            &fp("", "1.2.3.4", desktop_ua()),
            NOW + 5_000,
            Some("sess-b"),
        )
        .unwrap();
        assert!(again.dirty);
        assert_eq!(record.used_session_id.as_deref(), Some("sess-b"));
    }

    #[test]
    fn hosted_document_binding_is_one_time_and_independent() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        let client = fp("", "1.2.3.4", desktop_ua());
        let first = authorize_hosted(&mut record, &client, NOW, true).unwrap();
        assert!(first.dirty);
        assert_eq!(record.hosted_content_used_at_ms, Some(NOW));
        assert!(record.used_at_ms.is_none(), "proxy binding stays unset");

        // Same client reload passes; a different client does not.
        assert!(authorize_hosted(&mut record, &client, NOW + 1, true).is_ok());
        let stranger = fp("", "9.9.9.9", desktop_ua());
        assert_eq!(
            authorize_hosted(&mut record, &stranger, NOW + 2, true),
            Err(GateError::AlreadyUsed)
        );
    }

    #[test]
    fn hosted_subresources_do_not_consume_binding() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        let client = fp("", "1.2.3.4", desktop_ua());
        let access = authorize_hosted(&mut record, &client, NOW, false).unwrap();
        assert!(!access.dirty);
        assert!(record.hosted_content_used_at_ms.is_none());
    }

    #[test]
    fn hosted_respects_session_cap_from_proxy_binding() {
        let mut record = AccessToken::new(AccessMode::Token, "https://origin.example/");
        record.bind_proxy_use(NOW, "sess-a", "1.2.3.4", desktop_ua());
        let client = fp("", "1.2.3.4", desktop_ua());
        assert_eq!(
            authorize_hosted(&mut record, &client, NOW + DEFAULT_GRACE_MS + 1, true),
            Err(GateError::Expired)
        );
    }
}
