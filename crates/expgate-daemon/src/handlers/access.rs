use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use expgate_core::error::{GateError, GateResult};
use expgate_core::token::{AccessMode, AccessPolicy, AccessToken, UNSCHEDULED_GRACE_MS};

use crate::records::{load_token, save_token};
use crate::server::{text_error, GatewayState};
use crate::session::client_fingerprint;

/// `GET /access/:token` — waiting-room page. Lazily starts the unscheduled
/// grace window and tells the page whether the current device qualifies.
pub async fn access_page(
    State(state): State<GatewayState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    match access_page_impl(&state, &token, &headers) {
        Ok(html) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            html,
        )
            .into_response(),
        Err(err) => text_error(&err),
    }
}

fn access_page_impl(
    state: &GatewayState,
    token: &str,
    headers: &HeaderMap,
) -> GateResult<String> {
    if token.is_empty() {
        return Err(GateError::MissingToken);
    }
    let now = state.now_ms();
    let mut record = load_token(state.records.as_ref(), token, now)?.ok_or(GateError::NotFound)?;
    if let Some(expires) = record.expires_at_ms {
        if now > expires {
            return Err(GateError::Expired);
        }
    }
    if record.access_policy == AccessPolicy::Unscheduled
        && record.grace_expires_at_ms.map_or(true, |grace| now > grace)
    {
        record.grace_expires_at_ms = Some(now + UNSCHEDULED_GRACE_MS);
        save_token(state.records.as_ref(), token, &record, now)?;
        tracing::info!(token = %token, grace_until = ?record.grace_expires_at_ms, "grace window started");
    }

    let fingerprint = client_fingerprint(headers);
    let device_ok = fingerprint
        .device()
        .map_or(true, |device| record.device_allowed(device));

    Ok(waiting_page(token, &record, device_ok, now))
}

fn waiting_page(token: &str, record: &AccessToken, device_ok: bool, now: u64) -> String {
    let unscheduled = record.access_policy == AccessPolicy::Unscheduled;
    let start_ms = record.start_at_ms.unwrap_or(now);
    let grace_until_ms = record
        .grace_expires_at_ms
        .unwrap_or(now + UNSCHEDULED_GRACE_MS);
    let target_url = match record.mode {
        AccessMode::Token => append_token(&record.target_url, token),
        AccessMode::Proxy => format!("/proxy/{token}/"),
    };
    let policy_note = if unscheduled {
        "Enter within 10 minutes. The link can only be started once, so begin when you are ready."
    } else {
        "Do not refresh the page once the experiment has started."
    };

    WAITING_PAGE
        .replace("__POLICY_NOTE__", policy_note)
        .replace(
            "__START_DISPLAY__",
            if unscheduled { "inline-block" } else { "none" },
        )
        .replace("__START_MS__", &start_ms.to_string())
        .replace("__IS_UNSCHEDULED__", bool_js(unscheduled))
        .replace("__GRACE_UNTIL_MS__", &grace_until_ms.to_string())
        .replace("__DEVICE_OK__", bool_js(device_ok))
        .replace("__TARGET_URL__", &js_string(&target_url))
        .replace("__TOKEN__", &js_string(token))
}

/// Appends `access_token` to an external target URL; a target that fails to
/// parse is used as-is.
fn append_token(target_url: &str, token: &str) -> String {
    match url::Url::parse(target_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("access_token", token);
            url.to_string()
        }
        Err(_) => target_url.to_string(),
    }
}

const fn bool_js(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

const WAITING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Experiment waiting room</title>
  <style>
    body { font-family: system-ui, sans-serif; background: #f6f7fb; color: #1f2937; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }
    .card { max-width: 520px; background: #fff; border-radius: 20px; padding: 2rem; box-shadow: 0 20px 40px rgba(0,0,0,0.12); text-align: center; }
    .hint { color: #6b7280; font-size: 0.95rem; }
    .timer { font-size: 2rem; font-weight: 700; margin: 1rem 0; }
    .warn { color: #b42318; }
    .primary { border: none; padding: 0.75rem 1.6rem; border-radius: 12px; background: #2563eb; color: #fff; font-weight: 600; cursor: pointer; }
    .primary[disabled] { opacity: 0.6; cursor: not-allowed; }
  </style>
</head>
<body>
  <div class="card">
    <h2>Your experiment is about to begin</h2>
    <p class="hint">__POLICY_NOTE__</p>
    <div class="timer" id="timer">--:--</div>
    <button class="primary" id="startBtn" style="display:__START_DISPLAY__">I am ready, enter the experiment</button>
    <p class="hint" id="status"></p>
  </div>
  <script>
    const startMs = __START_MS__;
    const isUnscheduled = __IS_UNSCHEDULED__;
    const graceUntilMs = __GRACE_UNTIL_MS__;
    const deviceOk = __DEVICE_OK__;
    const targetUrl = __TARGET_URL__;
    const token = __TOKEN__;
    const statusEl = document.getElementById("status");
    const timerEl = document.getElementById("timer");
    const startBtn = document.getElementById("startBtn");

    if (!deviceOk) {
      statusEl.textContent = "This device is not allowed for this experiment. Open the link on a permitted device.";
      statusEl.classList.add("warn");
    }

    function format(ms) {
      const s = Math.max(0, Math.floor(ms / 1000));
      const m = Math.floor(s / 60);
      const r = s % 60;
      return String(m) + ":" + String(r).padStart(2, "0");
    }

    function expire() {
      statusEl.textContent = "The entry window has passed. Ask the operator for a new link.";
      statusEl.classList.add("warn");
      if (startBtn) {
        startBtn.disabled = true;
        startBtn.textContent = "Link expired";
      }
    }

    function tick() {
      const now = Date.now();
      if (isUnscheduled) {
        const remaining = graceUntilMs - now;
        timerEl.textContent = format(remaining);
        if (remaining <= 0) expire();
        return;
      }
      const remaining = startMs - now;
      timerEl.textContent = format(remaining);
      if (remaining <= 0 && deviceOk) {
        statusEl.textContent = "Entering the experiment...";
        location.href = targetUrl;
      }
    }

    if (startBtn) {
      startBtn.addEventListener("click", async () => {
        if (!deviceOk) return;
        if (Date.now() > graceUntilMs) { expire(); return; }
        statusEl.textContent = "Verifying...";
        try {
          const resp = await fetch("/token/verify", {
            method: "POST",
            headers: { "Content-Type": "application/json" },
            body: JSON.stringify({ token: token }),
          });
          if (!resp.ok) {
            const data = await resp.json().catch(() => ({}));
            statusEl.textContent = data.error || "Access token rejected";
            statusEl.classList.add("warn");
            return;
          }
          statusEl.textContent = "Entering the experiment...";
          location.href = targetUrl;
        } catch {
          statusEl.textContent = "Verification failed. Check your connection and try again.";
          statusEl.classList.add("warn");
        }
      });
    }
    tick();
    setInterval(tick, 500);
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use expgate_core::token::AccessMode;

    #[test]
    fn token_mode_target_carries_the_access_token() {
        let record = AccessToken::new(AccessMode::Token, "https://study.example/run?arm=b");
        let page = waiting_page("tok-1", &record, true, 1_000);
        assert!(page.contains(r#"const targetUrl = "https://study.example/run?arm=b&access_token=tok-1";"#));
        assert!(page.contains("display:none"));
    }

    #[test]
    fn proxy_mode_targets_the_proxy_path() {
        let mut record = AccessToken::new(AccessMode::Proxy, "https://study.example/app/");
        record.access_policy = AccessPolicy::Unscheduled;
        record.grace_expires_at_ms = Some(5_000);
        let page = waiting_page("tok-2", &record, true, 1_000);
        assert!(page.contains(r#"const targetUrl = "/proxy/tok-2/";"#));
        assert!(page.contains("const graceUntilMs = 5000;"));
        assert!(page.contains("display:inline-block"));
    }

    #[test]
    fn unparseable_target_is_used_verbatim() {
        assert_eq!(append_token("not a url", "tok"), "not a url");
    }
}
