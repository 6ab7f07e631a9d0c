use once_cell::sync::Lazy;
use regex::Regex;

use crate::token::DownloadPolicy;

// Pattern is a literal; exercised by the unit tests below.
#[allow(clippy::unwrap_used)]
static HEAD_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</head>").unwrap());

/// Parameters baked into a synthesized `_capture.js`.
#[derive(Debug, Clone)]
pub struct CaptureParams<'a> {
    pub prefix: &'a str,
    pub token: &'a str,
    pub download_policy: DownloadPolicy,
    pub collect_url: &'a str,
}

/// Inserts the capture agent `<script>` before `</head>`, or appends it when
/// the document has no head close tag.
pub fn inject_capture_script(html: &str, script_src: &str) -> String {
    let tag = format!("<script src=\"{script_src}\"></script>");
    if HEAD_CLOSE.is_match(html) {
        HEAD_CLOSE
            .replace(html, format!("{tag}</head>").as_str())
            .into_owned()
    } else {
        format!("{html}{tag}")
    }
}

/// Synthesizes the capture agent. The script is pure instrumentation: it
/// blocks local-save escapes when the download policy forbids them, wraps the
/// experiment runtime's save routine so trial data is always beaconed to the
/// collector, and fires a last-resort export on page hide. Delivery is
/// fire-and-forget; loss on hard crash is accepted.
pub fn capture_script(params: &CaptureParams<'_>) -> String {
    CAPTURE_TEMPLATE
        .replace("__PREFIX__", &js_string(params.prefix))
        .replace("__TOKEN__", &js_string(params.token))
        .replace("__POLICY__", &js_string(params.download_policy.as_str()))
        .replace("__COLLECT_URL__", &js_string(params.collect_url))
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

const CAPTURE_TEMPLATE: &str = r#"(function () {
  "use strict";
  var PREFIX = __PREFIX__;
  var TOKEN = __TOKEN__;
  var POLICY = __POLICY__;
  var COLLECT_URL = __COLLECT_URL__;
  var reported = false;

  function deliver(event, payload) {
    var body = JSON.stringify({
      prefix: PREFIX,
      access_token: TOKEN,
      download_policy: POLICY,
      event: event,
      payload: payload || {}
    });
    try {
      if (navigator.sendBeacon &&
          navigator.sendBeacon(COLLECT_URL, new Blob([body], { type: "application/json" }))) {
        return;
      }
    } catch (e) {}
    try {
      fetch(COLLECT_URL, {
        method: "POST",
        headers: { "Content-Type": "application/json" },
        body: body,
        keepalive: true
      });
    } catch (e) {}
  }

  function trialData() {
    var jp = window.jsPsych;
    if (jp && jp.data && typeof jp.data.get === "function") {
      try { return JSON.parse(jp.data.get().json()); } catch (e) {}
    }
    return null;
  }

  if (POLICY === "upload_only") {
    document.addEventListener("click", function (ev) {
      var anchor = ev.target && ev.target.closest ? ev.target.closest("a") : null;
      if (!anchor) return;
      var href = anchor.getAttribute("href") || "";
      if (anchor.hasAttribute("download") ||
          href.indexOf("blob:") === 0 || href.indexOf("data:") === 0) {
        ev.preventDefault();
        ev.stopPropagation();
        deliver("download_blocked", { href: href.slice(0, 200) });
      }
    }, true);
    var open = window.open;
    window.open = function (url) {
      var target = String(url || "");
      if (target.indexOf("blob:") === 0 || target.indexOf("data:") === 0) {
        deliver("download_blocked", { href: target.slice(0, 200) });
        return null;
      }
      return open.apply(window, arguments);
    };
  }

  var tries = 0;
  var poll = setInterval(function () {
    tries += 1;
    var jp = window.jsPsych;
    if (jp && jp.data && typeof jp.data.localSave === "function" && !jp.data.__captureWrapped) {
      clearInterval(poll);
      jp.data.__captureWrapped = true;
      var save = jp.data.localSave.bind(jp.data);
      jp.data.localSave = function () {
        reported = true;
        deliver("save", trialData());
        if (POLICY !== "upload_only") {
          return save.apply(null, arguments);
        }
      };
    } else if (tries >= 120) {
      clearInterval(poll);
    }
  }, 500);

  function lastResort() {
    if (reported) return;
    var data = trialData();
    if (data) {
      reported = true;
      deliver("unload", data);
    }
  }
  window.addEventListener("pagehide", lastResort);
  window.addEventListener("beforeunload", lastResort);
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_before_head_close() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let out = inject_capture_script(html, "/exp/p/_capture.js?dl=upload_only");
        assert!(out.contains(
            "<script src=\"/exp/p/_capture.js?dl=upload_only\"></script></head>"
        ));
        assert_eq!(out.matches("<script").count(), 1);
    }

    #[test]
    fn appends_when_head_close_missing() {
        let html = "<body>no head</body>";
        let out = inject_capture_script(html, "/x.js");
        assert!(out.ends_with("<script src=\"/x.js\"></script>"));
    }

    #[test]
    fn script_bakes_in_parameters_as_json_strings() {
        let script = capture_script(&CaptureParams {
            prefix: "study1",
            token: "tok-\"quoted\"",
            download_policy: DownloadPolicy::UploadOnly,
            collect_url: "https://gw.example/data/collect",
        });
        assert!(script.contains(r#"var PREFIX = "study1";"#));
        assert!(script.contains(r#"var TOKEN = "tok-\"quoted\"";"#));
        assert!(script.contains(r#"var POLICY = "upload_only";"#));
        assert!(script.contains(r#"var COLLECT_URL = "https://gw.example/data/collect";"#));
        assert!(!script.contains("__PREFIX__"));
    }

    #[test]
    fn download_allowed_policies_keep_local_save() {
        let script = capture_script(&CaptureParams {
            prefix: "p",
            token: "t",
            download_policy: DownloadPolicy::DownloadAndUpload,
            collect_url: "/data/collect",
        });
        assert!(script.contains(r#"var POLICY = "download_and_upload";"#));
    }
}
