use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// Patterns are literals; the unit tests below exercise every one of them.
#[allow(clippy::unwrap_used)]
fn compiled(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

static HEAD_OPEN: Lazy<Regex> = Lazy::new(|| compiled(r"(?i)<head(\b[^>]*)>"));
static BASE_TAG: Lazy<Regex> = Lazy::new(|| compiled(r"(?i)<base\s"));
static LINK_ATTR: Lazy<Regex> = Lazy::new(|| compiled(r#"(href|src|action)=(['"])([^'">]+)"#));

/// Attribute values left untouched by the relative-path pass. Root-relative
/// and protocol-relative values are handled separately before this list is
/// consulted.
const SKIP_PREFIXES: &[&str] = &[
    "http:",
    "https:",
    "#",
    "data:",
    "mailto:",
    "tel:",
    "javascript:",
];

/// Rewrites an HTML document returned by the proxied origin so its links keep
/// resolving through the proxy:
///
/// - injects `<base href="{proxy_dir_base}">` right after the opening
///   `<head...>` unless the document already carries a `<base>` tag;
/// - root-relative `href`/`src`/`action` values (single leading `/`) become
///   `{proxy_base}/<path>`;
/// - bare relative values are prefixed with `{proxy_dir_base}`.
///
/// Absolute, protocol-relative, fragment, `data:`, `mailto:`, `tel:` and
/// `javascript:` values pass through untouched.
pub fn rewrite_html(html: &str, proxy_base: &str, proxy_dir_base: &str) -> String {
    let based = if BASE_TAG.is_match(html) {
        html.to_string()
    } else {
        HEAD_OPEN
            .replace(html, |caps: &Captures<'_>| {
                format!("<head{}><base href=\"{}\">", &caps[1], proxy_dir_base)
            })
            .into_owned()
    };

    LINK_ATTR
        .replace_all(&based, |caps: &Captures<'_>| {
            let (attr, quote, value) = (&caps[1], &caps[2], &caps[3]);
            if let Some(rest) = value.strip_prefix('/') {
                if rest.starts_with('/') {
                    // Protocol-relative: leave alone.
                    caps[0].to_string()
                } else {
                    format!("{attr}={quote}{proxy_base}/{rest}")
                }
            } else if SKIP_PREFIXES.iter().any(|p| value.starts_with(p)) {
                caps[0].to_string()
            } else {
                format!("{attr}={quote}{proxy_dir_base}{value}")
            }
        })
        .into_owned()
}

/// Directory component of an origin path, always slash-terminated. Used to
/// anchor the injected `<base>` and the relative-path rewrites.
pub fn base_dir(path: &str) -> &str {
    if path.is_empty() || path == "/" {
        return "/";
    }
    if path.ends_with('/') {
        return path;
    }
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY_BASE: &str = "/proxy/T";
    const DIR_BASE: &str = "https://gw.example/proxy/T/app/";

    #[test]
    fn rewrites_root_relative_and_bare_relative_links() {
        let input = r#"<head><title>t</title></head><body><a href="/x">l</a><a href="y.html">m</a></body>"#;
        let out = rewrite_html(input, PROXY_BASE, DIR_BASE);
        assert!(out.contains(r#"<base href="https://gw.example/proxy/T/app/">"#), "{out}");
        assert!(out.contains(r#"href="/proxy/T/x""#), "{out}");
        assert!(out.contains(r#"href="https://gw.example/proxy/T/app/y.html""#), "{out}");
    }

    #[test]
    fn existing_base_tag_is_not_duplicated() {
        let input = r#"<head><title>t</title></head><body><a href="/x">l</a></body>"#;
        let once = rewrite_html(input, PROXY_BASE, DIR_BASE);
        let twice = rewrite_html(&once, PROXY_BASE, DIR_BASE);
        assert_eq!(twice.matches("<base").count(), 1);
    }

    #[test]
    fn head_attributes_survive_base_injection() {
        let input = r#"<head lang="en"><title>t</title></head>"#;
        let out = rewrite_html(input, PROXY_BASE, DIR_BASE);
        assert!(out.starts_with(r#"<head lang="en"><base href="#), "{out}");
    }

    #[test]
    fn skips_absolute_scheme_fragment_and_protocol_relative() {
        let input = concat!(
            r#"<head></head>"#,
            r#"<a href="https://other.example/a">a</a>"#,
            r#"<a href="http://other.example/b">b</a>"#,
            r#"<a href="//cdn.example/c">c</a>"#,
            r##"<a href="#frag">d</a>"##,
            r#"<a href="mailto:x@example.com">e</a>"#,
            r#"<a href="tel:+1555">f</a>"#,
            r#"<img src="data:image/png;base64,AAAA">"#,
            r#"<a href="javascript:void(0)">g</a>"#,
        );
        let out = rewrite_html(input, PROXY_BASE, DIR_BASE);
        assert!(out.contains(r#"href="https://other.example/a""#));
        assert!(out.contains(r#"href="http://other.example/b""#));
        assert!(out.contains(r#"href="//cdn.example/c""#));
        assert!(out.contains(r##"href="#frag""##));
        assert!(out.contains(r#"href="mailto:x@example.com""#));
        assert!(out.contains(r#"href="tel:+1555""#));
        assert!(out.contains(r#"src="data:image/png;base64,AAAA""#));
        assert!(out.contains(r#"href="javascript:void(0)""#));
    }

    #[test]
    fn rewrites_src_and_action_attributes() {
        let input = r#"<head></head><form action="/submit"><img src="img/p.png"></form>"#;
        let out = rewrite_html(input, PROXY_BASE, DIR_BASE);
        assert!(out.contains(r#"action="/proxy/T/submit""#));
        assert!(out.contains(r#"src="https://gw.example/proxy/T/app/img/p.png""#));
    }

    #[test]
    fn non_html_free_text_is_untouched_without_matches() {
        let input = "plain text with no markup";
        assert_eq!(rewrite_html(input, PROXY_BASE, DIR_BASE), input);
    }

    #[test]
    fn base_dir_handles_files_roots_and_directories() {
        assert_eq!(base_dir(""), "/");
        assert_eq!(base_dir("/"), "/");
        assert_eq!(base_dir("/app/"), "/app/");
        assert_eq!(base_dir("/app/index.html"), "/app/");
        assert_eq!(base_dir("index.html"), "/");
    }
}
