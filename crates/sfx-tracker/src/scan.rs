//! HTML body scanning: meta-refresh and JavaScript `location` hops.
//!
//! Meta refresh is checked before JS location; among JS matches the one
//! earliest in the document wins.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;

fn meta_refresh_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<meta[^>]*http-equiv\s*=\s*["']?refresh["']?[^>]*content\s*=\s*["']?\s*\d+\s*;\s*url\s*=\s*([^"'>\s]+)"#,
        )
        .expect("meta refresh regex")
    })
}

fn js_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:window|document|top|self)\.location(?:\.href)?\s*=\s*["'`]([^"'`]+)["'`]"#,
        )
        .expect("js assign regex")
    })
}

fn js_replace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:(?:window|document|top|self)\.)?location\.replace\(\s*["'`]([^"'`]+)["'`]"#,
        )
        .expect("js replace regex")
    })
}

/// A meta-refresh target, resolved against the page URL.
pub fn meta_refresh_target(body: &str, base: &Url) -> Option<Url> {
    let caps = meta_refresh_re().captures(body)?;
    resolve(base, caps.get(1)?.as_str())
}

/// The earliest JS location hop in the document, resolved against the page
/// URL. Only http(s) targets qualify; the caller additionally rejects
/// already-visited URLs.
pub fn js_location_target(body: &str, base: &Url) -> Option<Url> {
    let assign = js_assign_re()
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| (m.start(), m.as_str()));
    let replace = js_replace_re()
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| (m.start(), m.as_str()));

    let raw = match (assign, replace) {
        (Some((ai, a)), Some((ri, r))) => {
            if ai <= ri {
                a
            } else {
                r
            }
        }
        (Some((_, a)), None) => a,
        (None, Some((_, r))) => r,
        (None, None) => return None,
    };

    let url = resolve(base, raw)?;
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}

fn resolve(base: &Url, raw: &str) -> Option<Url> {
    base.join(raw.trim()).ok()
}

/// The suffix contract: everything after the first `?`, without the `?`,
/// order and case preserved. Empty when the URL carries no query.
pub fn suffix_of(url: &Url) -> String {
    url.query().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://shop.example.com/go/abc").unwrap()
    }

    #[test]
    fn meta_refresh_variants_parse() {
        let cases = [
            r#"<meta http-equiv="refresh" content="0; url=https://next.example.com/x">"#,
            r#"<META HTTP-EQUIV=refresh CONTENT="5;url=https://next.example.com/x">"#,
            r#"<meta http-equiv='refresh' content='3 ; url = https://next.example.com/x'>"#,
        ];
        for html in cases {
            let t = meta_refresh_target(html, &base()).expect(html);
            assert_eq!(t.as_str(), "https://next.example.com/x");
        }
    }

    #[test]
    fn meta_refresh_resolves_relative() {
        let html = r#"<meta http-equiv="refresh" content="0; url=/landing?a=1">"#;
        let t = meta_refresh_target(html, &base()).unwrap();
        assert_eq!(t.as_str(), "https://shop.example.com/landing?a=1");
    }

    #[test]
    fn js_location_forms_parse() {
        let cases = [
            r#"<script>window.location.href = "https://next.example.com/a";</script>"#,
            r#"<script>window.location = 'https://next.example.com/a'</script>"#,
            r#"<script>document.location = `https://next.example.com/a`;</script>"#,
            r#"<script>window.location.replace("https://next.example.com/a")</script>"#,
            r#"<script>location.replace('https://next.example.com/a')</script>"#,
        ];
        for html in cases {
            let t = js_location_target(html, &base()).expect(html);
            assert_eq!(t.as_str(), "https://next.example.com/a");
        }
    }

    #[test]
    fn js_location_rejects_non_http_schemes() {
        let html = r#"<script>window.location = "javascript:void(0)";</script>"#;
        assert!(js_location_target(html, &base()).is_none());
    }

    #[test]
    fn earliest_js_match_wins() {
        let html = r#"
            <script>location.replace("https://first.example.com/")</script>
            <script>window.location.href = "https://second.example.com/";</script>
        "#;
        let t = js_location_target(html, &base()).unwrap();
        assert_eq!(t.host_str(), Some("first.example.com"));
    }

    #[test]
    fn suffix_is_the_raw_query() {
        let u = Url::parse("https://www.amazon.com/dp/X?tag=aff-20&gclid=abc").unwrap();
        assert_eq!(suffix_of(&u), "tag=aff-20&gclid=abc");

        let bare = Url::parse("https://www.amazon.com/dp/X").unwrap();
        assert_eq!(suffix_of(&bare), "");
    }
}
