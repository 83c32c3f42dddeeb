//! Exit-IP probing: one GET through the candidate proxy against public
//! echo services, raced in parallel; the first parseable answer wins.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::select_ok;
use sfx_tracker::ProxyEndpoint;

/// At least two independent services so a single outage never blinds the
/// selector: ipify answers JSON, ifconfig.me answers a bare address line.
const ECHO_SERVICES: &[&str] = &["https://api.ipify.org?format=json", "https://ifconfig.me/ip"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub exit_ip: String,
    pub country: Option<String>,
}

/// What the selector uses to learn a proxy's egress IP. Generic so tests
/// can substitute a canned prober.
pub trait ExitIpProber {
    fn probe(
        &self,
        endpoint: &ProxyEndpoint,
    ) -> impl std::future::Future<Output = Result<ProbeResult>> + Send;
}

/// Production prober: races the echo services through the proxy.
#[derive(Debug, Clone)]
pub struct HttpProber {
    pub timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client_for(&self, endpoint: &ProxyEndpoint) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .proxy(reqwest::Proxy::all(endpoint.proxy_url()).context("invalid proxy url")?)
            .build()
            .context("build probe client")
    }
}

impl ExitIpProber for HttpProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<ProbeResult> {
        let client = self.client_for(endpoint)?;

        let futures = ECHO_SERVICES
            .iter()
            .map(|svc| {
                let client = client.clone();
                Box::pin(async move {
                    let body = client
                        .get(*svc)
                        .send()
                        .await
                        .with_context(|| format!("probe {svc} failed"))?
                        .error_for_status()
                        .with_context(|| format!("probe {svc} status"))?
                        .text()
                        .await
                        .with_context(|| format!("probe {svc} body"))?;
                    parse_probe_body(&body)
                })
                    as std::pin::Pin<
                        Box<dyn std::future::Future<Output = Result<ProbeResult>> + Send>,
                    >
            })
            .collect::<Vec<_>>();

        let (result, _rest) = select_ok(futures).await?;
        Ok(result)
    }
}

/// Echo payloads come in two shapes: JSON with an ip-ish field (ipify) or
/// a bare address line (ifconfig.me). Country fields are picked up when a
/// configured service happens to report them.
pub fn parse_probe_body(body: &str) -> Result<ProbeResult> {
    let trimmed = body.trim();

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let ip = ["ip", "query", "address"]
            .iter()
            .find_map(|k| v.get(*k).and_then(|x| x.as_str()))
            .map(str::to_string);
        if let Some(ip) = ip {
            validate_ip(&ip)?;
            let country = ["cc", "countryCode", "country_code"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|x| x.as_str()))
                .map(|s| s.to_ascii_uppercase());
            return Ok(ProbeResult {
                exit_ip: ip,
                country,
            });
        }
        return Err(anyhow!("echo payload has no ip field"));
    }

    validate_ip(trimmed)?;
    Ok(ProbeResult {
        exit_ip: trimmed.to_string(),
        country: None,
    })
}

fn validate_ip(s: &str) -> Result<()> {
    s.parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| anyhow!("echo payload is not an ip: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipify_json() {
        let r = parse_probe_body(r#"{"ip":"203.0.113.9"}"#).unwrap();
        assert_eq!(r.exit_ip, "203.0.113.9");
        assert_eq!(r.country, None);
    }

    #[test]
    fn parses_ifconfig_me_bare_text() {
        // ifconfig.me/ip answers the address alone, newline-terminated.
        let r = parse_probe_body("198.51.100.4\n").unwrap();
        assert_eq!(r.exit_ip, "198.51.100.4");
        assert_eq!(r.country, None);
    }

    #[test]
    fn json_country_fields_are_picked_up_when_present() {
        let r = parse_probe_body(r#"{"ip":"203.0.113.9","cc":"be"}"#).unwrap();
        assert_eq!(r.exit_ip, "203.0.113.9");
        assert_eq!(r.country.as_deref(), Some("BE"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_probe_body("<html>blocked</html>").is_err());
        assert!(parse_probe_body(r#"{"error":"quota"}"#).is_err());
    }
}
