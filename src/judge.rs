use crate::error::{Error, Result};
use regex::Regex;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

lazy_static::lazy_static! {
    // AZenv-style pages echo `KEY = value` pairs, sometimes wrapped in HTML
    // tags. Markup is stripped first; one pattern per key, case-insensitive,
    // tolerant of `:` or `=` separators.
    static ref RE_TAGS: Regex = Regex::new(r"<[^>]*>")
        .unwrap_or_else(|e| panic!("invalid tag pattern: {e}"));
    static ref RE_REMOTE_ADDR: Regex = field_pattern("REMOTE_ADDR");
    static ref RE_VIA: Regex = field_pattern("HTTP_VIA");
    static ref RE_X_FORWARDED_FOR: Regex = field_pattern("HTTP_X_FORWARDED_FOR");
    static ref RE_FORWARDED: Regex = field_pattern("HTTP_FORWARDED");
    static ref RE_CLIENT_IP: Regex = field_pattern("HTTP_CLIENT_IP");
}

fn field_pattern(key: &str) -> Regex {
    let pattern = format!(r"(?im)\b{key}\s*[:=]\s*([^\s<&]+)");
    Regex::new(&pattern).unwrap_or_else(|e| panic!("invalid judge pattern for {key}: {e}"))
}

/// The request environment echoed back by a proxy judge page. Missing
/// fields are `None`; field order and markup in the page do not matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JudgeReport {
    pub remote_addr: Option<String>,
    pub via: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub forwarded: Option<String>,
    pub client_ip: Option<String>,
}

impl JudgeReport {
    pub fn parse(body: &str) -> Self {
        let text = RE_TAGS.replace_all(body, " ");
        let capture = |re: &Regex| {
            re.captures(&text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };
        JudgeReport {
            remote_addr: capture(&RE_REMOTE_ADDR),
            via: capture(&RE_VIA),
            x_forwarded_for: capture(&RE_X_FORWARDED_FOR),
            forwarded: capture(&RE_FORWARDED),
            client_ip: capture(&RE_CLIENT_IP),
        }
    }

    /// The client address the judge observed, if it parsed as IPv4.
    pub fn remote_ip(&self) -> Option<Ipv4Addr> {
        self.remote_addr.as_deref()?.parse().ok()
    }

    /// True when any forwarding header echoes the given address. Header
    /// values are tokenized and compared as parsed addresses, so
    /// `17.7.7.7` never counts as a leak of `7.7.7.7`.
    pub fn reveals(&self, ip: Ipv4Addr) -> bool {
        [&self.via, &self.x_forwarded_for, &self.forwarded, &self.client_ip]
            .into_iter()
            .flatten()
            .any(|value| contains_address(value, ip))
    }
}

fn contains_address(value: &str, ip: Ipv4Addr) -> bool {
    value
        .split(|c: char| !c.is_ascii_digit() && c != '.')
        .filter(|token| !token.is_empty())
        .any(|token| token.parse::<Ipv4Addr>().map(|parsed| parsed == ip).unwrap_or(false))
}

/// Thin client for the judge endpoint itself, used once at startup to
/// learn the tester's own public address (queried without a proxy).
pub struct JudgeClient {
    url: String,
    client: reqwest::Client,
}

impl JudgeClient {
    pub fn new(url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(JudgeClient {
            url: url.to_string(),
            client,
        })
    }

    pub async fn own_ip(&self) -> Result<Ipv4Addr> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::parse(&self.url, format!("judge returned {status}")));
        }
        let body = response.text().await?;
        let report = JudgeReport::parse(&body);
        debug!(judge = %self.url, ?report, "resolved own address via judge");
        report
            .remote_ip()
            .ok_or_else(|| Error::parse(&self.url, "judge response has no REMOTE_ADDR"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AZENV_BODY: &str = "\
<html><head><title>AZ Environment</title></head><body><pre>
REMOTE_ADDR = 9.9.9.9
REMOTE_PORT = 51234
REQUEST_METHOD = GET
HTTP_VIA = 1.1 proxy.example (squid)
HTTP_X_FORWARDED_FOR = 7.7.7.7
HTTP_USER_AGENT = Mozilla/5.0
</pre></body></html>";

    #[test]
    fn test_parse_extracts_all_fields() {
        let report = JudgeReport::parse(AZENV_BODY);
        assert_eq!(report.remote_addr.as_deref(), Some("9.9.9.9"));
        assert_eq!(report.via.as_deref(), Some("1.1"));
        assert_eq!(report.x_forwarded_for.as_deref(), Some("7.7.7.7"));
        assert_eq!(report.forwarded, None);
        assert_eq!(report.client_ip, None);
        assert_eq!(report.remote_ip(), Some("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_parse_is_order_and_case_insensitive() {
        let body = "http_client_ip: 1.2.3.4\nremote_addr: 9.9.9.9";
        let report = JudgeReport::parse(body);
        assert_eq!(report.remote_addr.as_deref(), Some("9.9.9.9"));
        assert_eq!(report.client_ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_parse_tolerates_html_wrapping() {
        let body = "<td>REMOTE_ADDR</td><td>= 9.9.9.9</td>";
        let report = JudgeReport::parse(body);
        assert_eq!(report.remote_addr.as_deref(), Some("9.9.9.9"));
    }

    #[test]
    fn test_parse_missing_remote_addr_is_none() {
        let report = JudgeReport::parse("HTTP_VIA = something\nnothing else");
        assert_eq!(report.remote_addr, None);
        assert_eq!(report.remote_ip(), None);
    }

    #[test]
    fn test_x_forwarded_for_does_not_match_forwarded() {
        // HTTP_FORWARDED must not capture from the HTTP_X_FORWARDED_FOR line.
        let report = JudgeReport::parse("HTTP_X_FORWARDED_FOR = 7.7.7.7");
        assert_eq!(report.x_forwarded_for.as_deref(), Some("7.7.7.7"));
        assert_eq!(report.forwarded, None);
    }

    #[test]
    fn test_reveals_scans_every_forwarding_field() {
        let real: Ipv4Addr = "7.7.7.7".parse().unwrap();
        let leak = JudgeReport {
            remote_addr: Some("9.9.9.9".into()),
            x_forwarded_for: Some("7.7.7.7, 9.9.9.9".into()),
            ..Default::default()
        };
        assert!(leak.reveals(real));

        let clean = JudgeReport {
            remote_addr: Some("9.9.9.9".into()),
            via: Some("1.1 proxy".into()),
            ..Default::default()
        };
        assert!(!clean.reveals(real));
    }

    #[test]
    fn test_reveals_requires_exact_address_match() {
        let real: Ipv4Addr = "7.7.7.7".parse().unwrap();

        // Distinct addresses that contain the real one as a substring.
        let near_miss = JudgeReport {
            remote_addr: Some("9.9.9.9".into()),
            x_forwarded_for: Some("17.7.7.7, 7.7.7.77".into()),
            ..Default::default()
        };
        assert!(!near_miss.reveals(real));

        // The real address inside a larger header value still counts.
        let with_port = JudgeReport {
            remote_addr: Some("9.9.9.9".into()),
            forwarded: Some("for=7.7.7.7:51234".into()),
            ..Default::default()
        };
        assert!(with_port.reveals(real));
    }
}
