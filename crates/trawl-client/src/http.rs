use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::{Client, Response, StatusCode};
use trawl_core::error::AppError;
use url::{Host, Url};

const USER_AGENT: &str = "Trawl/0.1 (+https://github.com/trawl-rs/trawl)";
const MAX_REDIRECTS: usize = 5;

/// Shared HTTP client for extractors.
///
/// Maps transport failures onto [`AppError`] variants the retry executor
/// understands: `4xx` other than `429` is [`AppError::Permanent`], everything
/// else is retried. Requests to private or reserved addresses are refused
/// unless [`allow_private_urls`](Self::allow_private_urls) is set. While the
/// guard is on, redirects are followed by hand and every hop is vetted and
/// pinned to the addresses that were checked.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    block_private: bool,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Self::builder(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            block_private: true,
        })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder().user_agent(USER_AGENT).timeout(timeout)
    }

    /// Permit loopback and private targets (local CLI runs, tests).
    pub fn allow_private_urls(mut self) -> Self {
        self.block_private = false;
        self
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, url: &Url) -> Result<String, AppError> {
        let response = if self.block_private {
            self.send_vetted(url).await?
        } else {
            self.client
                .get(url.as_str())
                .send()
                .await
                .map_err(|e| self.map_transport_error(e))?
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimitExceeded);
        }
        if status.is_client_error() {
            return Err(AppError::Permanent(format!(
                "HTTP {} for {}",
                status.as_u16(),
                response.url()
            )));
        }
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                response.url()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }

    /// Follow redirects one hop at a time. Each hop is resolved, checked and
    /// sent through a client pinned to exactly those addresses, so neither a
    /// redirect nor a second DNS answer can reach a private address.
    async fn send_vetted(&self, url: &Url) -> Result<Response, AppError> {
        let mut current = url.clone();
        let mut hops = 0;
        loop {
            let addrs = ensure_public(&current).await?;
            let mut builder =
                Self::builder(self.timeout).redirect(reqwest::redirect::Policy::none());
            if let Some(Host::Domain(domain)) = current.host() {
                builder = builder.resolve_to_addrs(domain, &addrs);
            }
            let client = builder
                .build()
                .map_err(|e| AppError::HttpError(e.to_string()))?;

            let response = client
                .get(current.as_str())
                .send()
                .await
                .map_err(|e| self.map_transport_error(e))?;
            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    AppError::Permanent(format!(
                        "HTTP {} without Location for {current}",
                        response.status().as_u16()
                    ))
                })?;
            hops += 1;
            current = redirect_target(&current, location, hops)?;
            tracing::debug!(hops, to = %current, "Following redirect");
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

/// Resolve a `Location` header against the URL that answered with it.
///
/// Refuses non-http(s) schemes, literal private addresses and chains longer
/// than the redirect cap. Named hosts are vetted when the hop is sent.
fn redirect_target(from: &Url, location: &str, hops: usize) -> Result<Url, AppError> {
    if hops > MAX_REDIRECTS {
        return Err(AppError::Permanent(format!(
            "More than {MAX_REDIRECTS} redirects starting at {from}"
        )));
    }
    let next = from.join(location).map_err(|e| {
        AppError::Permanent(format!("Invalid redirect '{location}' from {from}: {e}"))
    })?;
    let next = parse_target(next.as_str())?;
    if literal_ip(&next).is_some_and(is_private_ip) {
        return Err(AppError::InvalidRequest(format!(
            "Refusing redirect to {next}: private or reserved address"
        )));
    }
    Ok(next)
}

fn literal_ip(url: &Url) -> Option<IpAddr> {
    match url.host()? {
        Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
        Host::Domain(_) => None,
    }
}

/// Parse a user-supplied target as an http(s) URL.
pub fn parse_target(target: &str) -> Result<Url, AppError> {
    let url = Url::parse(target.trim())
        .map_err(|e| AppError::InvalidRequest(format!("Invalid URL '{target}': {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidRequest(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    if url.host_str().is_none() {
        return Err(AppError::InvalidRequest(format!("URL '{target}' has no host")));
    }
    Ok(url)
}

/// Resolve the host and refuse private, loopback and link-local addresses.
/// Returns the vetted addresses.
async fn ensure_public(url: &Url) -> Result<Vec<SocketAddr>, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::InvalidRequest("URL has no host".to_string()))?;
    let port = url.port_or_known_default().unwrap_or(80);

    if let Some(ip) = literal_ip(url) {
        return if is_private_ip(ip) {
            Err(AppError::InvalidRequest(format!(
                "Refusing to fetch {host}: private or reserved address"
            )))
        } else {
            Ok(vec![SocketAddr::new(ip, port)])
        };
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::InvalidRequest(format!(
            "Refusing to fetch {host}: resolves to private or reserved address {}",
            blocked.ip()
        )));
    }
    Ok(addrs)
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_detected() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "192.168.0.10",
            "169.254.169.254",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip} should be private");
        }
    }

    #[test]
    fn public_addresses_pass() {
        for ip in ["8.8.8.8", "93.184.216.34", "2001:4860:4860::8888"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[test]
    fn parse_target_accepts_http_only() {
        assert!(parse_target("https://example.com/blog").is_ok());
        assert!(parse_target(" http://example.com ").is_ok());

        let err = parse_target("ftp://example.com").unwrap_err();
        assert!(err.to_string().contains("not allowed"));
        assert!(matches!(
            parse_target("not a url"),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn literal_private_hosts_are_refused() {
        let url = Url::parse("http://127.0.0.1:8080/admin").unwrap();
        let err = ensure_public(&url).await.unwrap_err();
        assert!(err.to_string().contains("private"));

        let url = Url::parse("http://[::1]/").unwrap();
        assert!(ensure_public(&url).await.is_err());
    }

    #[test]
    fn redirects_to_private_addresses_are_refused() {
        let from = Url::parse("https://blog.example.com/post").unwrap();
        for location in [
            "http://169.254.169.254/latest/meta-data/",
            "http://127.0.0.1:8080/admin",
            "http://[::1]/",
            "http://10.0.0.5/",
        ] {
            assert!(
                matches!(
                    redirect_target(&from, location, 1),
                    Err(AppError::InvalidRequest(_))
                ),
                "{location} should be refused"
            );
        }
    }

    #[test]
    fn redirect_targets_resolve_relative_locations() {
        let from = Url::parse("https://blog.example.com/a/post").unwrap();
        assert_eq!(
            redirect_target(&from, "/moved", 1).unwrap().as_str(),
            "https://blog.example.com/moved"
        );
        assert_eq!(
            redirect_target(&from, "https://8.8.8.8/", 1).unwrap().as_str(),
            "https://8.8.8.8/"
        );
        assert!(matches!(
            redirect_target(&from, "file:///etc/passwd", 1),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            redirect_target(&from, "/loop", MAX_REDIRECTS + 1),
            Err(AppError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn public_literal_hosts_are_pinned_to_themselves() {
        let url = Url::parse("http://8.8.8.8:8080/").unwrap();
        let addrs = ensure_public(&url).await.unwrap();
        assert_eq!(addrs, vec!["8.8.8.8:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn refused_fetch_never_hits_the_network() {
        let fetcher = HttpFetcher::new().unwrap();
        let url = Url::parse("http://169.254.169.254/latest/meta-data/").unwrap();
        assert!(matches!(
            fetcher.get_text(&url).await,
            Err(AppError::InvalidRequest(_))
        ));
    }
}
