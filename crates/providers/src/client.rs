use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

enum ProxyResolution {
    UseProxy(String),
    /// Target matched `noProxy`; bypass environment proxies too.
    ForceDirectConnect,
    /// Nothing configured; reqwest reads HTTPS_PROXY / HTTP_PROXY itself.
    None,
}

/// Matches exact hosts, `*.example.com` (subdomains only) and
/// `.example.com` (the domain and its subdomains).
fn is_no_proxy(host: &str, no_proxy_list: &[String]) -> bool {
    let host_lower = host.to_lowercase();
    for rule in no_proxy_list {
        let r = rule.trim().to_lowercase();
        if r.is_empty() {
            continue;
        }
        if let Some(suffix) = r.strip_prefix("*.") {
            if host_lower.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else if let Some(suffix) = r.strip_prefix('.') {
            if host_lower == suffix || host_lower.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else if host_lower == r {
            return true;
        }
    }
    false
}

fn extract_host(api_base: &str) -> Option<String> {
    let parsed = url::Url::parse(api_base).ok()?;
    parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn resolve_proxy(proxy: Option<&str>, no_proxy: &[String], api_base: &str) -> ProxyResolution {
    let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) else {
        return ProxyResolution::None;
    };
    if !no_proxy.is_empty() {
        if let Some(host) = extract_host(api_base) {
            if is_no_proxy(&host, no_proxy) {
                return ProxyResolution::ForceDirectConnect;
            }
        }
    }
    ProxyResolution::UseProxy(proxy.to_string())
}

/// Build the HTTP client for one collaborator endpoint.
///
/// `timeout` bounds the whole request; callers that need a tighter bound
/// per call wrap the future in `tokio::time::timeout` as well.
pub fn build_http_client(
    proxy: Option<&str>,
    no_proxy: &[String],
    api_base: &str,
    timeout: Duration,
) -> Client {
    let mut builder = Client::builder().timeout(timeout).connect_timeout(timeout.min(Duration::from_secs(10)));

    match resolve_proxy(proxy, no_proxy, api_base) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "Using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(api_base = %api_base, "Host matches noProxy, connecting directly");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client with proxy, using default");
        Client::new()
    })
}
