//! Best-effort hostname resolution.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

/// Resolves a hostname to addresses. Failures yield an empty list.
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> Pin<Box<dyn Future<Output = Vec<IpAddr>> + Send + 'a>>;
}

/// System resolver through `tokio::net::lookup_host`.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> Pin<Box<dyn Future<Output = Vec<IpAddr>> + Send + 'a>> {
        Box::pin(async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return vec![ip];
            }
            match tokio::net::lookup_host((host, 0)).await {
                Ok(addrs) => {
                    let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                    ips.dedup();
                    ips
                }
                Err(e) => {
                    tracing::debug!("DNS lookup for {host} failed: {e}");
                    Vec::new()
                }
            }
        })
    }
}

/// Resolve with a deadline; a timeout counts as a failure.
pub async fn resolve_with_timeout(resolver: &dyn HostResolver, host: &str, timeout: Duration) -> Vec<IpAddr> {
    match tokio::time::timeout(timeout, resolver.resolve(host)).await {
        Ok(ips) => ips,
        Err(_) => {
            tracing::debug!("DNS lookup for {host} timed out after {timeout:?}");
            Vec::new()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticResolver;
    use super::*;

    #[tokio::test]
    async fn test_literal_ip_skips_lookup() {
        let ips = SystemResolver.resolve("203.0.113.9").await;
        assert_eq!(ips, vec!["203.0.113.9".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_timeout_yields_empty() {
        let r = StaticResolver::default().hanging("slow.example").with("fast.example", &["1.2.3.4"]);
        let t = Duration::from_millis(50);
        assert!(resolve_with_timeout(&r, "slow.example", t).await.is_empty());
        assert_eq!(resolve_with_timeout(&r, "fast.example", t).await.len(), 1);
        assert!(resolve_with_timeout(&r, "missing.example", t).await.is_empty());
    }
}
