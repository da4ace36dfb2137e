//! Active HTTPS outcome probe.
//!
//! Connects straight to the target over TCP + TLS, sends a minimal request
//! and looks for an HTTP status line. Any status code counts as success; a
//! reset, handshake failure or timeout does not. The probe never inspects
//! intercepted traffic.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeStatus {
    Unknown,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeSnapshot {
    pub status: OutcomeStatus,
    pub text: String,
    pub details: String,
}

impl OutcomeSnapshot {
    pub fn unknown(details: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Unknown,
            text: "UNKNOWN".into(),
            details: details.into(),
        }
    }

    pub fn success(details: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            text: "SUCCESS".into(),
            details: details.into(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            text: "FAILED".into(),
            details: details.into(),
        }
    }
}

/// Called with `(local, remote)` once the probe's TCP connection is up.
pub type FlowCallback = Arc<dyn Fn(SocketAddr, SocketAddr) + Send + Sync>;

pub trait OutcomeProber: Send + Sync {
    fn probe<'a>(
        &'a self,
        host: &'a str,
        timeout: Duration,
        on_connected: FlowCallback,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = OutcomeSnapshot> + Send + 'a>>;
}

/// Real prober over `tokio-rustls` with the platform's native roots.
#[derive(Default)]
pub struct HttpsProber {
    tls: OnceLock<Result<Arc<ClientConfig>, String>>,
}

impl HttpsProber {
    pub fn new() -> Self {
        Self::default()
    }

    fn connector(&self) -> anyhow::Result<TlsConnector> {
        let config = self.tls.get_or_init(|| build_client_config().map_err(|e| format!("{e:#}")));
        match config {
            Ok(cfg) => Ok(TlsConnector::from(Arc::clone(cfg))),
            Err(e) => Err(anyhow::anyhow!("tls setup: {e}")),
        }
    }

    async fn run(&self, host: &str, on_connected: &FlowCallback) -> anyhow::Result<OutcomeSnapshot> {
        let addr = tokio::net::lookup_host((host, config::TLS_PORT))
            .await
            .with_context(|| format!("dns: {host}"))?
            .find(SocketAddr::is_ipv4);
        // The interception filters are IPv4-first, so an IPv6-only target says nothing.
        let Some(addr) = addr else {
            return Ok(OutcomeSnapshot::unknown("target has no IPv4 address"));
        };

        let stream = TcpStream::connect(addr).await.context("socket")?;
        if let (Ok(local), Ok(remote)) = (stream.local_addr(), stream.peer_addr()) {
            on_connected(local, remote);
        }

        let server_name = rustls::ServerName::try_from(host).context("invalid server name")?;
        let tls = self.connector()?.connect(server_name, stream).await.context("tls")?;

        let (reader, mut writer) = tokio::io::split(tls);
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {host}\r\nUser-Agent: dpiguard-outcome-probe\r\nConnection: close\r\n\r\n"
        );
        writer.write_all(request.as_bytes()).await.context("io")?;
        writer.flush().await.context("io")?;

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.context("io")?;
        Ok(classify_status_line(&line))
    }
}

impl OutcomeProber for HttpsProber {
    fn probe<'a>(
        &'a self,
        host: &'a str,
        timeout: Duration,
        on_connected: FlowCallback,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = OutcomeSnapshot> + Send + 'a>> {
        Box::pin(async move {
            let host = host.trim();
            if host.is_empty() {
                return OutcomeSnapshot::unknown("no host for outcome probe");
            }
            let attempt = async {
                if timeout.is_zero() {
                    return Some(self.run(host, &on_connected).await);
                }
                tokio::time::timeout(timeout, self.run(host, &on_connected)).await.ok()
            };
            let snapshot = tokio::select! {
                biased;
                _ = cancel.cancelled() => OutcomeSnapshot::unknown("outcome probe cancelled"),
                result = attempt => match result {
                    None => OutcomeSnapshot::unknown("outcome probe timed out"),
                    Some(Ok(snapshot)) => snapshot,
                    Some(Err(e)) => OutcomeSnapshot::failed(format!("{e:#}")),
                },
            };
            tracing::info!("Outcome probe {host}: {} ({})", snapshot.text, snapshot.details);
            snapshot
        })
    }
}

fn build_client_config() -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs().context("loading native certificates")?;
    let mut rejected = 0usize;
    for cert in native {
        if roots.add(&rustls::Certificate(cert.0)).is_err() {
            rejected += 1;
        }
    }
    if rejected > 0 {
        tracing::debug!("Skipped {rejected} unparsable native certificate(s)");
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Any status line is a success; an empty reply after a good handshake is not.
pub fn classify_status_line(line: &str) -> OutcomeSnapshot {
    let line = line.trim();
    if line.is_empty() {
        return OutcomeSnapshot::failed("TLS ok but empty HTTP response");
    }
    if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("HTTP/")) {
        OutcomeSnapshot::success(line)
    } else {
        OutcomeSnapshot::success("HTTP (unknown)")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn no_flow() -> FlowCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_status_line_classification() {
        assert_eq!(classify_status_line("HTTP/1.1 403 Forbidden\r\n").details, "HTTP/1.1 403 Forbidden");
        assert_eq!(classify_status_line("http/2 200").status, OutcomeStatus::Success);
        assert_eq!(classify_status_line("garbage").details, "HTTP (unknown)");
        assert_eq!(classify_status_line("\r\n").status, OutcomeStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_host_and_ipv6_only_are_unknown() {
        let prober = HttpsProber::new();
        let token = CancellationToken::new();
        let s = prober.probe("  ", Duration::from_secs(1), no_flow(), token.clone()).await;
        assert_eq!(s.status, OutcomeStatus::Unknown);

        let s = prober.probe("::1", Duration::from_secs(1), no_flow(), token).await;
        assert_eq!(s.status, OutcomeStatus::Unknown);
        assert!(s.details.contains("IPv4"));
    }

    #[tokio::test]
    async fn test_cancelled_probe_is_unknown() {
        let prober = HttpsProber::new();
        let token = CancellationToken::new();
        token.cancel();
        let s = prober.probe("example.com", Duration::from_secs(5), no_flow(), token).await;
        assert_eq!(s.details, "outcome probe cancelled");
    }

    #[tokio::test]
    async fn test_loopback_without_tls_server_is_not_success() {
        let prober = HttpsProber::new();
        let s = prober
            .probe("127.0.0.1", Duration::from_secs(2), no_flow(), CancellationToken::new())
            .await;
        assert_ne!(s.status, OutcomeStatus::Success);
    }
}
