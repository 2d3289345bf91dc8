//! Readiness probes.
//!
//! A probe answers "is this service usable yet?". Unreachable services are
//! reported as an unsuccessful [`ProbeResult`]; only a malformed probe target
//! is an error, and that is detected when the probe is built.

use std::{fmt::Debug, sync::Arc, time::Duration};

use gringo_types::{expand_port, ProbeSpec, ServiceSpec};
use tokio::{net::TcpStream, time::Instant};

use crate::error::{Error, Result};

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    pub observed_at: Instant,
}

impl ProbeResult {
    #[must_use]
    pub fn now(success: bool) -> Self {
        Self {
            success,
            observed_at: Instant::now(),
        }
    }
}

/// What the supervisor knows about the service when probing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeContext {
    /// `None` when the supervisor does not own a process for the service.
    pub process_alive: Option<bool>,
}

#[async_trait::async_trait]
pub trait ReadinessProbe: Send + Sync + Debug {
    /// Run one bounded check.
    async fn probe(&self, ctx: &ProbeContext) -> ProbeResult;
}

/// Succeeds when `host:port` accepts a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// # Errors
    ///
    /// Returns an error if `address` is not a `host:port` pair.
    pub fn new(address: &str, timeout: Duration) -> std::result::Result<Self, String> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| format!("`{address}` is not a host:port address"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("`{address}` has no host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|err| format!("`{address}` has an invalid port: {err}"))?;

        Ok(Self {
            host: host.to_owned(),
            port,
            timeout,
        })
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, _ctx: &ProbeContext) -> ProbeResult {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let success = matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)));
        tracing::trace!("tcp probe {}:{} -> {success}", self.host, self.port);
        ProbeResult::now(success)
    }
}

/// Succeeds when a GET on the URL answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpProbe {
    /// # Errors
    ///
    /// Returns an error if `url` is not an absolute http(s) URL.
    pub fn new(url: &str, timeout: Duration) -> std::result::Result<Self, String> {
        let url = reqwest::Url::parse(url).map_err(|err| format!("`{url}`: {err}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("`{url}` is not an http(s) URL"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("cannot build http client: {err}"))?;

        Ok(Self { url, client })
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, _ctx: &ProbeContext) -> ProbeResult {
        let success = match self.client.get(self.url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::trace!("http probe {} failed: {err}", self.url);
                false
            }
        };
        ProbeResult::now(success)
    }
}

/// Succeeds while the owned process is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessAliveProbe;

#[async_trait::async_trait]
impl ReadinessProbe for ProcessAliveProbe {
    async fn probe(&self, ctx: &ProbeContext) -> ProbeResult {
        ProbeResult::now(ctx.process_alive == Some(true))
    }
}

/// Build the probe described by `spec.probe`, with `{port}` replaced by
/// `port`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for malformed probe targets.
pub fn build_probe(spec: &ServiceSpec, port: Option<u16>) -> Result<Arc<dyn ReadinessProbe>> {
    let configuration = |reason: String| Error::Configuration {
        service: spec.name.clone(),
        reason,
    };

    let probe: Arc<dyn ReadinessProbe> = match &spec.probe {
        ProbeSpec::Tcp { address } => Arc::new(
            TcpProbe::new(&expand_port(address, port), spec.probe_timeout)
                .map_err(configuration)?,
        ),
        ProbeSpec::Http { url } => Arc::new(
            HttpProbe::new(&expand_port(url, port), spec.probe_timeout)
                .map_err(configuration)?,
        ),
        ProbeSpec::ProcessAlive => {
            if !spec.owned {
                return Err(configuration(
                    "a process probe needs a process owned by the supervisor".to_owned(),
                ));
            }
            Arc::new(ProcessAliveProbe)
        }
    };

    Ok(probe)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Answers every connection with `status_line` and closes it.
    async fn http_responder(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new(&format!("127.0.0.1:{port}"), TIMEOUT).unwrap();

        assert!(probe.probe(&ProbeContext::default()).await.success);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let port = free_port().await;

        let probe = TcpProbe::new(&format!("127.0.0.1:{port}"), TIMEOUT).unwrap();

        assert!(!probe.probe(&ProbeContext::default()).await.success);
    }

    #[test]
    fn test_tcp_probe_malformed_address() {
        assert!(TcpProbe::new("localhost", TIMEOUT).is_err());
        assert!(TcpProbe::new(":8080", TIMEOUT).is_err());
        assert!(TcpProbe::new("localhost:http", TIMEOUT).is_err());
        assert!(TcpProbe::new("[::1]:8080", TIMEOUT).is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_success() {
        let port = http_responder("HTTP/1.1 200 OK").await;

        let probe = HttpProbe::new(&format!("http://127.0.0.1:{port}/_stcore/health"), TIMEOUT)
            .unwrap();

        assert!(probe.probe(&ProbeContext::default()).await.success);
    }

    #[tokio::test]
    async fn test_http_probe_error_status() {
        let port = http_responder("HTTP/1.1 503 Service Unavailable").await;

        let probe = HttpProbe::new(&format!("http://127.0.0.1:{port}/api/tags"), TIMEOUT).unwrap();

        assert!(!probe.probe(&ProbeContext::default()).await.success);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let port = free_port().await;

        let probe = HttpProbe::new(&format!("http://127.0.0.1:{port}/"), TIMEOUT).unwrap();

        assert!(!probe.probe(&ProbeContext::default()).await.success);
    }

    #[test]
    fn test_http_probe_malformed_url() {
        assert!(HttpProbe::new("not a url", TIMEOUT).is_err());
        assert!(HttpProbe::new("ftp://127.0.0.1/", TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn test_process_alive_probe() {
        let probe = ProcessAliveProbe;

        let alive = ProbeContext {
            process_alive: Some(true),
        };
        let dead = ProbeContext {
            process_alive: Some(false),
        };

        assert!(probe.probe(&alive).await.success);
        assert!(!probe.probe(&dead).await.success);
        assert!(!probe.probe(&ProbeContext::default()).await.success);
    }

    #[test]
    fn test_build_probe_expands_port() {
        let spec = ServiceSpec::owned("web", ["serve"]).with_probe(ProbeSpec::Tcp {
            address: "127.0.0.1:{port}".to_owned(),
        });

        assert!(build_probe(&spec, Some(8080)).is_ok());
        assert!(matches!(
            build_probe(&spec, None),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_build_probe_rejects_external_process_probe() {
        let spec = ServiceSpec::external("ollama", ProbeSpec::ProcessAlive);

        assert!(matches!(
            build_probe(&spec, None),
            Err(Error::Configuration { .. })
        ));
    }
}
