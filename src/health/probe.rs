//! Single-shot liveness probes. No retries here; callers poll.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A failed probe carries a short human-readable reason.
pub type ProbeResult = Result<(), String>;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
});

pub async fn check_tcp(host: &str, port: u16, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("{}:{} {}", host, port, e)),
        Err(_) => Err(format!("{}:{} timed out after {:?}", host, port, timeout)),
    }
}

/// GET `url`; any 2xx or 3xx is healthy. Redirects are not followed.
pub async fn check_http(url: &str, timeout: Duration) -> ProbeResult {
    let response = HTTP_CLIENT
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| format!("GET {} failed: {}", url, e))?;
    let status = response.status();
    // Drain the body so the connection is released.
    let _ = response.bytes().await;
    if status.is_success() || status.is_redirection() {
        Ok(())
    } else {
        Err(format!("GET {} returned {}", url, status))
    }
}

pub async fn is_port_reachable(port: u16, host: &str, timeout: Duration) -> bool {
    check_tcp(host, port, timeout).await.is_ok()
}

pub async fn is_http_healthy(url: &str, timeout: Duration) -> bool {
    check_http(url, timeout).await.is_ok()
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn tcp(&self, host: &str, port: u16) -> ProbeResult;
    async fn http(&self, url: &str) -> ProbeResult;
}

/// Real network prober.
#[derive(Debug, Clone)]
pub struct NetProber {
    timeout: Duration,
}

impl NetProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for NetProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn tcp(&self, host: &str, port: u16) -> ProbeResult {
        check_tcp(host, port, self.timeout).await
    }

    async fn http(&self, url: &str) -> ProbeResult {
        check_http(url, self.timeout).await
    }
}

/// Poll `host:port` every `interval` until it accepts a connection or
/// `timeout` elapses.
pub async fn wait_for_port(
    prober: &dyn Prober,
    host: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if prober.tcp(host, port).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "{}\r\nContent-Length: 2\r\nLocation: /elsewhere\r\nConnection: close\r\n\r\nok",
                    status_line
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn tcp_reachable_and_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_reachable(port, "127.0.0.1", DEFAULT_PROBE_TIMEOUT).await);
        drop(listener);
        assert!(!is_port_reachable(port, "127.0.0.1", DEFAULT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn http_2xx_and_3xx_are_healthy() {
        let port = serve_once("HTTP/1.1 200 OK").await;
        assert!(is_http_healthy(&format!("http://127.0.0.1:{}/health", port), DEFAULT_PROBE_TIMEOUT).await);

        let port = serve_once("HTTP/1.1 302 Found").await;
        assert!(is_http_healthy(&format!("http://127.0.0.1:{}/", port), DEFAULT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn http_5xx_is_unhealthy() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let err = check_http(&format!("http://127.0.0.1:{}/", port), DEFAULT_PROBE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.contains("503"), "got: {}", err);
    }

    struct FlakyProber {
        calls: AtomicUsize,
        up_after: usize,
    }

    #[async_trait]
    impl Prober for FlakyProber {
        async fn tcp(&self, _host: &str, _port: u16) -> ProbeResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.up_after {
                Ok(())
            } else {
                Err("refused".into())
            }
        }
        async fn http(&self, _url: &str) -> ProbeResult {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_port_polls_until_up() {
        let prober = FlakyProber {
            calls: AtomicUsize::new(0),
            up_after: 3,
        };
        let ok = wait_for_port(&prober, "h", 1, Duration::from_secs(10), Duration::from_secs(1)).await;
        assert!(ok);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_port_gives_up() {
        let prober = FlakyProber {
            calls: AtomicUsize::new(0),
            up_after: usize::MAX,
        };
        let ok = wait_for_port(&prober, "h", 1, Duration::from_secs(3), Duration::from_secs(1)).await;
        assert!(!ok);
    }
}
