use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

pub const DEFAULT_PORT: u16 = 8188;
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_millis(400);
pub const READINESS_PATH: &str = "/system_stats";

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// True iff something accepts TCP connections on `127.0.0.1:port` right now.
pub async fn is_reachable(port: u16) -> bool {
    is_reachable_within(port, REACHABILITY_TIMEOUT).await
}

pub async fn is_reachable_within(port: u16, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, TcpStream::connect(loopback(port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// HTTP-level readiness: the server answers its stats endpoint with 200.
pub async fn is_http_ready(port: u16) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(REACHABILITY_TIMEOUT)
        .no_proxy()
        .build()
    else {
        return false;
    };
    let url = format!("http://127.0.0.1:{port}{READINESS_PATH}");
    match client.get(&url).send().await {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    }
}
