//! Rendezvous client: heartbeat our endpoint to every configured server, resolve a peer's last
//! known endpoint by identifier. Servers only hand out addresses; no data goes through them.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("bad response body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    identifier: &'a str,
    port: u16,
    local_address: &'a str,
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    identifier: &'a str,
}

/// Where a peer was last seen.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEndpoint {
    pub address: String,
    #[serde(default)]
    pub local_address: Option<String>,
    pub port: u16,
}

impl PeerEndpoint {
    /// Addresses to dial, in order: public, then local when it differs (same-NAT peers).
    pub fn candidates(&self) -> Vec<SocketAddr> {
        let mut out: Vec<SocketAddr> = Vec::new();
        for host in std::iter::once(&self.address).chain(self.local_address.as_ref()) {
            match host.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    let addr = SocketAddr::new(ip, self.port);
                    if !out.contains(&addr) {
                        out.push(addr);
                    }
                }
                Err(_) => tracing::debug!(host = %host, "skipping unparsable peer address"),
            }
        }
        out
    }
}

/// One rendezvous server as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub url: String,
    pub online: bool,
    pub last_error: Option<String>,
}

pub struct RendezvousClient {
    http: reqwest::Client,
    servers: Mutex<Vec<ServerStatus>>,
}

impl RendezvousClient {
    pub fn new(urls: &[String], timeout: Duration) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let servers = urls
            .iter()
            .map(|u| ServerStatus {
                url: u.trim_end_matches('/').to_string(),
                online: false,
                last_error: None,
            })
            .collect();
        Ok(Self {
            http,
            servers: Mutex::new(servers),
        })
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        crate::lock(&self.servers).clone()
    }

    fn urls(&self) -> Vec<String> {
        crate::lock(&self.servers)
            .iter()
            .map(|s| s.url.clone())
            .collect()
    }

    fn mark(&self, url: &str, result: Result<(), &DiscoveryError>) {
        let mut servers = crate::lock(&self.servers);
        let Some(server) = servers.iter_mut().find(|s| s.url == url) else {
            return;
        };
        match result {
            Ok(()) => {
                if !server.online {
                    tracing::info!(%url, "rendezvous online");
                }
                server.online = true;
                server.last_error = None;
            }
            Err(e) => {
                if server.online || server.last_error.is_none() {
                    tracing::warn!(%url, "rendezvous offline: {}", e);
                }
                server.online = false;
                server.last_error = Some(e.to_string());
            }
        }
    }

    /// Post our endpoint to every server. Each server's status is updated on its own;
    /// returns how many accepted the heartbeat.
    pub async fn heartbeat_all(&self, identifier: &str, port: u16, local_address: &str) -> usize {
        let body = HeartbeatRequest {
            identifier,
            port,
            local_address,
        };
        let mut accepted = 0;
        for url in self.urls() {
            let result = self.post(&url, "Heartbeat", &body).await.map(|_| ());
            self.mark(&url, result.as_ref().map(|_| ()));
            if result.is_ok() {
                accepted += 1;
            }
        }
        accepted
    }

    /// Last known endpoint of `identifier`. Online servers are asked first; None if no
    /// server knows it.
    pub async fn resolve(&self, identifier: &str) -> Option<PeerEndpoint> {
        let mut order = self.statuses();
        order.sort_by_key(|s| !s.online);
        let body = StatusRequest { identifier };
        for server in order {
            let found = self.status(&server.url, &body).await;
            self.mark(&server.url, found.as_ref().map(|_| ()));
            match found {
                Ok(Some(endpoint)) => return Some(endpoint),
                Ok(None) => {}
                Err(e) => tracing::debug!(url = %server.url, "resolve failed: {}", e),
            }
        }
        None
    }

    async fn status(
        &self,
        url: &str,
        body: &StatusRequest<'_>,
    ) -> Result<Option<PeerEndpoint>, DiscoveryError> {
        let Some(bytes) = self.post(url, "Status", body).await? else {
            return Ok(None);
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// POST `body` as JSON to `{url}/{endpoint}`. None on 404.
    async fn post<T: Serialize>(
        &self,
        url: &str,
        endpoint: &str,
        body: &T,
    ) -> Result<Option<Vec<u8>>, DiscoveryError> {
        let resp = self
            .http
            .post(format!("{}/{}", url, endpoint))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DiscoveryError::Status(status));
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }
}

/// Our LAN address: the source address the routing table picks for a public destination.
/// No packet is sent.
pub fn local_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Heartbeat every `interval` until cancelled.
pub async fn run_heartbeat(
    client: Arc<RendezvousClient>,
    identifier: String,
    port: u16,
    interval: Duration,
    cancel: CancellationToken,
) {
    let local = local_address()
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let accepted = tokio::select! {
            n = client.heartbeat_all(&identifier, port, &local) => n,
            _ = cancel.cancelled() => break,
        };
        tracing::trace!(accepted, "heartbeat sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Log = Arc<Mutex<Vec<(String, serde_json::Value)>>>;
    type Reply = fn(&str, &serde_json::Value) -> (u16, String);

    /// Request line path, header length and declared body length, once the head is complete.
    fn parse_head(buf: &[u8]) -> Option<(String, usize, usize)> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(head)) => {
                let len = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok()?.trim().parse().ok())
                    .unwrap_or(0);
                Some((req.path.unwrap_or("/").to_string(), head, len))
            }
            _ => None,
        }
    }

    async fn serve(mut stream: TcpStream, log: Log, reply: Reply) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let (path, head, len) = loop {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(parsed) = parse_head(&buf) {
                break parsed;
            }
        };
        while buf.len() < head + len {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        let body: serde_json::Value =
            serde_json::from_slice(&buf[head..head + len]).unwrap_or(serde_json::Value::Null);
        let (code, text) = reply(&path, &body);
        log.lock().unwrap().push((path, body));
        let response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            code,
            text.len(),
            text
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
    }

    /// Minimal rendezvous server on loopback. Returns its base URL and the request log.
    async fn mock(reply: Reply) -> (String, Log) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, l.clone(), reply));
            }
        });
        (url, log)
    }

    fn directory(path: &str, body: &serde_json::Value) -> (u16, String) {
        match (path, body["identifier"].as_str()) {
            ("/Heartbeat", _) => (200, String::new()),
            ("/Status", Some("KNOWN")) => (
                200,
                r#"{"address":"203.0.113.7","localAddress":"192.168.1.20","port":45800}"#.into(),
            ),
            ("/Status", Some("BLANK")) => (200, String::new()),
            _ => (404, String::new()),
        }
    }

    #[tokio::test]
    async fn unreachable_server_marked_offline_others_proceed() {
        // Accepts into the backlog but never answers.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_url = format!("http://{}", silent.local_addr().unwrap());
        let (good_url, log) = mock(directory).await;
        let client =
            RendezvousClient::new(&[silent_url.clone(), good_url.clone()], Duration::from_millis(300))
                .unwrap();

        assert_eq!(client.heartbeat_all("ME", 45800, "192.168.1.5").await, 1);

        let statuses = client.statuses();
        assert_eq!(statuses[0].url, silent_url);
        assert!(!statuses[0].online);
        assert!(statuses[0].last_error.is_some());
        assert!(statuses[1].online);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "/Heartbeat");
        assert_eq!(
            log[0].1,
            serde_json::json!({"identifier": "ME", "port": 45800, "localAddress": "192.168.1.5"})
        );
    }

    #[tokio::test]
    async fn resolve_known_unknown_and_empty() {
        let (url, _log) = mock(directory).await;
        let client = RendezvousClient::new(&[url], Duration::from_secs(2)).unwrap();
        let endpoint = client.resolve("KNOWN").await.unwrap();
        assert_eq!(endpoint.port, 45800);
        assert_eq!(
            endpoint.candidates(),
            vec![
                "203.0.113.7:45800".parse().unwrap(),
                "192.168.1.20:45800".parse().unwrap(),
            ]
        );
        assert!(client.resolve("UNKNOWN").await.is_none());
        assert!(client.resolve("BLANK").await.is_none());
        assert!(client.statuses()[0].online);
    }

    #[tokio::test]
    async fn resolve_asks_online_servers_first() {
        let (first, first_log) = mock(|_, _| (500, String::new())).await;
        let (second, second_log) = mock(directory).await;
        let client = RendezvousClient::new(&[first, second], Duration::from_secs(2)).unwrap();
        assert_eq!(client.heartbeat_all("ME", 1, "").await, 1);
        assert!(client.resolve("KNOWN").await.is_some());
        // The failing server was not asked again once the online one answered.
        assert_eq!(first_log.lock().unwrap().len(), 1);
        assert_eq!(second_log.lock().unwrap().len(), 2);
    }

    #[test]
    fn candidates_skip_duplicates_and_garbage() {
        let same = PeerEndpoint {
            address: "10.0.0.1".into(),
            local_address: Some("10.0.0.1".into()),
            port: 7,
        };
        assert_eq!(same.candidates(), vec!["10.0.0.1:7".parse().unwrap()]);
        let junk = PeerEndpoint {
            address: "not an ip".into(),
            local_address: None,
            port: 7,
        };
        assert!(junk.candidates().is_empty());
    }
}
