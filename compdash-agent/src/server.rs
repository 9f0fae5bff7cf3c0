//! The agent's raw-TCP metrics server.
//!
//! One request per connection over the handwritten framing in
//! `compdash_proto::wire`. The dashboard polls `GET /status` every few
//! seconds; `POST /update` receives (or triggers) a self-update;
//! `POST /check-updates` forces a release check.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use compdash_proto::wire;

use crate::sampler::Sampler;
use crate::updater::{Updater, MAX_UPDATE_BYTES};

/// Fixed ports tried beyond the base port before falling back to an
/// OS-assigned one.
const PORT_RETRIES: u16 = 10;

const READ_DEADLINE: Duration = Duration::from_secs(10);
const REBIND_DELAY: Duration = Duration::from_secs(5);
const FIRST_READ_BYTES: usize = 64 * 1024;
const DASHBOARD_WINDOW: Duration = Duration::from_secs(15);
const APPLY_DELAY: Duration = Duration::from_millis(500);

pub struct AgentServer {
    sampler: Arc<Sampler>,
    updater: Arc<Updater>,
    base_port: u16,
    last_poll: Mutex<Option<Instant>>,
    port_tx: watch::Sender<Option<u16>>,
}

impl AgentServer {
    /// Returns the server and a watch that resolves to the bound port once
    /// the listener is up.
    pub fn new(
        sampler: Arc<Sampler>,
        updater: Arc<Updater>,
        base_port: u16,
    ) -> (Arc<Self>, watch::Receiver<Option<u16>>) {
        let (port_tx, port_rx) = watch::channel(None);
        let server = Arc::new(Self {
            sampler,
            updater,
            base_port,
            last_poll: Mutex::new(None),
            port_tx,
        });
        (server, port_rx)
    }

    /// True if a `/status` response was sent within the last 15 seconds.
    pub fn dashboard_connected(&self) -> bool {
        matches!(*self.last_poll.lock(), Some(at) if at.elapsed() < DASHBOARD_WINDOW)
    }

    /// Bind, accept, and dispatch forever. Only a total bind failure (no
    /// fixed port and no ephemeral port) returns, and that is fatal for the
    /// agent.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let listener = bind_with_retry(self.base_port)
                .await
                .context("unable to bind any port")?;
            let port = listener
                .local_addr()
                .context("listener has no local address")?
                .port();
            self.port_tx.send_replace(Some(port));
            info!("listening on port {port}");

            let err = self.accept_loop(&listener).await;
            warn!("listener failed: {err}; rebinding in {}s", REBIND_DELAY.as_secs());
            drop(listener);
            tokio::time::sleep(REBIND_DELAY).await;
        }
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> io::Error {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("connection from {peer}");
                    let server = Arc::clone(self);
                    tokio::spawn(async move { server.handle_connection(stream).await });
                }
                // Per-connection races during accept are not a listener
                // failure; anything else is.
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::Interrupted
                ) =>
                {
                    continue;
                }
                Err(e) => return e,
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        let mut buf = vec![0u8; FIRST_READ_BYTES];
        let read = tokio::time::timeout(READ_DEADLINE, stream.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) if n > 0 => n,
            _ => return,
        };
        buf.truncate(n);

        let Some(line) = wire::parse_request_line(&buf) else {
            respond(&mut stream, 400, b"Bad Request", "text/plain").await;
            return;
        };

        match (line.method.as_str(), line.path.as_str()) {
            ("GET", "/status") => self.handle_status(&mut stream).await,
            ("POST", "/update") => self.handle_update(stream, buf).await,
            ("POST", "/check-updates") => self.handle_check_updates(&mut stream).await,
            _ => respond(&mut stream, 404, b"", "text/plain").await,
        }
    }

    async fn handle_status(&self, stream: &mut TcpStream) {
        let status = self.sampler.current_status();
        match status.to_json() {
            Ok(body) => {
                *self.last_poll.lock() = Some(Instant::now());
                respond(stream, 200, &body, "application/json").await;
            }
            Err(e) => {
                error!("status encode failed: {e}");
                respond(stream, 500, b"Internal Server Error", "text/plain").await;
            }
        }
    }

    async fn handle_check_updates(&self, stream: &mut TcpStream) {
        let updater = Arc::clone(&self.updater);
        tokio::spawn(async move { updater.force_check().await });

        let status = self.sampler.current_status();
        match status.to_json() {
            Ok(body) => respond(stream, 200, &body, "application/json").await,
            Err(e) => {
                error!("status encode failed: {e}");
                respond(stream, 500, b"Internal Server Error", "text/plain").await;
            }
        }
    }

    /// Receive a pushed release archive, or an empty-body trigger meaning
    /// "run your own release check". Exactly one update may be in flight.
    async fn handle_update(&self, mut stream: TcpStream, first_buf: Vec<u8>) {
        if !self.updater.try_begin() {
            respond(&mut stream, 409, b"Update already in progress", "text/plain").await;
            return;
        }

        let declared = match wire::parse_declared_length(&first_buf) {
            None => {
                respond(&mut stream, 400, b"Bad Request", "text/plain").await;
                self.updater.release();
                return;
            }
            Some(n) if n > MAX_UPDATE_BYTES => {
                respond(&mut stream, 413, b"Payload too large", "text/plain").await;
                self.updater.release();
                return;
            }
            Some(n) => n,
        };

        let mut body = wire::extract_body(&first_buf)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        // The size cap bounds this loop; the peer's willingness to keep
        // sending is the only clock.
        while (body.len() as u64) < declared {
            let mut chunk = vec![0u8; FIRST_READ_BYTES];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }

        if (body.len() as u64) < declared {
            respond(&mut stream, 400, b"Incomplete body", "text/plain").await;
            self.updater.release();
            return;
        }
        body.truncate(declared as usize);

        // Flush the response and close before anything irreversible starts.
        respond(&mut stream, 200, b"Update accepted", "text/plain").await;
        drop(stream);

        let updater = Arc::clone(&self.updater);
        tokio::spawn(async move {
            tokio::time::sleep(APPLY_DELAY).await;
            if body.is_empty() {
                // Trigger form: defer to the autonomous release check.
                updater.release();
                updater.force_check().await;
            } else if let Err(e) = updater.apply_archive(&body).await {
                error!("pushed update failed: {e}");
                updater.release();
            }
        });
    }
}

/// Try `base..=base+10` in order, then ask the OS for an ephemeral port.
async fn bind_with_retry(base_port: u16) -> io::Result<TcpListener> {
    for offset in 0..=PORT_RETRIES {
        let port = base_port + offset;
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("port {port} unavailable: {e}"),
        }
    }
    TcpListener::bind(("0.0.0.0", 0)).await
}

async fn respond(stream: &mut TcpStream, status: u16, body: &[u8], content_type: &str) {
    let bytes = wire::build_response(status, body, content_type);
    if let Err(e) = stream.write_all(&bytes).await {
        debug!("response write failed: {e}");
        return;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use compdash_proto::Status;

    fn test_server(base_port: u16) -> (Arc<AgentServer>, watch::Receiver<Option<u16>>) {
        let sampler = Arc::new(Sampler::new("0.0.0-test"));
        let updater = Arc::new(Updater::new("0.0.0-test", "compdash-app/compdash", false));
        AgentServer::new(sampler, updater, base_port)
    }

    async fn started(base_port: u16) -> (Arc<AgentServer>, u16) {
        let (server, mut port_rx) = test_server(base_port);
        tokio::spawn(Arc::clone(&server).run());
        let port = loop {
            if let Some(port) = *port_rx.borrow_and_update() {
                break port;
            }
            port_rx.changed().await.unwrap();
        };
        (server, port)
    }

    async fn round_trip(port: u16, request: Vec<u8>) -> Vec<u8> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn bind_walks_fixed_ports_then_goes_ephemeral() {
        let base = 52_300;
        let first = bind_with_retry(base).await.unwrap();
        assert_eq!(first.local_addr().unwrap().port(), base);

        let second = bind_with_retry(base).await.unwrap();
        assert_eq!(second.local_addr().unwrap().port(), base + 1);

        let mut held = vec![first, second];
        for offset in 2..=PORT_RETRIES {
            held.push(bind_with_retry(base).await.unwrap());
            assert_eq!(held.last().unwrap().local_addr().unwrap().port(), base + offset);
        }

        // All eleven fixed ports are now busy: the next bind is ephemeral.
        let fallback = bind_with_retry(base).await.unwrap();
        let port = fallback.local_addr().unwrap().port();
        assert!(!(base..=base + PORT_RETRIES).contains(&port));
    }

    #[tokio::test]
    async fn status_round_trip_serves_json() {
        let (server, port) = started(52_330).await;
        assert!(!server.dashboard_connected());

        let response =
            round_trip(port, wire::build_request("GET", "/status", b"", None)).await;
        let body = wire::extract_body(&response).unwrap();
        let status = Status::from_json(body).unwrap();
        assert!(!status.hardware_uuid.is_empty());

        // The poll is now visible to the liveness window.
        assert!(server.dashboard_connected());
    }

    #[tokio::test]
    async fn unknown_path_is_404_with_empty_body() {
        let (_server, port) = started(52_340).await;
        let response =
            round_trip(port, wire::build_request("GET", "/nope", b"", None)).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found"));
        assert_eq!(wire::extract_body(&response).unwrap(), b"");
    }

    #[tokio::test]
    async fn oversized_update_is_rejected_without_buffering() {
        let (_server, port) = started(52_350).await;
        let request = format!(
            "POST /update HTTP/1.1\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            100 * 1024 * 1024 + 1
        );
        let response = round_trip(port, request.into_bytes()).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 413"));
    }

    #[tokio::test]
    async fn update_without_length_is_bad_request() {
        let (_server, port) = started(52_360).await;
        let response = round_trip(
            port,
            b"POST /update HTTP/1.1\r\nConnection: close\r\n\r\n".to_vec(),
        )
        .await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn concurrent_update_is_conflict() {
        let (server, port) = started(52_370).await;
        // A second `/update` while one is in flight must observe the latch.
        assert!(server.updater.try_begin());

        let response =
            round_trip(port, wire::build_request("POST", "/update", b"", None)).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 409"));
        server.updater.release();
    }
}
