//! Async client for the broker's newline-delimited JSON transport.

use std::path::PathBuf;

use gate_proto::{ErrorKind, OwnerToken, PathKey, PathSnapshot, Request, RequestId, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use crate::error::ProxyError;

/// Where the broker listens, from the proxy's point of view.
#[derive(Debug, Clone)]
pub enum BrokerEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

enum Conn {
    Unix(BufReader<tokio::net::unix::OwnedReadHalf>, tokio::net::unix::OwnedWriteHalf),
    Tcp(BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf),
}

impl Conn {
    async fn connect(endpoint: &BrokerEndpoint) -> Result<Self, ProxyError> {
        match endpoint {
            BrokerEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| ProxyError::BrokerUnreachable(e.to_string()))?;
                let (r, w) = stream.into_split();
                Ok(Self::Unix(BufReader::new(r), w))
            }
            BrokerEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| ProxyError::BrokerUnreachable(e.to_string()))?;
                let (r, w) = stream.into_split();
                Ok(Self::Tcp(BufReader::new(r), w))
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), ProxyError> {
        let res = match self {
            Self::Unix(_, w) => w.write_all(line.as_bytes()).await.and(w.flush().await),
            Self::Tcp(_, w) => w.write_all(line.as_bytes()).await.and(w.flush().await),
        };
        res.map_err(|e| ProxyError::BrokerUnreachable(e.to_string()))
    }

    async fn read_line(&mut self) -> Result<String, ProxyError> {
        let mut buf = String::new();
        let n = match self {
            Self::Unix(r, _) => r.read_line(&mut buf).await,
            Self::Tcp(r, _) => r.read_line(&mut buf).await,
        }
        .map_err(|e| ProxyError::BrokerUnreachable(e.to_string()))?;
        if n == 0 {
            return Err(ProxyError::BrokerUnreachable("connection closed by broker".into()));
        }
        Ok(buf)
    }
}

/// A reconnecting client bound to one broker endpoint. Reconnects lazily on
/// the next call after a transport failure rather than eagerly retrying.
pub struct BrokerClient {
    endpoint: BrokerEndpoint,
    conn: Mutex<Option<Conn>>,
    next_request_id: std::sync::atomic::AtomicU64,
}

impl BrokerClient {
    #[must_use]
    pub const fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            conn: Mutex::new(None),
            next_request_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn fresh_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    async fn roundtrip(&self, request: &Request) -> Result<Response, ProxyError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Conn::connect(&self.endpoint).await?);
        }

        let line = request.to_line();
        let result = async {
            let conn = guard.as_mut().expect("just connected above");
            conn.send_line(&line).await?;
            let reply = conn.read_line().await?;
            Response::from_line(&reply).map_err(|e| ProxyError::TransportError(e.to_string()))
        }
        .await;

        if result.is_err() {
            // Drop the stale connection so the next call reconnects.
            *guard = None;
        }
        result
    }

    /// Acquire `mode` on `path` for `owner`, blocking until granted or
    /// `acquire_timeout_ms` elapses.
    pub async fn acquire(
        &self,
        path: PathKey,
        mode: gate_proto::LockMode,
        owner: OwnerToken,
        acquire_timeout_ms: u64,
    ) -> Result<(), ProxyError> {
        let request_id = self.fresh_request_id();
        let request = Request::Acquire { path: path.clone(), mode, owner, request_id, acquire_timeout_ms };
        match self.roundtrip(&request).await? {
            Response::Granted => Ok(()),
            Response::Timeout => Err(ProxyError::QueueTimeout { path }),
            other => Err(response_to_error(&path, &other)),
        }
    }

    /// Release one hold of `owner`'s lock on `path`.
    pub async fn release(&self, path: PathKey, owner: OwnerToken) -> Result<(), ProxyError> {
        let request = Request::Release { path: path.clone(), owner };
        match self.roundtrip(&request).await? {
            Response::Granted => Ok(()),
            Response::NotHeld => Err(ProxyError::NotHeld { path }),
            other => Err(response_to_error(&path, &other)),
        }
    }

    /// Refresh the lease on `owner`'s lock on `path`.
    pub async fn heartbeat(&self, path: PathKey, owner: OwnerToken) -> Result<(), ProxyError> {
        let request = Request::Heartbeat { path: path.clone(), owner };
        match self.roundtrip(&request).await? {
            Response::Granted => Ok(()),
            Response::NotHeld => Err(ProxyError::NotHeld { path }),
            Response::Expired => Err(ProxyError::LeaseExpired { path }),
            other => Err(response_to_error(&path, &other)),
        }
    }

    /// Fetch an observability snapshot of every tracked path's queue.
    pub async fn status(&self) -> Result<Vec<PathSnapshot>, ProxyError> {
        match self.roundtrip(&Request::Status).await? {
            Response::StatusOk { paths } => Ok(paths),
            other => Err(response_to_error("<status>", &other)),
        }
    }
}

fn response_to_error(path: &str, response: &Response) -> ProxyError {
    match response {
        Response::Expired => ProxyError::ForceExpired { path: path.to_string() },
        Response::Error { error_kind, message } => match error_kind {
            ErrorKind::QueueTimeout => ProxyError::QueueTimeout { path: path.to_string() },
            ErrorKind::NotHeld => ProxyError::NotHeld { path: path.to_string() },
            ErrorKind::LeaseExpired => ProxyError::LeaseExpired { path: path.to_string() },
            ErrorKind::ForceExpired => ProxyError::ForceExpired { path: path.to_string() },
            ErrorKind::BrokerUnreachable => ProxyError::BrokerUnreachable(message.clone()),
            ErrorKind::TransportError => ProxyError::TransportError(message.clone()),
            ErrorKind::StoreFailure => ProxyError::StoreFailure(message.clone()),
            ErrorKind::BackingIoError => ProxyError::StoreFailure(message.clone()),
        },
        unexpected => ProxyError::TransportError(format!("unexpected response: {unexpected:?}")),
    }
}
