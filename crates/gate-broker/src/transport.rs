//! Connection acceptance and per-connection request dispatch.
//!
//! One newline-delimited JSON [`gate_proto::Request`] in, one
//! [`gate_proto::Response`] out, per line, for the lifetime of a connection.
//! The Unix-domain-socket and TCP listeners share this dispatch loop; only
//! how the stream is accepted differs.

use std::path::PathBuf;
use std::sync::Arc;

use gate_proto::{Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use gate_broker_core::Broker;

/// Where the broker listens.
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

/// Accept connections on `endpoint` forever, dispatching each to `broker`.
pub async fn serve(endpoint: Endpoint, broker: Arc<Broker>) -> anyhow::Result<()> {
    match endpoint {
        Endpoint::Unix(path) => serve_unix(&path, broker).await,
        Endpoint::Tcp { host, port } => serve_tcp(&host, port, broker).await,
    }
}

async fn serve_unix(path: &std::path::Path, broker: Arc<Broker>) -> anyhow::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "broker listening on unix socket");
    loop {
        let (stream, _addr) = listener.accept().await?;
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(err) = handle_connection(reader, writer, broker).await {
                warn!(%err, "connection ended with an error");
            }
        });
    }
}

async fn serve_tcp(host: &str, port: u16, broker: Arc<Broker>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "broker listening on tcp");
    loop {
        let (stream, _addr) = listener.accept().await?;
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(err) = handle_connection(reader, writer, broker).await {
                warn!(%err, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection<R, W>(reader: R, mut writer: W, broker: Arc<Broker>) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match Request::from_line(&line) {
            Ok(request) => dispatch(&broker, request).await,
            Err(err) => {
                debug!(%err, "malformed request line");
                Response::Error {
                    error_kind: gate_proto::ErrorKind::TransportError,
                    message: err.to_string(),
                }
            }
        };
        writer.write_all(response.to_line().as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn dispatch(broker: &Arc<Broker>, request: Request) -> Response {
    match request {
        Request::Acquire { path, mode, owner, request_id, acquire_timeout_ms } => {
            match broker.acquire(path, mode, owner, request_id, acquire_timeout_ms).await {
                Ok(true) => Response::Granted,
                Ok(false) => Response::Timeout,
                Err(err) => store_failure(&err),
            }
        }
        Request::Release { path, owner } => match broker.release(path, owner).await {
            Ok(()) => Response::Granted,
            Err(gate_broker_core::BrokerError::NotHeld { .. }) => Response::NotHeld,
            Err(err) => store_failure(&err),
        },
        Request::Heartbeat { path, owner } => match broker.heartbeat(path, owner).await {
            Ok(()) => Response::Granted,
            Err(gate_broker_core::BrokerError::NotHeld { .. }) => Response::NotHeld,
            Err(gate_broker_core::BrokerError::Expired { .. }) => Response::Expired,
            Err(err) => store_failure(&err),
        },
        Request::Status => Response::StatusOk { paths: broker.status().await },
    }
}

fn store_failure(err: &gate_broker_core::BrokerError) -> Response {
    Response::Error {
        error_kind: gate_proto::ErrorKind::StoreFailure,
        message: err.to_string(),
    }
}
