//! TCP accept loop for peer requests.
//!
//! One task accepts connections; each connection gets its own task that
//! reads a single request, answers it from the cache and closes.

use super::request::{parse_request_line, response_head, Method, PeerRequest, Status};
use crate::cache::{CacheMaterializer, HeaderMap};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on the request line plus headers.
const MAX_HEAD_BYTES: u64 = 16 * 1024;

/// How long a peer may take to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PeerServerError {
    #[error("failed to bind peer server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Running peer request server.
#[derive(Debug)]
pub struct PeerServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerServer {
    /// Bind `addr` and start serving entries of `cache`.
    pub async fn bind(
        addr: SocketAddr,
        cache: CacheMaterializer,
    ) -> Result<Self, PeerServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| PeerServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| PeerServerError::Bind { addr, source })?;

        let (shutdown, stopped) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, cache, stopped));

        info!(%local_addr, "peer server listening");
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and release the port. Requests already being answered
    /// run to completion.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "peer server task ended abnormally");
        }
        info!(local_addr = %self.local_addr, "peer server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    cache: CacheMaterializer,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "peer connected");
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &cache).await {
                            debug!(%peer, error = %e, "peer connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    cache: &CacheMaterializer,
) -> io::Result<()> {
    let started = Instant::now();
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half.take(MAX_HEAD_BYTES));

    let request = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut reader)).await {
        Ok(Ok(line)) => parse_request_line(&line),
        Ok(Err(e)) if e.kind() == ErrorKind::InvalidData => Err(Status::BadRequest),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(%peer, "request head timed out");
            return Ok(());
        }
    };

    let (url, status) = match request {
        Ok(request) => {
            let status = answer(&request, cache, &mut write_half).await?;
            (request.url, status)
        }
        Err(status) => {
            write_empty(&mut write_half, status).await?;
            (String::new(), status)
        }
    };
    write_half.shutdown().await?;

    info!(
        %peer,
        %url,
        status = status.code(),
        elapsed = ?started.elapsed(),
        "peer request"
    );
    Ok(())
}

/// Read the request head and return its first line. Header lines are
/// consumed and ignored.
async fn read_head<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 || !request_line.ends_with('\n') {
        return Err(io::Error::new(ErrorKind::InvalidData, "incomplete request line"));
    }

    let mut header = String::new();
    loop {
        header.clear();
        let n = reader.read_line(&mut header).await?;
        if n == 0 || header.trim_end().is_empty() {
            break;
        }
    }

    Ok(request_line.trim_end().to_string())
}

async fn answer<W>(
    request: &PeerRequest,
    cache: &CacheMaterializer,
    out: &mut W,
) -> io::Result<Status>
where
    W: AsyncWrite + Unpin,
{
    let Some(entry) = cache.get_cache_entry(&request.url).await else {
        write_empty(out, Status::NotFound).await?;
        return Ok(Status::NotFound);
    };

    let head = response_head(Status::Ok, entry.headers(), entry.content_length());
    out.write_all(head.as_bytes()).await?;
    if request.method == Method::Get {
        let (url, mut body) = entry.into_body();
        let sent = tokio::io::copy(&mut body, out).await?;
        debug!(%url, bytes = sent, "cached body sent");
    }
    Ok(Status::Ok)
}

async fn write_empty<W>(out: &mut W, status: Status) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = response_head(status, &HeaderMap::new(), Some(0));
    out.write_all(head.as_bytes()).await
}
