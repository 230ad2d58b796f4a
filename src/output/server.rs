//! Local statistics service
//!
//! A running crawl answers statistics queries over a Unix socket using
//! newline-delimited JSON, one request per line and one response per line.
//! When no crawl is running, queries fall back to reading the store directly.

use crate::output::stats::{self, ActivePeer, CrawlStatistics, StatsScope};
use crate::storage::Store;
use crate::AtlasError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

/// A statistics query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsRequest {
    NodeCount,
    Today,
    Lifetime,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsResponse {
    NodeCount(u64),
    Statistics(CrawlStatistics),
    Active(Vec<ActivePeer>),
    Error(String),
}

/// Answers a request from the store
pub fn answer(store: &Store, request: StatsRequest) -> StatsResponse {
    let result = match request {
        StatsRequest::NodeCount => store
            .count(&crate::storage::CounterKind::Nodes)
            .map(StatsResponse::NodeCount),
        StatsRequest::Today => {
            stats::load_statistics(store, StatsScope::Today).map(StatsResponse::Statistics)
        }
        StatsRequest::Lifetime => {
            stats::load_statistics(store, StatsScope::Lifetime).map(StatsResponse::Statistics)
        }
        StatsRequest::Active => stats::load_active_peers(store).map(StatsResponse::Active),
    };

    result.unwrap_or_else(|e| StatsResponse::Error(e.to_string()))
}

/// Statistics server bound to a Unix socket
///
/// The socket file is removed when the server is dropped.
pub struct StatsServer {
    listener: UnixListener,
    socket_path: PathBuf,
    store: Arc<Store>,
}

impl StatsServer {
    /// Binds the socket, replacing any stale socket file left by a crashed run
    ///
    /// # Arguments
    ///
    /// * `socket_path` - Where to create the socket
    /// * `store` - Store the answers are read from
    pub fn bind(socket_path: impl Into<PathBuf>, store: Arc<Store>) -> crate::Result<Self> {
        let socket_path = socket_path.into();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!("Stats service listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            store,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until the task is dropped
    pub async fn run(self) -> crate::Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, store).await {
                    tracing::debug!("Stats connection closed: {}", e);
                }
            });
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(stream: UnixStream, store: Arc<Store>) -> crate::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<StatsRequest>(&line) {
            Ok(request) => {
                tracing::trace!("Stats request {:?}", request);
                answer(&store, request)
            }
            Err(e) => StatsResponse::Error(format!("malformed request: {}", e)),
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }

    Ok(())
}

/// Client side of the statistics socket
pub struct StatsClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl StatsClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> crate::Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one request and waits for its response
    pub async fn request(&mut self, request: StatsRequest) -> crate::Result<StatsResponse> {
        let mut encoded = serde_json::to_vec(&request)?;
        encoded.push(b'\n');
        self.writer.write_all(&encoded).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(AtlasError::Stats("server closed the connection".to_string()));
        }

        Ok(serde_json::from_str(&line)?)
    }
}

/// Queries a running crawl, or reads the store directly if none is listening
///
/// # Arguments
///
/// * `socket_path` - Socket of a possibly running crawl
/// * `open_store` - Opens the store for the local fallback
pub async fn query<F>(
    socket_path: &Path,
    request: StatsRequest,
    open_store: F,
) -> crate::Result<StatsResponse>
where
    F: FnOnce() -> crate::Result<Store>,
{
    match StatsClient::connect(socket_path).await {
        Ok(mut client) => client.request(request).await,
        Err(e) => {
            tracing::debug!(
                "No stats service at {} ({}), reading store directly",
                socket_path.display(),
                e
            );
            let store = open_store()?;
            Ok(answer(&store, request))
        }
    }
}
