use super::config::{default_config_path, install_root_for, BridgeConfig};
use dhtfox::cache::{CacheMaterializer, DiskCache};
use dhtfox::component::{ComponentHandle, ComponentLoader, ComponentRegistry};
use dhtfox::logging::{init_tracing, LoggerBridge};
use dhtfox::node::{
    AnnounceError, AnnounceReport, CacheAnnouncer, KeyValueClient, LifecycleError, NodeLifecycle,
    NodeState,
};
use dhtfox::peer::{PeerServer, PeerServerError};
use dhtfox::trust::TrustGrantor;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Run the bridge
///
/// Loads the configured component, starts the node and the peer server,
/// announces the local cache and then serves a line shell on stdin until
/// `quit` or EOF. The node and the peer server are stopped on the way out.
///
/// Configuration is loaded from `--config` if provided, otherwise from
/// `~/.local/share/dhtfox/config.toml`. A missing config is generated with
/// defaults (and the built-in component manifest) first.
pub async fn execute(
    config_path: Option<String>,
    no_announce: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        BridgeConfig::load(&config_path)?
    } else {
        println!("No config file found. Creating default configuration...");
        BridgeConfig::create_default(&config_path, &install_root_for(&config_path))?;
        println!("   Created: {}", config_path.display());
        BridgeConfig::load(&config_path)?
    };

    init_tracing(&config.logging.level, config.logging.file.as_deref())?;
    info!(config = %config_path.display(), "starting dhtfox bridge");

    let bridge = Bridge::open(&config).await?;
    let announce = config.announce.enabled && !no_announce;

    let mut stdout = tokio::io::stdout();
    let stdin = BufReader::new(tokio::io::stdin());
    serve(&bridge, announce, stdin, &mut stdout).await?;

    bridge.stop().await;
    Ok(())
}

/// Everything the running bridge owns.
pub struct Bridge {
    config: BridgeConfig,
    component: ComponentHandle,
    cache: DiskCache,
    materializer: CacheMaterializer,
    log: LoggerBridge,
    lifecycle: Arc<NodeLifecycle>,
    client: KeyValueClient,
    peer: Mutex<Option<PeerServer>>,
}

impl Bridge {
    /// Load the component and open the cache. Does not start the node.
    pub async fn open(config: &BridgeConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let grantor = Arc::new(TrustGrantor::new());
        let loader = ComponentLoader::new(ComponentRegistry::with_builtin(), grantor);
        let component = loader.load(
            &config.component.resolved_locations(),
            &config.component.entry,
        )?;

        let cache = DiskCache::open(config.cache.dir.clone()).await.map_err(|e| {
            format!(
                "Failed to open cache directory '{}': {}",
                config.cache.dir.display(),
                e
            )
        })?;
        let materializer = CacheMaterializer::new(Arc::new(cache.clone()), &config.cache.spool_dir)
            .map_err(|e| {
                format!(
                    "Failed to create spool directory '{}': {}",
                    config.cache.spool_dir.display(),
                    e
                )
            })?;

        let lifecycle = Arc::new(NodeLifecycle::new());
        let client = KeyValueClient::new(Arc::clone(&lifecycle));

        Ok(Self {
            config: config.clone(),
            component,
            cache,
            materializer,
            log: LoggerBridge::tracing(),
            lifecycle,
            client,
            peer: Mutex::new(None),
        })
    }

    /// Start the node; `Ok(false)` when the component could not join.
    pub async fn start(&self) -> Result<bool, LifecycleError> {
        self.lifecycle
            .start(
                &self.component,
                Arc::new(self.materializer.clone()),
                Arc::new(self.log.clone()),
                self.config.node.params(),
            )
            .await
    }

    /// Serve cached responses to peers on the proxy port. Returns the bound
    /// address; a second call returns the running server's address.
    pub async fn start_peer_server(&self) -> Result<SocketAddr, PeerServerError> {
        let mut slot = self.peer.lock().await;
        if let Some(server) = slot.as_ref() {
            return Ok(server.local_addr());
        }
        let addr = SocketAddr::new(self.config.peer.listen_address, self.config.node.proxy_port);
        let server = PeerServer::bind(addr, self.materializer.clone()).await?;
        let bound = server.local_addr();
        *slot = Some(server);
        Ok(bound)
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.lock().await.as_ref().map(PeerServer::local_addr)
    }

    /// Announce the cache under the port peers can actually reach: the peer
    /// server's when it runs, the configured proxy port otherwise.
    pub async fn announce(&self) -> Result<AnnounceReport, AnnounceError> {
        let port = match self.peer_addr().await {
            Some(addr) => addr.port(),
            None => self.config.node.proxy_port,
        };
        let announcer = CacheAnnouncer::new(
            self.config.node.advertise_address.clone(),
            port,
            self.config.announce.policy(),
        );
        announcer.announce_all(&self.client, &self.cache).await
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
        let server = self.peer.lock().await.take();
        if let Some(server) = server {
            server.shutdown().await;
        }
    }

    pub fn client(&self) -> &KeyValueClient {
        &self.client
    }

    pub fn state(&self) -> NodeState {
        self.lifecycle.state()
    }
}

/// One shell input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Get(String),
    Put(String, String),
    Status,
    Quit,
    Empty,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "" => Ok(Self::Empty),
            "get" if !rest.is_empty() && !rest.contains(char::is_whitespace) => {
                Ok(Self::Get(rest.to_string()))
            }
            "get" => Err("usage: get <key>".to_string()),
            "put" => match rest.split_once(char::is_whitespace) {
                Some((key, value)) => Ok(Self::Put(key.to_string(), value.trim().to_string())),
                None => Err("usage: put <key> <value>".to_string()),
            },
            "status" => Ok(Self::Status),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

async fn say<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

async fn alert<W: AsyncWrite + Unpin>(out: &mut W, message: &str) -> io::Result<()> {
    say(out, &format!("! {}", message)).await
}

/// Start the node, optionally announce the cache, then run the shell.
pub async fn serve<R, W>(
    bridge: &Bridge,
    announce: bool,
    input: R,
    out: &mut W,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if bridge.start().await? {
        say(out, &format!("node running (identity {})", bridge.config.node.identity)).await?;
        let mut reachable = true;
        if bridge.config.peer.enabled {
            match bridge.start_peer_server().await {
                Ok(addr) => say(out, &format!("serving cached responses on {}", addr)).await?,
                Err(e) => {
                    warn!(error = %e, "peer server not started");
                    alert(out, &format!("{}; cache not announced", e)).await?;
                    reachable = false;
                }
            }
        }
        if announce && reachable {
            match bridge.announce().await {
                Ok(report) if report.failed.is_empty() => {
                    say(out, &format!("announced {} cached URLs", report.announced)).await?;
                }
                Ok(report) => {
                    alert(
                        out,
                        &format!(
                            "announced {} cached URLs, {} failed",
                            report.announced,
                            report.failed.len()
                        ),
                    )
                    .await?;
                }
                Err(e) => alert(out, &format!("announcement aborted: {}", e)).await?,
            }
        }
    } else {
        alert(out, "DHT node failed to start; get/put are unavailable").await?;
    }

    shell(bridge, input, out).await?;
    Ok(())
}

/// Serve `get`/`put`/`status`/`quit` lines until `quit` or end of input.
pub async fn shell<R, W>(bridge: &Bridge, input: R, out: &mut W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let command = match ShellCommand::parse(&line) {
            Ok(command) => command,
            Err(usage) => {
                alert(out, &usage).await?;
                continue;
            }
        };

        match command {
            ShellCommand::Empty => {}
            ShellCommand::Quit => break,
            ShellCommand::Status => {
                say(out, &format!("node {}", bridge.state())).await?;
            }
            ShellCommand::Get(key) => match bridge.client().get(&key).await {
                Ok(Some(value)) => say(out, &value).await?,
                Ok(None) => say(out, "(not found)").await?,
                Err(e) => {
                    warn!(%key, error = %e, "get failed");
                    alert(out, &format!("get failed: {}", e)).await?;
                }
            },
            ShellCommand::Put(key, value) => match bridge.client().put(&key, &value).await {
                Ok(()) => say(out, "ok").await?,
                Err(e) => {
                    warn!(%key, error = %e, "put failed");
                    alert(out, &format!("put failed: {}", e)).await?;
                }
            },
        }
    }
    Ok(())
}
