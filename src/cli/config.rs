//! Bridge configuration file handling
//!
//! Provides default configuration generation and loading for the bridge.
//! Configuration files are TOML. `init-config` writes the config together
//! with the manifest of the built-in component under the install root, so a
//! fresh install can `run` without further setup.

use dhtfox::component::{ComponentLocation, ComponentManifest, MemoryDht, NodeParams};
use dhtfox::node::announce::duration_str;
use dhtfox::node::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Manifest of the built-in component, relative to the install root.
pub const BUILTIN_MANIFEST: &str = "components/memory-dht.toml";

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Which component to load and from where
    pub component: ComponentConfig,

    /// Parameters handed to the node at start
    #[serde(default)]
    pub node: NodeConfig,

    /// Host HTTP cache and spool directories
    #[serde(default)]
    pub cache: CacheConfig,

    /// Announcement of cached URLs after start
    #[serde(default)]
    pub announce: AnnounceConfig,

    /// Endpoint serving cached responses to other peers
    #[serde(default)]
    pub peer: PeerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Component location configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Host installation root; `locations` are relative to it
    pub install_root: PathBuf,

    /// Manifests that make up the component
    #[serde(default = "default_locations")]
    pub locations: Vec<String>,

    /// Entry symbol to instantiate
    #[serde(default = "default_entry")]
    pub entry: String,
}

/// Node start parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub identity: String,
    pub bootstrap: String,
    pub dht_port: u16,
    pub proxy_port: u16,
    pub upnp: bool,

    /// Address other peers should use to reach this proxy
    pub advertise_address: String,
}

/// Cache directories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where the proxy keeps cached responses
    pub dir: PathBuf,

    /// Where materialized cache files are written for the node
    pub spool_dir: PathBuf,
}

/// Announcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    pub enabled: bool,
    pub max_retries: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

/// Peer request server settings. It listens on `node.proxy_port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub enabled: bool,
    pub listen_address: IpAddr,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_locations() -> Vec<String> {
    vec![BUILTIN_MANIFEST.to_string()]
}

fn default_entry() -> String {
    MemoryDht::ENTRY.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: "abc".to_string(),
            bootstrap: "125.6.175.11:3997".to_string(),
            dht_port: 3997,
            proxy_port: 8080,
            upnp: false,
            advertise_address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            spool_dir: std::env::temp_dir().join("dhtfox-spool"),
        }
    }
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            enabled: true,
            max_retries: policy.max_retries,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl ComponentConfig {
    /// Configured locations resolved against the install root.
    pub fn resolved_locations(&self) -> Vec<ComponentLocation> {
        self.locations
            .iter()
            .map(|relative| ComponentLocation::from_install_root(&self.install_root, relative))
            .collect()
    }
}

impl NodeConfig {
    pub fn params(&self) -> NodeParams {
        let mut params = NodeParams::new(
            self.identity.clone(),
            self.bootstrap.clone(),
            self.dht_port,
            self.proxy_port,
        );
        params.upnp = self.upnp;
        params
    }
}

impl AnnounceConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration rooted at `install_root`
    pub fn new(install_root: PathBuf) -> Self {
        Self {
            component: ComponentConfig {
                install_root,
                locations: default_locations(),
                entry: default_entry(),
            },
            node: NodeConfig::default(),
            cache: CacheConfig::default(),
            announce: AnnounceConfig::default(),
            peer: PeerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: BridgeConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        config
            .validate()
            .map_err(|e| format!("Invalid config file '{}': {}", path.display(), e))?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.component.locations.is_empty() {
            return Err("[component] locations must not be empty".to_string());
        }
        if self.component.entry.trim().is_empty() {
            return Err("[component] entry must not be empty".to_string());
        }
        if self.node.identity.is_empty() {
            return Err("[node] identity must not be empty".to_string());
        }
        if self.announce.base_delay > self.announce.max_delay {
            return Err("[announce] base_delay exceeds max_delay".to_string());
        }
        Ok(())
    }

    /// Generate default configuration content as a string with comments
    ///
    /// The values are those of [`BridgeConfig::new`].
    pub fn generate_default_toml(install_root: &Path) -> String {
        let config = Self::new(install_root.to_path_buf());
        format!(
            r#"# DHTFox Bridge Configuration

[component]
# Host installation root; locations below are relative to it
install_root = {install_root}

# Manifests making up the DHT component. Only these locations are trusted.
locations = [{locations}]

# Entry symbol to instantiate
entry = {entry}

[node]
identity = {identity}
bootstrap = {bootstrap}
dht_port = {dht_port}
proxy_port = {proxy_port}
upnp = {upnp}

# Address announced to other peers for this proxy
advertise_address = {advertise}

[cache]
# Proxy HTTP cache directory
dir = {cache_dir}

# Materialized cache files for the node
spool_dir = {spool_dir}

[announce]
# Publish cached URLs on the DHT after the node starts
enabled = {announce}
max_retries = {max_retries}
base_delay = "{base_delay}"
max_delay = "{max_delay}"

[peer]
# Serve cached responses to other peers on proxy_port
enabled = {peer}
listen_address = "{listen_address}"

[logging]
# Log level: trace, debug, info, warn, error
level = {level}

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/dhtfox/dhtfox.log"
"#,
            install_root = quoted(&config.component.install_root.display().to_string()),
            locations = config
                .component
                .locations
                .iter()
                .map(|l| quoted(l))
                .collect::<Vec<_>>()
                .join(", "),
            entry = quoted(&config.component.entry),
            identity = quoted(&config.node.identity),
            bootstrap = quoted(&config.node.bootstrap),
            dht_port = config.node.dht_port,
            proxy_port = config.node.proxy_port,
            upnp = config.node.upnp,
            advertise = quoted(&config.node.advertise_address),
            cache_dir = quoted(&config.cache.dir.display().to_string()),
            spool_dir = quoted(&config.cache.spool_dir.display().to_string()),
            announce = config.announce.enabled,
            max_retries = config.announce.max_retries,
            base_delay = humantime::format_duration(config.announce.base_delay),
            max_delay = humantime::format_duration(config.announce.max_delay),
            peer = config.peer.enabled,
            listen_address = config.peer.listen_address,
            level = quoted(&config.logging.level),
        )
    }

    /// Create and save a default configuration file, plus the built-in
    /// component manifest under `install_root`
    pub fn create_default(
        config_path: &Path,
        install_root: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let contents = Self::generate_default_toml(install_root);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        write_builtin_manifest(install_root)?;

        Ok(())
    }
}

/// TOML string literal for `value`.
fn quoted(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

/// Write the manifest exporting [`MemoryDht::ENTRY`].
pub fn write_builtin_manifest(install_root: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = install_root.join(BUILTIN_MANIFEST);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create component directory: {}", e))?;
    }

    let manifest = ComponentManifest::new("dhtfox-core", [MemoryDht::ENTRY.to_string()]);
    let contents = manifest
        .to_toml()
        .map_err(|e| format!("Failed to serialize manifest: {}", e))?;
    fs::write(&path, contents)
        .map_err(|e| format!("Failed to write manifest '{}': {}", path.display(), e))?;

    Ok(path)
}

/// `init-config` command
pub fn init(config_path: Option<String>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(format!(
            "Config file '{}' already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    let install_root = install_root_for(&config_path);
    BridgeConfig::create_default(&config_path, &install_root)?;

    println!("Created: {}", config_path.display());
    println!("Component manifest: {}", install_root.join(BUILTIN_MANIFEST).display());
    Ok(())
}

/// Install root used for a config at `config_path`: its directory.
pub fn install_root_for(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default config file path
///
/// - Config: ~/.local/share/dhtfox/config.toml
pub fn default_config_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dhtfox")
        .join("config.toml")
}

/// Get the default proxy cache directory (~/.dhtfox)
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dhtfox")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::new(PathBuf::from("/opt/dhtfox"));

        assert_eq!(config.node.identity, "abc");
        assert_eq!(config.node.bootstrap, "125.6.175.11:3997");
        assert_eq!(config.node.dht_port, 3997);
        assert_eq!(config.node.proxy_port, 8080);
        assert_eq!(config.component.entry, MemoryDht::ENTRY);
        assert!(config.announce.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_default_file_matches_new() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        BridgeConfig::create_default(&config_path, temp_dir.path()).unwrap();

        let loaded = BridgeConfig::load(&config_path).unwrap();
        assert_eq!(loaded, BridgeConfig::new(temp_dir.path().to_path_buf()));
    }

    #[test]
    fn test_default_file_quotes_awkward_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("it's \"here\"");
        let config_path = root.join("config.toml");

        BridgeConfig::create_default(&config_path, &root).unwrap();

        let loaded = BridgeConfig::load(&config_path).unwrap();
        assert_eq!(loaded.component.install_root, root);
    }

    #[test]
    fn test_create_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        BridgeConfig::create_default(&config_path, temp_dir.path()).unwrap();

        assert!(config_path.exists());
        let config = BridgeConfig::load(&config_path).unwrap();
        assert_eq!(config.component.install_root, temp_dir.path());
        assert_eq!(config.announce.policy(), RetryPolicy::default());

        let manifest_path = temp_dir.path().join(BUILTIN_MANIFEST);
        let manifest =
            ComponentManifest::parse(&fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert!(manifest.exports(MemoryDht::ENTRY));
    }

    #[test]
    fn test_resolved_locations_use_install_root() {
        let config = BridgeConfig::new(PathBuf::from("/opt/dhtfox/"));
        let locations = config.component.resolved_locations();

        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].as_str(), "/opt/dhtfox/components/memory-dht.toml");
    }

    #[test]
    fn test_node_params() {
        let mut config = BridgeConfig::new(PathBuf::from("/opt/dhtfox"));
        config.node.upnp = true;
        let params = config.node.params();

        assert_eq!(params.identity, "abc");
        assert_eq!(params.bootstrap, "125.6.175.11:3997");
        assert_eq!(params.dht_port, 3997);
        assert_eq!(params.proxy_port, 8080);
        assert!(params.upnp);
    }

    #[test]
    fn test_generate_default_toml() {
        let toml = BridgeConfig::generate_default_toml(Path::new("/opt/dhtfox"));

        assert!(toml.contains("/opt/dhtfox"));
        assert!(toml.contains("identity = \"abc\""));
        assert!(toml.contains("dht_port = 3997"));
        assert!(toml.contains("base_delay = \"1s\""));
        assert!(toml.contains(BUILTIN_MANIFEST));
        assert!(toml.contains("[peer]"));
        assert!(toml.contains("listen_address = \"0.0.0.0\""));
    }

    #[test]
    fn test_load_config_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let minimal_config = r#"
[component]
install_root = "/opt/dhtfox"
"#;
        fs::write(&config_path, minimal_config).unwrap();

        let config = BridgeConfig::load(&config_path).unwrap();

        assert_eq!(config.component.locations, vec![BUILTIN_MANIFEST.to_string()]);
        assert_eq!(config.node, NodeConfig::default());
        assert_eq!(config.peer, PeerConfig::default());
        assert_eq!(config.announce.max_delay, Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_empty_locations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            "[component]\ninstall_root = \"/opt/dhtfox\"\nlocations = []\n",
        )
        .unwrap();

        let err = BridgeConfig::load(&config_path).unwrap_err();
        assert!(err.to_string().contains("locations"));
    }

    #[test]
    fn test_load_rejects_bad_duration() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            "[component]\ninstall_root = \"/opt\"\n[announce]\nbase_delay = \"soon\"\n",
        )
        .unwrap();

        assert!(BridgeConfig::load(&config_path).is_err());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "keep me").unwrap();
        let arg = Some(config_path.to_string_lossy().to_string());

        assert!(init(arg.clone(), false).is_err());
        assert_eq!(fs::read_to_string(&config_path).unwrap(), "keep me");

        init(arg, true).unwrap();
        assert!(BridgeConfig::load(&config_path).is_ok());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("dhtfox/config.toml"));
    }

    #[test]
    fn test_install_root_for_bare_file_name() {
        assert_eq!(install_root_for(Path::new("config.toml")), PathBuf::from("."));
        assert_eq!(
            install_root_for(Path::new("/etc/dhtfox/config.toml")),
            PathBuf::from("/etc/dhtfox")
        );
    }
}
