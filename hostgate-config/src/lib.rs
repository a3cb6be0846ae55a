use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// hostgate configuration loaded from YAML.
///
/// Every section has a working default, so an empty document is a valid
/// configuration: an HTTP front door on port 80, a TLS front door on port
/// 443 in passthrough mode, an empty allowlist (all traffic denied), and no
/// metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listening sockets for the front doors
    #[serde(default)]
    pub listeners: Listeners,
    /// Timeout configuration (all values in seconds)
    #[serde(default)]
    pub timeouts: Timeouts,
    /// TLS termination back end; when present, TLS connections are forwarded
    /// there instead of being tunneled to the origin
    #[serde(default)]
    pub termination: Option<Termination>,
    /// Host and SNI allowlists consulted by the admission filter
    #[serde(default)]
    pub allowlist: Allowlist,
    /// Prometheus metrics endpoint configuration
    #[serde(default)]
    pub metrics: Metrics,
    /// Optional file watched for reload/invalidation triggers
    #[serde(default)]
    pub watch: Option<PathBuf>,
}

/// Listening addresses for the proxy front doors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listeners {
    /// HTTP front door (e.g. "0.0.0.0:80")
    #[serde(default = "default_http_listener")]
    pub http: String,
    /// TLS front door (e.g. "0.0.0.0:443")
    #[serde(default = "default_https_listener")]
    pub https: String,
    /// Optional second HTTP front door, identical behavior; used for traffic
    /// already decrypted by an external terminator
    #[serde(default)]
    pub extra_http: Option<String>,
}

fn default_http_listener() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_listener() -> String {
    "0.0.0.0:443".to_string()
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            http: default_http_listener(),
            https: default_https_listener(),
            extra_http: None,
        }
    }
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish an upstream connection (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time to receive the TLS ClientHello (default: 10s)
    #[serde(default = "default_client_hello_timeout")]
    pub client_hello: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_client_hello_timeout() -> u64 {
    10
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            client_hello: default_client_hello_timeout(),
        }
    }
}

/// TLS termination back end address.
///
/// The proxy stays TLS-unaware either way; in termination mode it forwards
/// the ciphertext to this local process, which owns the private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Termination {
    /// Loopback address of the terminating back end (e.g. "127.0.0.1:8443")
    pub address: String,
}

/// Hostname allowlists. Matching is exact on lowercased names; there is no
/// wildcarding. Empty lists deny everything.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Allowlist {
    /// Hosts allowed through the HTTP front door (Host header, port ignored)
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Server names allowed through the TLS front door
    #[serde(default)]
    pub snis: Vec<String>,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to expose the metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (e.g. "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use hostgate_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostgate_config::Config;
    ///
    /// let yaml = r#"
    /// listeners:
    ///   http: "0.0.0.0:8080"
    /// allowlist:
    ///   hosts: ["example.com"]
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listeners.http, "0.0.0.0:8080");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }
}
