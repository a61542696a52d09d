use std::{fmt, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
#[command(name = "chat_server", about = "Realtime chat fan-out server")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a signed development token for a user and exit.
    MintToken {
        user_id: String,
        /// Display name carried in the token.
        #[arg(long)]
        name: Option<String>,
        /// Validity in hours.
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

/// Shared signing secret. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A random 48 character secret.
    pub fn generate() -> Self {
        let value = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect::<String>();
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the chat database.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: Secret,
    /// Set when no secret was configured and one was generated.
    pub jwt_secret_generated: bool,
    /// Typing marks older than this are expired.
    pub typing_ttl: Duration,
    /// Keepalive ping period for realtime connections.
    pub ping_interval: Duration,
    /// Only participants may join or post to a chat.
    pub enforce_membership: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    realtime: FileRealtime,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
}

#[derive(Deserialize)]
struct FileRealtime {
    #[serde(default = "default_typing_ttl_secs")]
    typing_ttl_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    ping_interval_secs: u64,
    #[serde(default)]
    enforce_membership: bool,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_typing_ttl_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileRealtime {
    fn default() -> Self {
        Self {
            typing_ttl_secs: default_typing_ttl_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            enforce_membership: false,
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_SERVER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_server.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut jwt_secret = file_cfg.auth.jwt_secret.filter(|s| !s.is_empty());

        // environment overrides
        if let Ok(p) = std::env::var("CHAT_SERVER_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("CHAT_SERVER_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("CHAT_SERVER_JWT_SECRET") {
            if !s.is_empty() {
                jwt_secret = Some(s);
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let realtime = file_cfg.realtime;
        if realtime.ping_interval_secs == 0 {
            anyhow::bail!("invalid_ping_interval");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let (jwt_secret, jwt_secret_generated) = match jwt_secret {
            Some(s) => (Secret::new(s), false),
            None => (Secret::generate(), true),
        };

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            jwt_secret,
            jwt_secret_generated,
            typing_ttl: Duration::from_secs(realtime.typing_ttl_secs),
            ping_interval: Duration::from_secs(realtime.ping_interval_secs),
            enforce_membership: realtime.enforce_membership,
        })
    }

    /// Location of the SQLite database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/chat_server");
        p
    } else {
        PathBuf::from("./chat_server_data")
    }
}
