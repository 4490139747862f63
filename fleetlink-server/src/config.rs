//! CLI/environment configuration, following the `mayara-server::Cli` shape.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "fleetlink-server", version)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Address every protocol listener binds to.
    #[arg(long, env = "FLEETLINK_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Comma-separated list of protocol names to enable. Empty means all.
    #[arg(long, env = "FLEETLINK_PROTOCOLS", value_delimiter = ',')]
    pub protocols: Vec<String>,

    /// How often the alert engine re-evaluates time-triggered modules
    /// (offline detection, schedule-gated alerts with no fresh position).
    #[arg(long, env = "FLEETLINK_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Idle read timeout per gateway connection.
    #[arg(long, env = "FLEETLINK_READ_TIMEOUT_SECS", default_value_t = 300)]
    pub read_timeout_secs: u64,

    /// Enables the notification dispatcher. Off by default in tests/dev.
    #[arg(long, env = "FLEETLINK_ENABLE_NOTIFICATIONS", default_value_t = true)]
    pub enable_notifications: bool,

    /// Enables the downlink command queue drain.
    #[arg(long, env = "FLEETLINK_ENABLE_COMMAND_QUEUE", default_value_t = true)]
    pub enable_command_queue: bool,

    /// VAPID public key, passed through opaquely to the (out-of-scope) push layer.
    #[arg(long, env = "FLEETLINK_VAPID_PUBLIC_KEY")]
    pub vapid_public_key: Option<String>,

    /// VAPID private key, passed through opaquely to the (out-of-scope) push layer.
    #[arg(long, env = "FLEETLINK_VAPID_PRIVATE_KEY")]
    pub vapid_private_key: Option<String>,
}

impl Cli {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn protocol_enabled(&self, name: &str) -> bool {
        self.protocols.is_empty() || self.protocols.iter().any(|p| p == name)
    }
}
