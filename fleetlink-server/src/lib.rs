//! # Fleetlink Server
//!
//! Fleet telematics ingestion gateway, alert engine and real-time bus.
//!
//! This crate provides a complete ingestion server that:
//! - Accepts device connections over eight wire protocols (`fleetlink-core`)
//! - Normalizes every fix into a single `NormalizedPosition` shape
//! - Runs a pluggable alert engine against each fix and on a periodic sweep
//! - Fans out positions and alerts over a per-device real-time bus
//! - Drains a downlink command queue on every bound connection
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       fleetlink-server                        │
//! │  ┌────────────┐   ┌─────────────┐   ┌────────────────────┐    │
//! │  │ gateway    │-->│ processor   │-->│ alert engine (E)   │    │
//! │  │ (TCP/UDP)  │   │ (trips,     │   │ dispatch + sweep   │    │
//! │  │            │   │  odometer)  │   └─────────┬──────────┘    │
//! │  └─────┬──────┘   └──────┬──────┘             │               │
//! │        │                 │                    ▼               │
//! │        │                 ▼            ┌────────────────┐      │
//! │        │          ┌─────────────┐     │ notify          │     │
//! │        │          │ bus (F)     │<----│ dispatcher (G)  │     │
//! │        │          └─────────────┘     └────────────────┘      │
//! │        ▼                                                      │
//! │  ┌─────────────┐                                              │
//! │  │ command     │ (drains on IMEI bind / each position)        │
//! │  │ queue       │                                              │
//! │  └─────────────┘                                              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use fleetlink_server::{Cli, Session};
//! use tokio_graceful_shutdown::Toplevel;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse();
//!
//!     Toplevel::new(|s| async move {
//!         let _session = Session::new(&s, args).await;
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```

pub mod alert;
pub mod bus;
pub mod command_queue;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod processor;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

pub use config::Cli;
use bus::Bus;
use error::ServerError;
use gateway::ConnectionRegistry;
use notify::NotificationDispatcher;
use processor::Processor;
use storage::PgStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared by the gateway, the sweep loop, and (should one
/// be added) any interactive API — the teacher's `SessionInner` pattern: one
/// struct, constructed once in `Session::new`, handed out as cheap clones.
pub struct SessionInner {
    pub args: Cli,
    pub store: PgStore,
    pub processor: Arc<Processor>,
    pub notifier: Arc<NotificationDispatcher>,
    pub registry: ConnectionRegistry,
}

#[derive(Clone)]
pub struct Session {
    pub inner: Arc<SessionInner>,
}

impl Session {
    /// Connects to storage, wires the processor/bus/notifier together, and
    /// starts the gateway listeners plus the periodic sweep as sibling
    /// subsystems under `subsystem` — mirroring how the teacher's
    /// `Session::new` starts its `NavData` and `Locator` subsystems.
    pub async fn new(subsystem: &SubsystemHandle, args: Cli) -> Result<Self, ServerError> {
        let store = PgStore::connect(&args.database_url).await?;
        let bus = Bus::new();
        let notifier = Arc::new(NotificationDispatcher::builtin());
        let processor = Arc::new(Processor::new(store.clone(), bus, notifier.clone()));
        let registry = ConnectionRegistry::new();

        let decoders: Vec<_> = fleetlink_core::protocol::builtin_decoders()
            .into_iter()
            .filter(|d| args.protocol_enabled(d.name()))
            .collect();

        gateway::run_gateways(
            subsystem,
            &args.bind_host,
            args.read_timeout(),
            decoders,
            processor.clone(),
            registry.clone(),
        )
        .await;

        let sweep_processor = processor.clone();
        let sweep_interval = args.sweep_interval();
        subsystem.start(SubsystemBuilder::new("AlertSweep", move |subsys| {
            run_sweep_loop(subsys, sweep_processor, sweep_interval)
        }));

        Ok(Session {
            inner: Arc::new(SessionInner {
                args,
                store,
                processor,
                notifier,
                registry,
            }),
        })
    }

    pub fn processor(&self) -> Arc<Processor> {
        self.inner.processor.clone()
    }

    pub fn store(&self) -> &PgStore {
        &self.inner.store
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.inner.notifier
    }
}

/// Runs the time-triggered sweep (offline detection, schedule-gated modules
/// with no fresh position) on a fixed interval until shutdown is requested.
/// Per-device failures are logged, never aborting the loop.
async fn run_sweep_loop(
    subsys: SubsystemHandle,
    processor: Arc<Processor>,
    interval: Duration,
) -> Result<(), ServerError> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = processor.sweep().await {
                    log::warn!("sweep iteration failed: {err}");
                }
            }
            _ = subsys.on_shutdown_requested() => {
                log::info!("alert sweep shutting down");
                return Ok(());
            }
        }
    }
}
