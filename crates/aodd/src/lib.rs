//! Always-On Diagnostics daemon for SMB client hosts.
//!
//! A privileged, long-lived daemon that drains kernel-produced SMB events
//! from a shared-memory ring, detects configured anomalies (latency
//! outliers, error-code bursts) over short windows, and captures bounded
//! log-collection bundles onto local disk in response.
//!
//! The data plane is a fixed pipeline with in-band `None` sentinels for
//! termination:
//!
//! ```text
//! shm ring -> Dispatcher -> events -> Watcher -> anomalies -> Collector -> bundles
//!                                                                ^
//!                                                       Reclaimer| (GC)
//! ```
//!
//! The [`supervisor::Supervisor`] owns the config and every worker, restarts
//! crashed workers after a cooldown, and supervises the kernel-side tool
//! subprocesses that feed the ring.

pub mod actions;
pub mod anomaly;
pub mod audit;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod reclaimer;
pub mod shutdown;
pub mod supervisor;
pub mod watcher;

pub use anomaly::{AnomalyAction, AnomalyKind};
pub use collector::{Collector, CollectorMetrics, MAX_CONCURRENT_ACTIONS};
pub use config::{Config, ConfigError};
pub use dispatcher::{Dispatcher, DispatcherTuning};
pub use reclaimer::Reclaimer;
pub use shutdown::ShutdownSignal;
pub use supervisor::{Supervisor, WorkerError};
pub use watcher::Watcher;
