//! Worker and subprocess supervision.
//!
//! The supervisor owns the frozen config, the shutdown signal, and the
//! lifecycle of every worker thread plus one kernel-side tool subprocess
//! per distinct tool in the config. Workers run under a restart wrapper:
//! an unexpected exit (error or panic) is logged and the worker is rebuilt
//! after a cooldown, until shutdown is signaled. Tools run in their own
//! process group with a parent-death signal, are polled every second, and
//! get SIGINT plus a five-second grace period on shutdown.

use crate::anomaly::{AnomalyAction, AnomalyKind};
use crate::collector::{Collector, CollectorMetrics};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherTuning};
use crate::reclaimer::Reclaimer;
use crate::shutdown::ShutdownSignal;
use crate::watcher::Watcher;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use shmring::{EventBatch, RingGeometry, ShmRing, SHM_NAME};
use std::io;
use std::os::unix::process::CommandExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Capacity of the dispatcher -> watcher events channel.
const EVENTS_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the watcher -> collector anomalies channel.
const ANOMALY_CHANNEL_CAPACITY: usize = 16;

/// Pause before restarting a dead worker or tool.
const RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Tool exit-status poll cadence.
const TOOL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a tool gets between SIGINT and being abandoned.
const TOOL_STOP_GRACE: Duration = Duration::from_secs(5);

/// Per-worker join deadline at shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures that take down a worker's current run. The restart wrapper
/// logs them and respawns the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("shared memory ring: {0}")]
    Ring(#[from] shmring::RingError),

    /// The downstream channel receiver is gone; nothing left to publish to.
    #[error("downstream channel closed")]
    ChannelClosed,

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Spawns, restarts, and tears down the whole daemon.
pub struct Supervisor {
    config: Arc<Config>,
    shutdown: ShutdownSignal,
    workers: Vec<(String, JoinHandle<()>)>,
    metrics: Arc<CollectorMetrics>,
    restart_cooldown: Duration,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: ShutdownSignal::new(),
            workers: Vec::new(),
            metrics: Arc::new(CollectorMetrics::default()),
            restart_cooldown: RESTART_COOLDOWN,
        }
    }

    /// The signal handlers flip this to begin a graceful drain.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> &Arc<CollectorMetrics> {
        &self.metrics
    }

    /// Spawns the tool subprocess supervisors and the four pipeline
    /// workers.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        std::fs::create_dir_all(self.config.batches_dir())?;

        // One supervisor thread per distinct kernel-side tool.
        let tools: Vec<String> = self.config.tool_names().iter().map(ToString::to_string).collect();
        for name in tools {
            let argv = tool_command(&self.config, &name);
            let shutdown = self.shutdown.clone();
            let thread_name = format!("{name}-supervisor");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || supervise_tool(&name, &argv, &shutdown))?;
            self.workers.push((thread_name, handle));
        }

        let (events_tx, events_rx) = crossbeam_channel::bounded::<Option<EventBatch>>(EVENTS_CHANNEL_CAPACITY);
        let (action_tx, action_rx) =
            mpsc::channel::<Option<AnomalyAction>>(ANOMALY_CHANNEL_CAPACITY);
        let collector_rx = Arc::new(Mutex::new(action_rx));

        let shm_path = PathBuf::from("/dev/shm").join(SHM_NAME);
        let shutdown = self.shutdown.clone();
        self.spawn_supervised("dispatcher", move || {
            let ring = ShmRing::open(&shm_path, RingGeometry::default())?;
            Dispatcher::new(ring, events_tx.clone(), shutdown.clone(), DispatcherTuning::default())
                .run()
        })?;

        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown.clone();
        self.spawn_supervised("watcher", move || {
            Watcher::new(&config, events_rx.clone(), action_tx.clone(), shutdown.clone()).run()
        })?;

        let collector = Collector::new(&self.config, collector_rx, Arc::clone(&self.metrics));
        self.spawn_supervised("collector", move || collector.run())?;

        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown.clone();
        self.spawn_supervised("reclaimer", move || {
            Reclaimer::new(&config, shutdown.clone()).run()
        })?;

        Ok(())
    }

    /// Runs `factory` under the restart wrapper on a named thread.
    fn spawn_supervised<F>(&mut self, name: &'static str, factory: F) -> io::Result<()>
    where
        F: Fn() -> Result<(), WorkerError> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let cooldown = self.restart_cooldown;
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            while !shutdown.is_shutdown() {
                match catch_unwind(AssertUnwindSafe(&factory)) {
                    Ok(Ok(())) => {
                        if shutdown.is_shutdown() {
                            break;
                        }
                        warn!(worker = name, "worker exited early, restarting");
                    }
                    Ok(Err(e)) => error!(worker = name, error = %e, "worker failed"),
                    Err(_) => error!(worker = name, "worker panicked"),
                }
                if shutdown.is_shutdown() {
                    break;
                }
                thread::sleep(cooldown);
            }
        })?;
        info!(worker = name, "worker supervised");
        self.workers.push((name.to_string(), handle));
        Ok(())
    }

    /// Signals shutdown and joins every worker with a bounded wait.
    ///
    /// The drain itself travels through the pipeline: the dispatcher
    /// observes the flag, drains, emits the sentinel and unlinks the ring;
    /// the watcher forwards the sentinel; the collector finishes in-flight
    /// bundles; the reclaimer exits on its next wake.
    pub fn shutdown_and_join(self) {
        self.shutdown.shutdown();
        info!("shutdown signaled, joining workers");

        for (name, handle) in self.workers {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!(worker = %name, "worker stopped");
            } else {
                warn!(worker = %name, "worker did not stop within the join timeout, abandoning");
            }
        }
    }
}

/// Builds the argv for a kernel-side tool.
///
/// The latency tool is armed with the smallest tracked threshold and the
/// comma-separated tracked command ids; other tools are started bare.
pub fn tool_command(config: &Config, tool: &str) -> Vec<String> {
    let mut argv = vec![config.tools_dir.join(tool).to_string_lossy().into_owned()];
    if let Some(anomaly) = config
        .guardian
        .anomalies
        .values()
        .find(|a| a.tool == tool && a.kind == AnomalyKind::Latency)
    {
        let cmds: Vec<String> = anomaly.track.keys().map(ToString::to_string).collect();
        argv.push("-m".to_string());
        argv.push(anomaly.min_threshold_ms().to_string());
        argv.push("-c".to_string());
        argv.push(cmds.join(","));
    }
    argv
}

/// Keeps one tool subprocess alive until shutdown.
fn supervise_tool(name: &str, argv: &[String], shutdown: &ShutdownSignal) {
    while !shutdown.is_shutdown() {
        let mut child = match spawn_tool(argv) {
            Ok(child) => child,
            Err(e) => {
                error!(tool = name, error = %e, "failed to start tool");
                thread::sleep(RESTART_COOLDOWN);
                continue;
            }
        };
        info!(tool = name, pid = child.id(), "tool started");

        loop {
            thread::sleep(TOOL_POLL_INTERVAL);
            if shutdown.is_shutdown() {
                break;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(tool = name, %status, "tool exited unexpectedly, restarting");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tool = name, error = %e, "tool status poll failed");
                    break;
                }
            }
        }

        if shutdown.is_shutdown() {
            stop_tool(name, &mut child);
            break;
        }
        thread::sleep(RESTART_COOLDOWN);
    }
}

/// Spawns a tool in its own process group, with the kernel delivering
/// SIGKILL to it if this daemon dies first.
fn spawn_tool(argv: &[String]) -> io::Result<Child> {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).process_group(0);
    // SAFETY: the pre-exec closure runs post-fork and only makes a single
    // async-signal-safe prctl call.
    unsafe {
        command.pre_exec(|| {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            Ok(())
        });
    }
    command.spawn()
}

/// SIGINTs the tool's process group and waits out the grace period.
fn stop_tool(name: &str, child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGINT) {
        warn!(tool = name, error = %e, "failed to signal tool process group");
    }

    let deadline = Instant::now() + TOOL_STOP_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(tool = name, %status, "tool stopped");
                return;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!(tool = name, "tool did not stop within the grace period, giving up");
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!(tool = name, error = %e, "wait on stopping tool failed");
                return;
            }
        }
    }
}
