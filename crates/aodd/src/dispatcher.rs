//! Ring consumer: drains the shared-memory ring and publishes event batches.
//!
//! The dispatcher is the single consumer of the ring and the single producer
//! of the events channel, so ordering is preserved end to end. It never
//! blocks the kernel-side writer: draining is a copy-out followed by one
//! Release store to `tail`.

use crate::shutdown::ShutdownSignal;
use crate::supervisor::WorkerError;
use crossbeam_channel::Sender;
use shmring::{decode_events, EventBatch, RingError, ShmRing, EVENT_SIZE};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Polling knobs. Production uses the defaults; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct DispatcherTuning {
    /// Tick cadence of the poll loop.
    pub poll_interval: Duration,
    /// Settle sleep before a drain, tolerating the writer's non-atomic
    /// record store between its data write and head publish.
    pub settle_wait: Duration,
    /// Drain eagerly once this many whole events are pending.
    pub batch_min_events: usize,
    /// Drain anyway after this many ticks, bounding batching latency for
    /// low-rate streams.
    pub fallback_ticks: u32,
}

impl Default for DispatcherTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            settle_wait: Duration::from_millis(5),
            batch_min_events: 10,
            fallback_ticks: 3,
        }
    }
}

impl DispatcherTuning {
    /// Sets the tick cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the settle sleep taken before each drain.
    pub fn with_settle_wait(mut self, wait: Duration) -> Self {
        self.settle_wait = wait;
        self
    }
}

/// Drains the ring into the events channel until shutdown.
pub struct Dispatcher {
    ring: ShmRing,
    tx: Sender<Option<EventBatch>>,
    shutdown: ShutdownSignal,
    tuning: DispatcherTuning,
}

impl Dispatcher {
    pub fn new(
        ring: ShmRing,
        tx: Sender<Option<EventBatch>>,
        shutdown: ShutdownSignal,
        tuning: DispatcherTuning,
    ) -> Self {
        Self { ring, tx, shutdown, tuning }
    }

    /// Runs the poll loop; returns after a final drain, sentinel, and ring
    /// unlink once shutdown is signaled.
    pub fn run(self) -> Result<(), WorkerError> {
        let Self { mut ring, tx, shutdown, tuning } = self;
        info!(path = ?ring.path(), "dispatcher started");

        let mut buf = Vec::new();
        let mut timer = tuning.fallback_ticks;
        while !shutdown.is_shutdown() {
            match ring.occupied_bytes() {
                Ok(occupied) => {
                    let available = occupied as usize / EVENT_SIZE;
                    if available >= tuning.batch_min_events || timer == 0 {
                        if available == 0 {
                            timer = tuning.fallback_ticks;
                        } else {
                            thread::sleep(tuning.settle_wait);
                            drain_and_publish(&mut ring, &mut buf, &tx)?;
                            timer = tuning.fallback_ticks;
                        }
                    } else {
                        timer -= 1;
                    }
                }
                Err(RingError::CorruptIndices { head, tail, data_len }) => {
                    warn!(head, tail, data_len, "producer corrupted ring indices, dropping window");
                    ring.recover();
                }
                Err(e) => return Err(e.into()),
            }
            thread::sleep(tuning.poll_interval);
        }

        // Final drain so nothing committed before the signal is lost.
        drain_and_publish(&mut ring, &mut buf, &tx)?;
        let _ = tx.send(None);

        if ring.occupied_bytes().map_or(true, |pending| pending > 0) {
            warn!("ring not empty at shutdown, potential data loss");
        }
        ring.close_and_unlink()?;
        info!("dispatcher stopped, shared memory unlinked");
        Ok(())
    }
}

/// Drains once and publishes the decoded batch, if any.
fn drain_and_publish(
    ring: &mut ShmRing,
    buf: &mut Vec<u8>,
    tx: &Sender<Option<EventBatch>>,
) -> Result<(), WorkerError> {
    match ring.drain_into(buf) {
        Ok(0) => Ok(()),
        Ok(drained) => {
            let (events, partial) = decode_events(buf);
            if partial != 0 {
                warn!(partial, "drained window not record-aligned, dropping trailing bytes");
            }
            debug!(events = events.len(), bytes = drained, "batch drained");
            if events.is_empty() {
                return Ok(());
            }
            tx.send(Some(events)).map_err(|_| WorkerError::ChannelClosed)
        }
        Err(RingError::CorruptIndices { head, tail, data_len }) => {
            warn!(head, tail, data_len, "producer corrupted ring indices, dropping window");
            ring.recover();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use shmring::{encode_event, Event, RingGeometry, HEADER_LEN};
    use std::time::Instant;

    fn fast_tuning() -> DispatcherTuning {
        DispatcherTuning::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_settle_wait(Duration::from_millis(1))
    }

    fn event(seq: u64) -> Event {
        Event {
            pid: 1,
            cmd_end_time_ns: seq,
            session_id: 1,
            mid: seq,
            smbcommand: 8,
            metric: seq,
            tool: 0,
            is_compounded: 0,
            task: [0; 16],
        }
    }

    /// Opens the producer handle, commits `preload` events, then starts the
    /// dispatcher on its own handle. Preloading keeps batch boundaries
    /// deterministic.
    fn spawn_dispatcher(
        dir: &tempfile::TempDir,
        tuning: DispatcherTuning,
        preload: std::ops::Range<u64>,
    ) -> (
        ShmRing,
        crossbeam_channel::Receiver<Option<EventBatch>>,
        ShutdownSignal,
        thread::JoinHandle<Result<(), WorkerError>>,
    ) {
        let path = dir.path().join("bpf_shm");
        let geometry = RingGeometry::new(HEADER_LEN + 64 * EVENT_SIZE);
        let producer = ShmRing::open(&path, geometry).unwrap();
        for seq in preload {
            producer.push_bytes(&encode_event(&event(seq))).unwrap();
        }
        let consumer = ShmRing::open(&path, geometry).unwrap();

        let (tx, rx) = bounded(16);
        let shutdown = ShutdownSignal::new();
        let dispatcher = Dispatcher::new(consumer, tx, shutdown.clone(), tuning);
        let handle = thread::spawn(move || dispatcher.run());
        (producer, rx, shutdown, handle)
    }

    #[test]
    fn publishes_batch_once_enough_events_pend() {
        let dir = tempfile::tempdir().unwrap();
        let (_producer, rx, shutdown, handle) = spawn_dispatcher(&dir, fast_tuning(), 0..12);

        let batch = rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("expected a batch, not the sentinel");
        assert_eq!(batch.len(), 12);
        let mids: Vec<u64> = batch.iter().map(|e| e.mid).collect();
        assert_eq!(mids, (0..12).collect::<Vec<_>>());

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn fallback_tick_publishes_small_batches() {
        // 2 pending events are below the eager threshold but must still be
        // published within fallback_ticks polls.
        let dir = tempfile::tempdir().unwrap();
        let (_producer, rx, shutdown, handle) = spawn_dispatcher(&dir, fast_tuning(), 0..2);

        let started = Instant::now();
        let batch = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn empty_ring_publishes_nothing_and_shuts_down_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (_producer, rx, shutdown, handle) = spawn_dispatcher(&dir, fast_tuning(), 0..0);

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
        // Only the sentinel was ever published.
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), None);
        assert!(!dir.path().join("bpf_shm").exists());
    }

    #[test]
    fn final_drain_precedes_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        // Slow cadence: events committed right before shutdown are only
        // picked up by the final drain.
        let tuning = fast_tuning().with_poll_interval(Duration::from_millis(50));
        let (producer, rx, shutdown, handle) = spawn_dispatcher(&dir, tuning, 0..0);

        for seq in 0..3 {
            producer.push_bytes(&encode_event(&event(seq))).unwrap();
        }
        shutdown.shutdown();
        handle.join().unwrap().unwrap();

        let first = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.map(|b| b.len()), Some(3));
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), None);
    }
}
