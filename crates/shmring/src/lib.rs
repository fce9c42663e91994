//! Shared-memory event ring shared with kernel-side diagnostic tools.
//!
//! A kernel-side producer commits fixed-size event records into a
//! single-producer single-consumer byte ring backed by a file under
//! `/dev/shm`; this crate is the consumer half. The layout is fixed by the
//! producer (16-byte head/tail header, modulo-N byte arithmetic, 56-byte
//! records) and validated rather than trusted.
//!
//! # Example
//!
//! ```no_run
//! use shmring::{decode_events, RingGeometry, ShmRing};
//!
//! let mut ring = ShmRing::open("/dev/shm/bpf_shm", RingGeometry::default())?;
//! let mut buf = Vec::new();
//! if ring.drain_into(&mut buf)? > 0 {
//!     let (events, _partial) = decode_events(&buf);
//!     for event in &events {
//!         // Copy fields out of the packed record before formatting.
//!         let (cmd, latency) = (event.smbcommand, event.latency_ns());
//!         println!("cmd={cmd} latency={latency}ns");
//!     }
//! }
//! # Ok::<(), shmring::RingError>(())
//! ```

mod event;
mod invariants;
mod ring;

pub use event::{decode_events, encode_event, Event, EventBatch, EVENT_SIZE, TASK_COMM_LEN};
pub use ring::{
    RingError, RingGeometry, ShmRing, DEFAULT_SHM_SIZE, HEADER_LEN, MAX_ENTRIES, PAGE_SIZE,
    SHM_NAME,
};
