//! Fixed-layout event records produced by the kernel-side tools.
//!
//! The producer commits raw structs into the shared-memory data region; the
//! consumer reinterprets the drained bytes with no per-field parsing. Both
//! sides run on the same host, so native (little-endian, 64-bit) layout is
//! the wire format.

use std::fmt;

/// Length of the nul-padded task name carried in every record.
pub const TASK_COMM_LEN: usize = 16;

/// Size of one committed record in the ring, in bytes.
pub const EVENT_SIZE: usize = std::mem::size_of::<Event>();

// The producer writes exactly 56 bytes per record. If the struct below ever
// drifts from that, refuse to build rather than misparse the stream.
const _: () = assert!(EVENT_SIZE == 56, "Event must match the producer's 56-byte record");

/// One record from a kernel-side tool.
///
/// `metric` is a union on the producer side: the latency tool stores
/// `latency_ns`, the error tool stores `retval` in the low 32 bits. The
/// `tool` field tells the consumer which interpretation applies.
///
/// The struct is `repr(C, packed)` because the producer commits the fields
/// back to back with no padding. Field reads therefore go through copies
/// (the accessors below); never take references into a record.
#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Producer thread id.
    pub pid: i32,
    /// Monotonic completion time of the command, in nanoseconds.
    pub cmd_end_time_ns: u64,
    /// SMB session the command belonged to.
    pub session_id: u64,
    /// Message id within the session.
    pub mid: u64,
    /// Protocol command id (see the command table in the daemon crate).
    pub smbcommand: u16,
    /// Metric union: `latency_ns` or `retval`, selected by `tool`.
    pub metric: u64,
    /// Identifies which kernel-side tool emitted this record.
    pub tool: u8,
    /// Non-zero when the command was part of a compound request.
    pub is_compounded: u8,
    /// Task name, nul-padded.
    pub task: [u8; TASK_COMM_LEN],
}

impl Event {
    /// Latency interpretation of the metric union.
    #[inline]
    pub fn latency_ns(&self) -> u64 {
        self.metric
    }

    /// Error-code interpretation of the metric union (low 32 bits).
    #[inline]
    pub fn retval(&self) -> i32 {
        (self.metric & 0xffff_ffff) as u32 as i32
    }

    /// Task name with trailing nul padding stripped.
    pub fn task_name(&self) -> String {
        let task = self.task;
        let end = task.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
        String::from_utf8_lossy(&task[..end]).into_owned()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Copy out of the packed struct before formatting.
        let (pid, cmd, metric, tool) = (self.pid, self.smbcommand, self.metric, self.tool);
        f.debug_struct("Event")
            .field("pid", &pid)
            .field("smbcommand", &cmd)
            .field("metric", &metric)
            .field("tool", &tool)
            .field("task", &self.task_name())
            .finish_non_exhaustive()
    }
}

/// An ordered run of events published as one unit between pipeline stages.
///
/// Batches have no identity, only content; empty batches never circulate.
pub type EventBatch = Vec<Event>;

/// Reinterprets drained ring bytes as consecutive records.
///
/// Returns the decoded batch and the number of trailing bytes that did not
/// form a whole record. A non-zero remainder means the producer committed a
/// partial record (or the window was corrupt); the caller decides whether to
/// warn, but the bytes are already consumed either way.
pub fn decode_events(raw: &[u8]) -> (EventBatch, usize) {
    let mut events = Vec::with_capacity(raw.len() / EVENT_SIZE);
    let mut chunks = raw.chunks_exact(EVENT_SIZE);
    for chunk in &mut chunks {
        // SAFETY: chunk is exactly EVENT_SIZE bytes, Event is repr(C, packed)
        // with no invalid bit patterns, and read_unaligned tolerates the
        // arbitrary alignment of a byte slice.
        let event = unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<Event>()) };
        events.push(event);
    }
    (events, chunks.remainder().len())
}

/// Serializes one record into producer wire form.
///
/// This is the producer half of [`decode_events`], used by test producers
/// that feed the ring the way the kernel-side tools do.
pub fn encode_event(event: &Event) -> [u8; EVENT_SIZE] {
    let mut buf = [0u8; EVENT_SIZE];
    // SAFETY: buf is exactly EVENT_SIZE bytes and Event is repr(C, packed),
    // so the write covers the whole buffer with the record's bit pattern.
    unsafe { std::ptr::write_unaligned(buf.as_mut_ptr().cast::<Event>(), *event) };
    buf
}
