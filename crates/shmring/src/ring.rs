use crate::invariants::{debug_assert_index_in_range, debug_assert_tail_advanced};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// RING PROTOCOL
// =============================================================================
//
// The backing file holds a 16-byte header followed by the data region:
//
//   head: u64 LE  (byte offset into the data region, written by the producer)
//   tail: u64 LE  (byte offset into the data region, written by the consumer)
//   data: [u8; size - 16]
//
// head == tail means empty; all index arithmetic is modulo the data length.
// The producer advances head after committing records; the consumer advances
// tail after copying. Exactly one writer per word, so 8-byte atomic
// loads/stores with Acquire/Release pairing are the whole protocol:
//
// - consumer: load head Acquire (synchronizes with the producer's commit),
//   store tail Release (publishes consumption back to the producer)
// - producer: load tail Acquire, store head Release
//
// The producer is a foreign process (a kernel-side tool); its index values
// are validated at runtime, never trusted.
//
// =============================================================================

/// Shared-memory object name; the backing file lives at `/dev/shm/<SHM_NAME>`.
pub const SHM_NAME: &str = "bpf_shm";

/// Maximum ring entries the producer sizes for.
pub const MAX_ENTRIES: usize = 2048;

/// Producer page size used to compute the region size.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of head/tail header preceding the data region.
pub const HEADER_LEN: usize = 16;

/// Default region size shared with the kernel-side tools.
pub const DEFAULT_SHM_SIZE: usize = (MAX_ENTRIES + 1) * PAGE_SIZE;

/// Geometry of a ring region.
///
/// Production rings always use [`RingGeometry::default`]; tests shrink the
/// region so wrap-around schedules are cheap to exercise.
#[derive(Debug, Clone, Copy)]
pub struct RingGeometry {
    size: usize,
}

impl RingGeometry {
    /// Creates a geometry for a region of `size` bytes (header included).
    ///
    /// # Panics
    ///
    /// Panics if `size` does not leave room for the header and at least one
    /// byte of data.
    pub const fn new(size: usize) -> Self {
        assert!(size > HEADER_LEN, "ring region must be larger than its header");
        Self { size }
    }

    /// Total region size in bytes, header included.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Size of the data region in bytes.
    #[inline]
    pub const fn data_len(&self) -> usize {
        self.size - HEADER_LEN
    }
}

impl Default for RingGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_SIZE)
    }
}

/// Errors from opening, draining, or tearing down a ring.
#[derive(Debug, Error)]
pub enum RingError {
    /// The backing file could not be opened or created.
    #[error("opening ring file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },

    /// The backing file could not be sized on creation.
    #[error("sizing ring file to {size} bytes: {source}")]
    Truncate {
        size: usize,
        source: io::Error,
    },

    /// mmap of the backing file failed.
    #[error("mapping ring file: {0}")]
    Map(io::Error),

    /// The producer published indices outside the data region.
    #[error("producer indices out of range: head={head} tail={tail} (data region {data_len} bytes)")]
    CorruptIndices {
        head: u64,
        tail: u64,
        data_len: u64,
    },

    /// The backing file could not be unlinked on clean shutdown.
    #[error("unlinking ring file {path:?}: {source}")]
    Unlink {
        path: PathBuf,
        source: io::Error,
    },
}

/// Consumer handle to the shared-memory ring.
///
/// Whichever of producer/consumer starts first creates and sizes the backing
/// file; the other opens it. The consumer side owns `tail` and is the only
/// party allowed to unlink the file (on clean shutdown).
pub struct ShmRing {
    base: NonNull<u8>,
    geometry: RingGeometry,
    path: PathBuf,
    // Keeps the fd alive for the lifetime of the mapping.
    _file: File,
}

// SAFETY: the mapping is plain shared memory; moving the handle between
// threads is fine. Not Sync: one consumer at a time.
unsafe impl Send for ShmRing {}

impl ShmRing {
    /// Opens the ring at `path`, creating and sizing it if absent.
    pub fn open(path: impl AsRef<Path>, geometry: RingGeometry) -> Result<Self, RingError> {
        let path = path.as_ref().to_path_buf();

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(0o666)
                    .open(&path)
                    .map_err(|source| RingError::Open { path: path.clone(), source })?;
                file.set_len(geometry.size() as u64)
                    .map_err(|source| RingError::Truncate { size: geometry.size(), source })?;
                file
            }
            Err(source) => return Err(RingError::Open { path, source }),
        };

        // SAFETY: fd is valid for the duration of the call; length matches
        // the file size we just ensured. MAP_SHARED because the producer
        // writes through its own mapping of the same file.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                geometry.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RingError::Map(io::Error::last_os_error()));
        }

        Ok(Self {
            // SAFETY: mmap returned non-null above.
            base: unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) },
            geometry,
            path,
            _file: file,
        })
    }

    /// Region geometry.
    #[inline]
    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn head_word(&self) -> &AtomicU64 {
        // SAFETY: the mapping is at least HEADER_LEN bytes and page-aligned,
        // so offset 0 is a valid, aligned u64 with exactly one writer (the
        // producer).
        unsafe { &*self.base.as_ptr().cast::<AtomicU64>() }
    }

    fn tail_word(&self) -> &AtomicU64 {
        // SAFETY: offset 8 is within the header and 8-aligned; the consumer
        // (this handle) is the only writer.
        unsafe { &*self.base.as_ptr().add(8).cast::<AtomicU64>() }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the data region starts right after the header; the mapping
        // covers geometry.size() bytes.
        unsafe { self.base.as_ptr().add(HEADER_LEN) }
    }

    /// Current producer index (Acquire: pairs with the producer's commit).
    #[inline]
    pub fn head(&self) -> u64 {
        self.head_word().load(Ordering::Acquire)
    }

    /// Current consumer index.
    #[inline]
    pub fn tail(&self) -> u64 {
        self.tail_word().load(Ordering::Acquire)
    }

    /// Validated (head, tail) pair.
    ///
    /// Values beyond the data region mean the producer corrupted the header;
    /// the caller decides whether to [`recover`](Self::recover).
    pub fn indices(&self) -> Result<(u64, u64), RingError> {
        let head = self.head();
        let tail = self.tail();
        let data_len = self.geometry.data_len() as u64;
        if head > data_len || tail > data_len {
            return Err(RingError::CorruptIndices { head, tail, data_len });
        }
        Ok((head, tail))
    }

    /// Bytes currently committed but not yet drained.
    pub fn occupied_bytes(&self) -> Result<u64, RingError> {
        let (head, tail) = self.indices()?;
        let n = self.geometry.data_len() as u64;
        Ok((head + n - tail) % n)
    }

    /// Drops the pending window after corruption: `tail = head`.
    pub fn recover(&self) {
        let head = self.head();
        self.tail_word().store(head, Ordering::Release);
    }

    /// Drains everything committed so far into `out` (cleared first).
    ///
    /// Empty ring returns `Ok(0)`. A contiguous window is one copy; a
    /// wrapped window is copied as `[tail, N)` then `[0, head)`, which also
    /// reassembles any record straddling the wrap point. `tail` advances by
    /// exactly the copied length, modulo the data length, only after the
    /// copy succeeded.
    pub fn drain_into(&mut self, out: &mut Vec<u8>) -> Result<usize, RingError> {
        out.clear();
        let (head, tail) = self.indices()?;
        if head == tail {
            return Ok(0);
        }

        let n = self.geometry.data_len() as u64;
        if tail < head {
            self.copy_region(tail as usize, (head - tail) as usize, out);
        } else {
            self.copy_region(tail as usize, (n - tail) as usize, out);
            self.copy_region(0, head as usize, out);
        }

        let copied = out.len() as u64;
        let new_tail = (tail + copied) % n;
        debug_assert_tail_advanced!(tail, new_tail, copied, n);
        self.tail_word().store(new_tail, Ordering::Release);
        Ok(out.len())
    }

    fn copy_region(&self, offset: usize, len: usize, out: &mut Vec<u8>) {
        if len == 0 {
            return;
        }
        debug_assert_index_in_range!("copy end", offset + len, self.geometry.data_len());
        // SAFETY: [offset, offset + len) lies inside the data region (checked
        // by the caller against validated indices), and the mapping outlives
        // this borrow. The producer never writes inside [tail, head), which
        // is exactly the range being read.
        let src = unsafe { std::slice::from_raw_parts(self.data_ptr().add(offset), len) };
        out.extend_from_slice(src);
    }

    /// Producer half of the protocol: commits `bytes` after the current head.
    ///
    /// This is how test producers (and any co-located writer) feed the ring;
    /// the kernel-side tools follow the same steps through their own
    /// mapping. Returns the number of bytes written, which is less than
    /// `bytes.len()` when the ring lacks space — head is never allowed to
    /// catch up with tail, since equality means empty.
    pub fn push_bytes(&self, bytes: &[u8]) -> Result<usize, RingError> {
        let (head, tail) = self.indices()?;
        let n = self.geometry.data_len() as u64;

        let occupied = (head + n - tail) % n;
        let free = (n - 1).saturating_sub(occupied);
        let len = bytes.len().min(free as usize);
        if len == 0 {
            return Ok(0);
        }

        let first = len.min((n - head) as usize);
        // SAFETY: both segments lie inside the data region; the consumer
        // never reads beyond head, so the slots being written are unobserved
        // until the Release store below publishes them.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(head as usize), first);
            if first < len {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.data_ptr(), len - first);
            }
        }

        let new_head = (head + len as u64) % n;
        self.head_word().store(new_head, Ordering::Release);
        Ok(len)
    }

    /// Unmaps and unlinks the backing file on clean consumer shutdown.
    pub fn close_and_unlink(self) -> Result<(), RingError> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path).map_err(|source| RingError::Unlink { path, source })
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        // SAFETY: base/size are the exact values returned by mmap in open().
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.geometry.size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{decode_events, encode_event, Event, EVENT_SIZE};

    fn test_ring(events: usize) -> (tempfile::TempDir, ShmRing) {
        let dir = tempfile::tempdir().unwrap();
        let geometry = RingGeometry::new(HEADER_LEN + events * EVENT_SIZE);
        let ring = ShmRing::open(dir.path().join(SHM_NAME), geometry).unwrap();
        (dir, ring)
    }

    fn event(seq: u64) -> Event {
        Event {
            pid: seq as i32,
            cmd_end_time_ns: seq,
            session_id: 1,
            mid: seq,
            smbcommand: 8,
            metric: seq * 10,
            tool: 0,
            is_compounded: 0,
            task: [0; 16],
        }
    }

    fn push_events(ring: &ShmRing, seqs: std::ops::Range<u64>) {
        for seq in seqs {
            let n = ring.push_bytes(&encode_event(&event(seq))).unwrap();
            assert_eq!(n, EVENT_SIZE, "ring unexpectedly full at seq {seq}");
        }
    }

    #[test]
    fn empty_ring_drains_nothing() {
        let (_dir, mut ring) = test_ring(8);
        let mut buf = Vec::new();
        assert_eq!(ring.drain_into(&mut buf).unwrap(), 0);
        assert_eq!(ring.occupied_bytes().unwrap(), 0);
    }

    #[test]
    fn contiguous_drain_preserves_order() {
        let (_dir, mut ring) = test_ring(16);
        push_events(&ring, 0..5);

        let mut buf = Vec::new();
        let drained = ring.drain_into(&mut buf).unwrap();
        assert_eq!(drained, 5 * EVENT_SIZE);

        let (events, rem) = decode_events(&buf);
        assert_eq!(rem, 0);
        let mids: Vec<u64> = events.iter().map(|e| e.mid).collect();
        assert_eq!(mids, vec![0, 1, 2, 3, 4]);
        assert_eq!(ring.tail(), ring.head());
    }

    #[test]
    fn wrapped_drain_reassembles_in_order() {
        let (_dir, mut ring) = test_ring(8);
        let mut buf = Vec::new();

        // Move the indices near the end of the region, then write across the
        // wrap point.
        push_events(&ring, 0..6);
        ring.drain_into(&mut buf).unwrap();
        push_events(&ring, 6..12);

        let tail_before = ring.tail();
        let drained = ring.drain_into(&mut buf).unwrap();
        assert_eq!(drained, 6 * EVENT_SIZE);

        let (events, rem) = decode_events(&buf);
        assert_eq!(rem, 0);
        let mids: Vec<u64> = events.iter().map(|e| e.mid).collect();
        assert_eq!(mids, vec![6, 7, 8, 9, 10, 11]);

        let n = ring.geometry().data_len() as u64;
        assert_eq!(ring.tail(), (tail_before + drained as u64) % n);
    }

    #[test]
    fn push_refuses_to_overrun_tail() {
        let (_dir, ring) = test_ring(4);
        let n = ring.geometry().data_len();

        let blob = vec![0xaa_u8; n];
        let written = ring.push_bytes(&blob).unwrap();
        assert_eq!(written, n - 1, "head must stop one byte short of tail");
        assert_eq!(ring.push_bytes(&[1]).unwrap(), 0);
    }

    #[test]
    fn corrupt_indices_detected_and_recovered() {
        let (_dir, mut ring) = test_ring(8);
        let bad = ring.geometry().data_len() as u64 + 1;
        ring.head_word().store(bad, Ordering::Release);

        let mut buf = Vec::new();
        assert!(matches!(
            ring.drain_into(&mut buf),
            Err(RingError::CorruptIndices { .. })
        ));

        ring.recover();
        assert_eq!(ring.tail(), bad);
        // A fresh producer write starting from the recovered state is not
        // possible (head is still bogus), but resetting head as the producer
        // would after a restart makes the ring usable again.
        ring.head_word().store(0, Ordering::Release);
        ring.tail_word().store(0, Ordering::Release);
        push_events(&ring, 0..2);
        assert_eq!(ring.drain_into(&mut buf).unwrap(), 2 * EVENT_SIZE);
    }

    #[test]
    fn close_unlinks_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SHM_NAME);
        let ring = ShmRing::open(&path, RingGeometry::new(HEADER_LEN + 8 * EVENT_SIZE)).unwrap();
        assert!(path.exists());
        ring.close_and_unlink().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn reopen_sees_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SHM_NAME);
        let geometry = RingGeometry::new(HEADER_LEN + 8 * EVENT_SIZE);

        let producer = ShmRing::open(&path, geometry).unwrap();
        push_events(&producer, 0..3);
        drop(producer);

        let mut consumer = ShmRing::open(&path, geometry).unwrap();
        let mut buf = Vec::new();
        assert_eq!(consumer.drain_into(&mut buf).unwrap(), 3 * EVENT_SIZE);
    }
}
