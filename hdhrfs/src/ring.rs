//! Memory-mapped circular byte store.
//!
//! The buffer maps one page-aligned power-of-two backing file *twice*,
//! back to back in a reserved virtual region. Because the second view
//! aliases the first, any span of up to `capacity` bytes starting anywhere
//! in `[0, capacity)` is contiguous in memory even when it logically wraps,
//! so neither producers nor readers ever split a copy.
//!
//! The buffer performs no locking of its own: the owner serializes
//! `append`, `reset` and read snapshots behind one external mutex.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use log::{debug, error};
use thiserror::Error;

/// Errors while setting up the doubled mapping. All are fatal at startup.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The backing file could not be created or sized.
    #[error("Failed to prepare backing file {path}: {source}")]
    Backing { path: String, source: io::Error },

    /// The 2x-capacity address-space reservation failed.
    #[error("Failed to reserve {0} bytes of address space: {1}")]
    Reserve(usize, io::Error),

    /// One of the two fixed placements over the reservation failed.
    #[error("Failed to place {which} buffer view: {source}")]
    Map {
        which: &'static str,
        source: io::Error,
    },
}

/// Fixed-capacity circular byte store for one producer and many readers.
///
/// `written` counts every byte ever appended since the last [`reset`]
/// (monotonic, unbounded); `write_offset` is always `written % capacity`.
///
/// [`reset`]: RingBuffer::reset
pub struct RingBuffer {
    /// Start of the doubled mapping. Exclusively owned; unmapped on drop.
    base: NonNull<u8>,
    capacity: usize,
    write_offset: usize,
    written: u64,
}

// SAFETY: the mapping is exclusively owned by this value and all access to
// it goes through &self/&mut self, so moving the value between threads is
// sound. Shared-access safety is the external mutex's responsibility.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Create the ring over `backing_path`, rounding `requested` up to a
    /// page-aligned power of two. Any partially completed mapping is
    /// released before an error is returned.
    pub fn create(backing_path: &Path, requested: usize) -> Result<Self, AllocationError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut capacity = page;
        while capacity < requested {
            capacity <<= 1;
        }

        let backing = |source| AllocationError::Backing {
            path: backing_path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(backing_path)
            .map_err(backing)?;
        file.set_len(capacity as u64).map_err(backing)?;

        // Reserve 2x capacity inaccessible, then pin two read-write views of
        // the same backing file back to back inside the reservation.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(AllocationError::Reserve(
                capacity * 2,
                io::Error::last_os_error(),
            ));
        }

        let fd = file.as_raw_fd();
        // SAFETY: `base .. base + 2*capacity` was reserved by the mapping
        // above and is not shared with anything else in this process.
        let first = unsafe {
            libc::mmap(
                base,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if first != base {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, capacity * 2) };
            return Err(AllocationError::Map {
                which: "first",
                source,
            });
        }

        let upper = unsafe { (base as *mut u8).add(capacity) as *mut libc::c_void };
        // SAFETY: the upper half of the reservation, same bounds argument.
        let second = unsafe {
            libc::mmap(
                upper,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if second != upper {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, capacity * 2) };
            return Err(AllocationError::Map {
                which: "second",
                source,
            });
        }

        // The fd can go; the mappings keep the file alive.
        drop(file);

        debug!("Ring buffer mapped: {} bytes doubled at {:p}", capacity, base);
        Ok(Self {
            base: NonNull::new(base as *mut u8).unwrap(),
            capacity,
            write_offset: 0,
            written: 0,
        })
    }

    /// Capacity in bytes (page-aligned power of two).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes appended since the last reset.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `data` at the write offset, silently truncating input larger
    /// than the capacity to its first `capacity` bytes. Returns the number
    /// of bytes stored. Single-producer contract: the caller serializes
    /// appends against resets and read snapshots.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let stored = data.len().min(self.capacity);
        // SAFETY: write_offset < capacity and stored <= capacity, so the
        // destination lies inside the doubled mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(self.write_offset),
                stored,
            );
        }
        self.written += stored as u64;
        self.write_offset = (self.write_offset + stored) % self.capacity;
        stored
    }

    /// Borrow `len` bytes starting at ring offset `offset`. The span may
    /// logically wrap; the doubled mapping keeps it contiguous.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= capacity` or `len > capacity`.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset < self.capacity && len <= self.capacity);
        // SAFETY: bounds checked above; offset + len <= 2 * capacity.
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// Logically clear the buffer. Residual bytes stay in storage but are
    /// no longer addressable through `written`; the caller must guarantee
    /// no concurrent append or read snapshot is in flight.
    pub fn reset(&mut self) {
        self.write_offset = 0;
        self.written = 0;
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe the exact doubled region mapped in
        // create(); it is released in one call.
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity * 2) };
        if rc != 0 {
            error!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backing(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hdhrfs-ring-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let ring = RingBuffer::create(&backing("round"), 5000).unwrap();
        assert!(ring.capacity().is_power_of_two());
        assert!(ring.capacity() >= 5000);
    }

    #[test]
    fn test_append_then_read_back() {
        let mut ring = RingBuffer::create(&backing("basic"), 4096).unwrap();
        assert_eq!(ring.append(b"hello ring"), 10);
        assert_eq!(ring.written(), 10);
        assert_eq!(ring.slice(0, 10), b"hello ring");
    }

    #[test]
    fn test_wrapped_span_is_contiguous() {
        let mut ring = RingBuffer::create(&backing("wrap"), 4096).unwrap();
        let capacity = ring.capacity();
        assert_eq!(capacity, 4096, "test assumes a 4 KiB page");

        ring.append(&[0xAA; 4096]);
        ring.append(&[0xBB; 100]);
        assert_eq!(ring.written(), 4196);

        // A span across the wrap point: tail of the old data, then the new.
        let span = ring.slice(4046, 150);
        assert!(span[..50].iter().all(|&b| b == 0xAA));
        assert!(span[50..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_oversized_append_truncates() {
        let mut ring = RingBuffer::create(&backing("trunc"), 4096).unwrap();
        let capacity = ring.capacity();

        let input: Vec<u8> = (0..capacity + 1000).map(|i| (i % 251) as u8).collect();
        assert_eq!(ring.append(&input), capacity);
        assert_eq!(ring.written(), capacity as u64);
        assert_eq!(ring.slice(0, capacity), &input[..capacity]);
    }

    #[test]
    fn test_reset_starts_clean() {
        let mut ring = RingBuffer::create(&backing("reset"), 4096).unwrap();
        ring.append(&[0xAA; 3000]);
        ring.reset();
        assert_eq!(ring.written(), 0);

        ring.append(b"fresh");
        assert_eq!(ring.written(), 5);
        assert_eq!(ring.slice(0, 5), b"fresh");
    }

    /// After any append sequence totalling N bytes, the window of `capacity`
    /// bytes starting at `N % capacity` ends with the tail of the true
    /// input stream.
    #[test]
    fn test_tail_matches_input_stream() {
        let mut ring = RingBuffer::create(&backing("tail"), 4096).unwrap();
        let capacity = ring.capacity();

        let mut stream: Vec<u8> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..64 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let len = (seed % (capacity as u64 / 2)) as usize + 1;
            let chunk: Vec<u8> = (0..len).map(|i| (seed as usize + i) as u8).collect();
            ring.append(&chunk);
            stream.extend_from_slice(&chunk);

            let n = ring.written() as usize;
            assert_eq!(n, stream.len());
            let window = ring.slice(n % capacity, capacity);
            let tail_len = n.min(capacity);
            assert_eq!(&window[capacity - tail_len..], &stream[n - tail_len..]);
        }
    }
}
