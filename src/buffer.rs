//! Growable network byte buffer with retrieve/prepend semantics.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_index   <=   write_index    <=    capacity
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved so a length header can be
//! prepended in front of already-written payload without shifting it.

use std::io;
use std::os::fd::RawFd;

/// Reserved space in front of the readable region for cheap header prepend.
pub const CHEAP_PREPEND: usize = 8;
/// Initial data capacity (excluding the prepend reserve).
pub const INITIAL_SIZE: usize = 1024;

/// Growable, contiguous read/write byte buffer.
///
/// Owned exclusively by one connection direction; never shared.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with room for `initial_size` bytes of payload.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// Read-only view of the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Discard `n` readable bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds `readable_bytes()`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes(), "retrieve past readable region");
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard everything readable and reset both cursors to the reserve.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Remove and return `n` readable bytes.
    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes(), "retrieve past readable region");
        let out = self.buf[self.read_index..self.read_index + n].to_vec();
        self.retrieve(n);
        out
    }

    /// Remove and return the entire readable region.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Append bytes to the writable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Prepend bytes directly in front of the readable region.
    ///
    /// Must fit in the reserve; callers prepend before any retrieve shrinks
    /// the prependable space below `data.len()`.
    ///
    /// # Panics
    /// Panics if the prependable space is smaller than `data.len()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend exceeds reserved space"
        );
        self.read_index -= data.len();
        self.buf[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Make sure at least `n` bytes are writable.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.buf.resize(self.write_index + n, 0);
        } else {
            // Reclaim the already-read prefix instead of reallocating.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Read from `fd` with a single scatter syscall.
    ///
    /// One iovec covers the writable tail, a second covers a 64 KiB
    /// on-stack overflow area; overflow is appended afterwards. This bounds
    /// the call to one `readv` no matter how much data is pending, without
    /// keeping an oversized per-connection buffer around for small traffic.
    ///
    /// Returns the number of bytes read (0 means peer EOF). The OS error is
    /// surfaced as-is; nothing is retried here.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        // When the buffer alone is big enough, skip the overflow area.
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve_conservation() {
        let mut buf = Buffer::new();
        let mut appended = 0usize;
        let mut retrieved = 0usize;
        for i in 0..100 {
            let chunk = vec![i as u8; 50];
            buf.append(&chunk);
            appended += chunk.len();
            let take = (i * 7) % 40;
            buf.retrieve(take);
            retrieved += take;
            assert_eq!(buf.readable_bytes() + retrieved, appended);
        }
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes() + buf.prependable_bytes(), buf.buf.len());
    }

    #[test]
    fn peek_stays_within_readable_region() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.peek().len(), buf.readable_bytes());
    }

    #[test]
    fn prepend_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let len = (buf.readable_bytes() as u32).to_be_bytes();
        buf.prepend(&len);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        let all = buf.retrieve_all_as_vec();
        assert_eq!(&all[..4], &7u32.to_be_bytes());
        assert_eq!(&all[4..], b"payload");
        buf.append(b"again");
        assert_eq!(buf.peek(), b"again");
    }

    #[test]
    #[should_panic(expected = "prepend exceeds reserved space")]
    fn prepend_past_reserve_panics() {
        let mut buf = Buffer::new();
        buf.prepend(&[0u8; CHEAP_PREPEND + 1]);
    }

    #[test]
    fn grows_by_reclaiming_read_prefix_first() {
        let mut buf = Buffer::with_capacity(100);
        buf.append(&[1u8; 80]);
        buf.retrieve(60);
        let cap_before = buf.buf.len();
        // 20 readable, 20 writable, 60 reclaimable: fits without realloc.
        buf.append(&[2u8; 70]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 90);
        assert_eq!(&buf.peek()[..20], &[1u8; 20]);
    }

    #[test]
    fn read_fd_spills_into_overflow_area() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        let payload = vec![0xabu8; 3000];
        let n = unsafe {
            libc::write(wr, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n, 3000);

        // Initial writable space is 1024; the rest lands in the overflow
        // area and must be appended transparently.
        let mut buf = Buffer::new();
        let got = buf.read_fd(rd).unwrap();
        assert_eq!(got, 3000);
        assert_eq!(buf.readable_bytes(), 3000);
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
