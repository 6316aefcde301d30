//! Byte channel abstraction.
//!
//! The engine reads and writes through [`ByteChannel`], which abstracts over
//! a plain TCP socket, a TLS session terminated elsewhere, or the in-memory
//! pipe used by tests. Every call is bounded by a timeout.

mod memory;
mod plain;

pub use memory::MemoryChannel;

use std::io;
use std::time::Duration;

/// A readable and writable octet stream with bounded waits.
pub trait ByteChannel: Send {
    /// Read into `buf`. `Ok(0)` is end of stream; an elapsed timeout is an
    /// error of kind `TimedOut` or `WouldBlock`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write some of `buf`, returning how much was accepted.
    fn write(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize>;

    /// A second handle to the same stream, so that one thread can read while
    /// another writes.
    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>>;

    /// Close the write side. Reads on the peer see end of stream.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Write all of `buf`, each write bounded by `timeout`.
    fn write_all(&mut self, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf, timeout) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ByteChannel for Box<dyn ByteChannel> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        (**self).write(buf, timeout)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        (**self).try_clone()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }
}

/// Returns true for the error kinds a timed-out read or write produces.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}
