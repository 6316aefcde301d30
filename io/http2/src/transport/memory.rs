//! In-memory duplex byte channel.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::ByteChannel;

#[derive(Debug, Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One direction of a [`MemoryChannel`].
#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn read(&self, out: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            if self.readable.wait_until(&mut state, deadline).timed_out() && state.buf.is_empty()
            {
                if state.closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::TimedOut.into());
            }
        }
        let n = out.len().min(state.buf.len());
        for (dst, src) in out.iter_mut().zip(state.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.buf.extend(data);
        self.readable.notify_all();
        Ok(data.len())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-memory duplex pipe. Clones share the same end.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
}

impl MemoryChannel {
    /// Two connected ends: bytes written to one are read from the other.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        (
            MemoryChannel {
                inbound: a.clone(),
                outbound: b.clone(),
            },
            MemoryChannel {
                inbound: b,
                outbound: a,
            },
        )
    }

    /// Drain whatever is readable right now without waiting.
    pub fn read_available(&self) -> Vec<u8> {
        self.inbound.state.lock().buf.drain(..).collect()
    }
}

impl ByteChannel for MemoryChannel {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.inbound.read(buf, timeout)
    }

    fn write(&mut self, buf: &[u8], _timeout: Duration) -> io::Result<usize> {
        self.outbound.write(buf)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        Ok(Box::new(self.clone()))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.outbound.close();
        Ok(())
    }
}
