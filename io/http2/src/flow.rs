//! HTTP/2 flow control.
//!
//! HTTP/2 uses a credit-based flow control scheme. Each side maintains a
//! send window per stream and one for the connection; a DATA frame may only
//! be written once both hold enough credit.
//!
//! [`OutgoingWindow`] is shared between the connection reader, which applies
//! WINDOW_UPDATE and SETTINGS credit, and stream workers, which block in
//! [`OutgoingWindow::wait_until_withdraw`] or [`withdraw_both`] until credit
//! arrives. [`IncomingWindow`] is owned by the reader and decides when to
//! hand credit back to the peer.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::frame::{ErrorCode, MAX_WINDOW_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// A credit would push the window past 2^31-1.
    #[error("flow control window overflow: {window} + {increment}")]
    Overflow { window: i64, increment: i64 },
    /// The peer sent more DATA than the receive window allows.
    #[error("received {len} bytes with only {available} bytes of window")]
    Exceeded { len: u32, available: i64 },
    /// The window was closed while waiting, the stream or connection is gone.
    #[error("flow control window closed")]
    Closed,
}

impl FlowError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FlowError::Closed => ErrorCode::Cancel,
            _ => ErrorCode::FlowControlError,
        }
    }
}

#[derive(Debug)]
struct WindowState {
    window: i64,
    closed: bool,
}

impl WindowState {
    fn credit(&mut self, increment: i64) -> Result<(), FlowError> {
        let window = self.window + increment;
        if window > MAX_WINDOW_SIZE as i64 {
            return Err(FlowError::Overflow {
                window: self.window,
                increment,
            });
        }
        self.window = window;
        Ok(())
    }
}

/// Send-side credit for a stream or a connection.
#[derive(Debug)]
pub struct OutgoingWindow {
    state: Mutex<WindowState>,
    credited: Condvar,
}

impl OutgoingWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                window: initial as i64,
                closed: false,
            }),
            credited: Condvar::new(),
        }
    }

    /// Current credit. May be negative after a SETTINGS shrink.
    pub fn available(&self) -> i64 {
        self.state.lock().window
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Debit `n` bytes if the credit is there, without blocking.
    pub fn withdraw_if_can(&self, n: u32) -> Result<bool, FlowError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(FlowError::Closed);
        }
        if state.window >= n as i64 {
            state.window -= n as i64;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Block until `n` bytes of credit exist and debit them. Returns
    /// `Ok(false)` if `timeout` elapses first.
    pub fn wait_until_withdraw(&self, n: u32, timeout: Duration) -> Result<bool, FlowError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if !self.wait_for(&mut state, n as i64, deadline)? {
            return Ok(false);
        }
        state.window -= n as i64;
        Ok(true)
    }

    /// Credit the window from a WINDOW_UPDATE and wake waiters.
    pub fn apply_window_update(&self, increment: u32) -> Result<(), FlowError> {
        self.state.lock().credit(increment as i64)?;
        self.credited.notify_all();
        Ok(())
    }

    /// Shift the window by the change in `SETTINGS_INITIAL_WINDOW_SIZE`.
    pub fn apply_settings_change(&self, old_initial: u32, new_initial: u32) -> Result<(), FlowError> {
        let delta = new_initial as i64 - old_initial as i64;
        self.state.lock().credit(delta)?;
        if delta > 0 {
            self.credited.notify_all();
        }
        Ok(())
    }

    /// Fail every current and future waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.credited.notify_all();
    }

    /// Wait until the window holds at least `needed`. Returns false on
    /// timeout.
    fn wait_for(
        &self,
        state: &mut MutexGuard<'_, WindowState>,
        needed: i64,
        deadline: Instant,
    ) -> Result<bool, FlowError> {
        loop {
            if state.closed {
                return Err(FlowError::Closed);
            }
            if state.window >= needed {
                return Ok(true);
            }
            if self.credited.wait_until(state, deadline).timed_out() {
                if state.closed {
                    return Err(FlowError::Closed);
                }
                return Ok(state.window >= needed);
            }
        }
    }
}

/// Debit exactly `n` bytes from both a stream and its connection, or
/// nothing. Returns `Ok(false)` on timeout.
pub fn withdraw_both(
    stream: &OutgoingWindow,
    connection: &OutgoingWindow,
    n: u32,
    timeout: Duration,
) -> Result<bool, FlowError> {
    debit_both(stream, connection, n, false, timeout).map(|debited| debited == n)
}

/// Debit between 1 and `max` bytes from both windows, as much as both
/// allow. Returns 0 on timeout.
pub fn withdraw_both_up_to(
    stream: &OutgoingWindow,
    connection: &OutgoingWindow,
    max: u32,
    timeout: Duration,
) -> Result<u32, FlowError> {
    debit_both(stream, connection, max, true, timeout)
}

// Locks are always taken stream first, then connection.
fn debit_both(
    stream: &OutgoingWindow,
    connection: &OutgoingWindow,
    n: u32,
    partial: bool,
    timeout: Duration,
) -> Result<u32, FlowError> {
    let deadline = Instant::now() + timeout;
    let needed = if partial { n.min(1) as i64 } else { n as i64 };

    loop {
        {
            let mut s = stream.state.lock();
            if !stream.wait_for(&mut s, needed, deadline)? {
                return Ok(0);
            }
        }
        {
            let mut c = connection.state.lock();
            if !connection.wait_for(&mut c, needed, deadline)? {
                return Ok(0);
            }
        }

        let mut s = stream.state.lock();
        let mut c = connection.state.lock();
        if s.closed || c.closed {
            return Err(FlowError::Closed);
        }
        if s.window >= needed && c.window >= needed {
            let amount = if partial {
                (n as i64).min(s.window).min(c.window)
            } else {
                n as i64
            };
            s.window -= amount;
            c.window -= amount;
            return Ok(amount as u32);
        }
        // another writer took the credit between the waits
        if Instant::now() >= deadline {
            return Ok(0);
        }
    }
}

/// Receive-side credit for a stream or a connection.
///
/// Credit is returned to the peer in batches: once the consumed bytes reach
/// half of the initial window a WINDOW_UPDATE is due.
#[derive(Debug)]
pub struct IncomingWindow {
    window: i64,
    initial: u32,
    unacked: u32,
}

impl IncomingWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
            initial,
            unacked: 0,
        }
    }

    pub fn available(&self) -> i64 {
        self.window
    }

    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Account for a received DATA frame.
    pub fn receive(&mut self, len: u32) -> Result<(), FlowError> {
        if len as i64 > self.window {
            return Err(FlowError::Exceeded {
                len,
                available: self.window,
            });
        }
        self.window -= len as i64;
        Ok(())
    }

    /// Mark `len` received bytes as consumed. Returns the WINDOW_UPDATE
    /// increment to send, if one is due.
    pub fn release(&mut self, len: u32) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(len);
        if self.unacked == 0 || self.unacked < self.initial / 2 {
            return None;
        }
        let increment = self.unacked;
        self.unacked = 0;
        self.window += increment as i64;
        Some(increment)
    }

    /// Apply an acknowledged change of our `SETTINGS_INITIAL_WINDOW_SIZE`.
    pub fn apply_settings_change(&mut self, new_initial: u32) {
        self.window += new_initial as i64 - self.initial as i64;
        self.initial = new_initial;
    }
}
