//! Exclusive access to one open device.
//!
//! A [`Session`] moves between `Closed` and `Open`. While open it owns the
//! device's [`Transport`]; a request takes the transport out for the length
//! of one logical operation through [`Session::begin`], which hands back an
//! [`Exchange`] guard. Dropping the guard gives the transport back, or closes
//! the session if the exchange left the device in an unknown state.
//!
//! Only one [`Exchange`] exists at a time, so commands of two requests are
//! never interleaved on the wire.

use core::fmt;
use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::Transport;
use super::apdu::{Apdu, ApduResponse};
use super::framing;
use crate::error::{Error, Result};

struct State {
    transport: Option<Box<dyn Transport>>,
    open: bool,
    in_flight: bool,
    /// Bumped by every successful attach.
    epoch: u64,
}

/// Lifecycle and mutual exclusion for one device.
pub struct Session {
    state: Mutex<State>,
    released: Condvar,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("open", &state.open)
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates a closed session.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                transport: None,
                open: false,
                in_flight: false,
                epoch: 0,
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` while the session holds an open device.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Returns `true` while an [`Exchange`] is outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock().in_flight
    }

    /// Installs an opened transport. Returns `false` and closes `transport`
    /// if the session was already open.
    pub fn attach(&self, mut transport: Box<dyn Transport>) -> bool {
        let mut state = self.lock();
        if state.open {
            drop(state);
            transport.close();
            return false;
        }
        state.transport = Some(transport);
        state.open = true;
        state.epoch = state.epoch.wrapping_add(1);
        debug!("session opened");
        true
    }

    /// Closes the session. Safe to call any number of times.
    ///
    /// If an exchange is in flight its transport is closed when the
    /// exchange finishes.
    pub fn close(&self) {
        let mut state = self.lock();
        let was_open = core::mem::replace(&mut state.open, false);
        if let Some(mut transport) = state.transport.take() {
            transport.close();
        }
        drop(state);
        self.released.notify_all();
        if was_open {
            debug!("session closed");
        }
    }

    /// Starts a logical request, waiting up to `busy_wait` for another one
    /// to finish.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the session is closed
    /// - [`Error::DeviceBusy`] if another request still holds the device
    pub fn begin(&self, busy_wait: Duration) -> Result<Exchange<'_>> {
        let started = Instant::now();
        let mut state = self.lock();
        loop {
            if !state.open {
                return Err(Error::NotOpen);
            }
            if !state.in_flight {
                break;
            }
            let remaining = busy_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                debug!("device busy");
                return Err(Error::DeviceBusy);
            }
            state = self
                .released
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let transport = state.transport.take().ok_or(Error::NotOpen)?;
        state.in_flight = true;
        Ok(Exchange {
            session: self,
            transport: Some(transport),
            epoch: state.epoch,
            poisoned: false,
        })
    }
}

/// Exclusive use of a device for one logical request.
pub struct Exchange<'a> {
    session: &'a Session,
    transport: Option<Box<dyn Transport>>,
    epoch: u64,
    poisoned: bool,
}

impl fmt::Debug for Exchange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl Exchange<'_> {
    /// Sends one APDU and waits at most `timeout` for the reply.
    ///
    /// A failure to get a well-formed reply (timeout, I/O error, bad
    /// framing) closes the session once this exchange ends: a late reply
    /// would otherwise be taken for the answer to the next command.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`], [`Error::Transport`] or [`Error::ProtocolError`].
    /// A device status word is not an error here.
    pub fn transmit(&mut self, apdu: &Apdu, timeout: Duration) -> Result<ApduResponse> {
        let transport = self.transport.as_deref_mut().ok_or(Error::NotOpen)?;
        trace!(ins = apdu.ins(), p1 = apdu.p1(), "exchange");

        framing::exchange(transport, apdu, timeout).inspect_err(|e| {
            warn!(error = %e, ins = apdu.ins(), "exchange failed");
            self.poisoned = true;
        })
    }

    /// Marks the device state as unknown; the session closes when this
    /// exchange ends.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Best-effort abort of a partially sent command, then [`Self::poison`].
    pub fn abort(&mut self) {
        if let Some(transport) = self.transport.as_deref_mut()
            && let Err(e) = transport.abort()
        {
            debug!(error = %e, "abort not delivered");
        }
        self.poison();
    }

    /// Returns `true` if the session will close when this exchange ends.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        state.in_flight = false;
        if let Some(mut transport) = self.transport.take() {
            if !state.open || state.epoch != self.epoch {
                // closed, and possibly reopened on a new transport, meanwhile
                transport.close();
            } else if self.poisoned {
                transport.close();
                warn!("closing session after a failed exchange");
                state.open = false;
            } else {
                state.transport = Some(transport);
            }
        }
        drop(state);
        self.session.released.notify_all();
    }
}
