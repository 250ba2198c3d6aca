// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sink IO thread management.
//!
//! Every linked sink owns one IO thread. The thread owns the sink's
//! [`SinkThread`] state: attached inputs, soft volume, latency bookkeeping,
//! the monitor outputs and the deferred volume queue. The main thread never
//! touches that state directly once the sink is linked; it sends
//! [`SinkMessage`]s and waits for the [`Reply`].
//!
//! Before a sink is put the same state is held in-line ([`ThreadLink::Local`])
//! and messages are processed synchronously, so callers do not need to care
//! which side of `put` they are on.

mod io;
mod message;
mod render;
pub mod volume_change;

pub use io::SinkThread;
pub(crate) use io::ThreadInit;
pub(crate) use message::{Envelope, Reply, SinkMessage, VolumeSync};

use crate::error::{Result, SinkError};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// IO-thread pump for a sink, typically the code that hands rendered audio
/// to a device.
pub trait SinkDriver: Send {
    /// Called on the IO thread when the previous wake-up is due. Returns the
    /// delay until the next call, or `None` to sleep until the next message.
    fn process(&mut self, sink: &mut SinkThread) -> Option<Duration>;
}

/// Notifications from an IO thread to the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The hardware volume or mute changed behind our back; re-read both.
    UpdateVolumeAndMute(u32),
}

/// Handle to a running sink IO thread.
pub struct SinkThreadHandle {
    cmd_tx: Sender<Envelope>,
    handle: Option<JoinHandle<()>>,
}

impl SinkThreadHandle {
    /// Spawn the IO thread, moving `state` and `driver` onto it.
    pub fn spawn(state: Box<SinkThread>, driver: Option<Box<dyn SinkDriver>>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Envelope>();
        let name = format!("sink-io-{}", state.name());

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_io_loop(state, driver, cmd_rx))
            .map_err(|e| SinkError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            cmd_tx,
            handle: Some(handle),
        })
    }

    /// Send a message and wait for it to be processed.
    pub fn send(&self, msg: SinkMessage) -> Result<Reply> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.cmd_tx
            .send(Envelope {
                msg,
                ack: Some(ack_tx),
            })
            .map_err(|_| SinkError::ThreadGone)?;
        ack_rx.recv().map_err(|_| SinkError::ThreadGone)
    }

    /// Queue a message without waiting.
    pub fn post(&self, msg: SinkMessage) -> Result<()> {
        self.cmd_tx
            .send(Envelope { msg, ack: None })
            .map_err(|_| SinkError::ThreadGone)
    }

    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(Envelope {
            msg: SinkMessage::Shutdown,
            ack: None,
        });
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Sink IO thread panicked");
            }
        }
    }
}

impl Drop for SinkThreadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Where a sink's thread-side state currently lives.
pub(crate) enum ThreadLink {
    /// Not put yet: processed in-line on the main thread.
    Local(Box<SinkThread>),
    Remote(SinkThreadHandle),
    /// Unlinked; the thread has been joined.
    Gone,
}

impl ThreadLink {
    pub fn send(&mut self, msg: SinkMessage) -> Result<Reply> {
        match self {
            ThreadLink::Local(state) => Ok(state.process_msg(msg)),
            ThreadLink::Remote(handle) => handle.send(msg),
            ThreadLink::Gone => Err(SinkError::ThreadGone),
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, ThreadLink::Gone)
    }

    /// Moves the local state onto a new IO thread.
    pub fn start(&mut self, driver: Option<Box<dyn SinkDriver>>) -> Result<()> {
        match std::mem::replace(self, ThreadLink::Gone) {
            ThreadLink::Local(state) => {
                *self = ThreadLink::Remote(SinkThreadHandle::spawn(state, driver)?);
                Ok(())
            }
            other => {
                *self = other;
                Err(SinkError::Refused("IO thread already started".into()))
            }
        }
    }

    /// Stops the IO thread, if any, and drops the thread-side state.
    pub fn stop(&mut self) {
        if let ThreadLink::Remote(handle) = std::mem::replace(self, ThreadLink::Gone) {
            handle.shutdown();
        }
    }
}

fn until(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(now))
}

/// IO loop (runs on the dedicated sink thread).
fn run_io_loop(
    mut state: Box<SinkThread>,
    mut driver: Option<Box<dyn SinkDriver>>,
    cmd_rx: Receiver<Envelope>,
) {
    info!("IO thread for sink {} started", state.name());

    let mut driver_wake: Option<Instant> = Some(Instant::now());
    let mut volume_wake: Option<Instant> = None;

    loop {
        let now = Instant::now();
        let timeout = match (until(driver_wake, now), until(volume_wake, now)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let received = match timeout {
            Some(t) => cmd_rx.recv_timeout(t),
            None => cmd_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Envelope {
                msg: SinkMessage::Shutdown,
                ack,
            }) => {
                if let Some(ack) = ack {
                    let _ = ack.send(Reply::Done);
                }
                break;
            }
            Ok(Envelope { msg, ack }) => {
                let reply = state.process_msg(msg);
                if let Some(ack) = ack {
                    let _ = ack.send(reply);
                }
                // A message may have changed what the driver should do.
                if driver_wake.is_none() {
                    driver_wake = Some(Instant::now());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Command channel closed for sink {}", state.name());
                break;
            }
        }

        let (_, usec_to_next) = state.apply_volume_changes();
        volume_wake = (usec_to_next > 0).then(|| Instant::now() + Duration::from_micros(usec_to_next));

        if let Some(driver) = driver.as_mut() {
            if driver_wake.is_some_and(|w| w <= Instant::now()) {
                driver_wake = driver.process(&mut state).map(|d| Instant::now() + d);
            }
        } else {
            driver_wake = None;
        }
    }

    state.detach_all();
    info!("IO thread for sink {} stopped", state.name());
}

/// Notice channel shared by every sink of a core.
pub(crate) fn notice_channel() -> (Sender<Notice>, Receiver<Notice>) {
    mpsc::channel()
}
