//! Cancellation signal shared by every background task and blocking call.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};

/// Held by the owner of the tasks, triggering disconnects every [Shutdown].
#[derive(Debug)]
pub(crate) struct ShutdownTrigger {
    sender: Mutex<Option<Sender<()>>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Shutdown {
    receiver: Receiver<()>,
}

pub(crate) fn channel() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = flume::bounded(0);

    (
        ShutdownTrigger {
            sender: Mutex::new(Some(sender)),
        },
        Shutdown { receiver },
    )
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        self.receiver.is_disconnected()
    }

    /// Sleep for `duration`, returns true if woken up by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }

    pub fn sleep_until(&self, deadline: Instant) -> bool {
        match self.receiver.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => false,
            // Nothing is ever sent, only disconnected.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}
