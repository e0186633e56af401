//! Cross-thread wakeup primitive.
//!
//! A `SetReadiness` handle can be signaled from any thread; the owning
//! event loop polls the paired receiver and wakes. Backed by a unix pipe:
//! a full pipe already guarantees a pending wake, so writes that would
//! block are treated as success.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use mio::unix::pipe;

/// Create a connected wake pair. The receiver is registered by the event
/// loop; the sender half is cloneable and thread-safe.
pub fn wake_pair() -> io::Result<(SetReadiness, WakeReceiver)> {
    let (sender, receiver) = pipe::new()?;

    Ok((
        SetReadiness {
            sender: Arc::new(Mutex::new(sender)),
        },
        WakeReceiver { receiver },
    ))
}

/// Thread-safe readiness setter.
#[derive(Clone)]
pub struct SetReadiness {
    sender: Arc<Mutex<pipe::Sender>>,
}

impl SetReadiness {
    /// Mark the paired loop ready (`true`) or leave it as-is (`false`).
    /// Setting readiness on a loop that is already pending is a no-op.
    pub fn set(&self, ready: bool) -> io::Result<()> {
        if !ready {
            return Ok(());
        }

        let mut sender = self.sender.lock().unwrap();
        match sender.write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The loop-side half of a wake pair.
pub struct WakeReceiver {
    pub(crate) receiver: pipe::Receiver,
}

impl WakeReceiver {
    /// Consume all pending wake bytes.
    pub(crate) fn drain(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.receiver.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}
