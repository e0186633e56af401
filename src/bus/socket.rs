//! Socket wrapper over the bus transport.
//!
//! Wraps one zmq socket with non-blocking multipart send/recv, a pending
//! send queue, and spec application (bind/connect plus ipc file mode).
//! All sockets of one worker live on that worker's thread; the wrapper is
//! deliberately not `Sync`.

use std::collections::VecDeque;
use std::os::fd::RawFd;

use crate::bus::spec::{ipc_path, SpecInfo};

/// Sends queued beyond this are dropped with an error log; a peer this
/// far behind is effectively gone and the ZHTTP layer will time out.
const PENDING_MAX: usize = 1_024;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),

    #[error("invalid endpoint spec: {0}")]
    InvalidSpec(String),

    #[error("send queue full")]
    QueueFull,
}

/// One bus socket plus its pending-send queue.
pub struct BusSocket {
    sock: zmq::Socket,
    pending: VecDeque<Vec<Vec<u8>>>,
    name: &'static str,
}

impl BusSocket {
    pub fn new(
        ctx: &zmq::Context,
        kind: zmq::SocketType,
        name: &'static str,
    ) -> Result<Self, BusError> {
        let sock = ctx.socket(kind)?;
        sock.set_linger(0)?;
        sock.set_sndhwm(50_000)?;
        sock.set_rcvhwm(50_000)?;

        Ok(Self {
            sock,
            pending: VecDeque::new(),
            name,
        })
    }

    /// Set the socket identity (DEALER/ROUTER routing id).
    pub fn set_identity(&self, id: &[u8]) -> Result<(), BusError> {
        self.sock.set_identity(id)?;
        Ok(())
    }

    /// Subscribe to a topic prefix (SUB sockets).
    pub fn subscribe(&self, prefix: &[u8]) -> Result<(), BusError> {
        self.sock.set_subscribe(prefix)?;
        Ok(())
    }

    /// Bind or connect per each spec.
    pub fn apply_specs(&self, specs: &[SpecInfo]) -> Result<(), BusError> {
        for info in specs {
            if !info.spec.starts_with("tcp://") && !info.spec.starts_with("ipc://") {
                return Err(BusError::InvalidSpec(info.spec.clone()));
            }

            if info.bind {
                self.sock.bind(&info.spec)?;
                tracing::debug!(socket = self.name, spec = %info.spec, "bound");

                if let (Some(path), Some(mode)) = (ipc_path(&info.spec), info.ipc_file_mode) {
                    set_ipc_file_mode(path, mode);
                }
            } else {
                self.sock.connect(&info.spec)?;
                tracing::debug!(socket = self.name, spec = %info.spec, "connected");
            }
        }

        Ok(())
    }

    /// The pollable fd. Readability means "state may have changed"; the
    /// caller must drain with [`recv`](Self::recv) and re-check.
    pub fn raw_fd(&self) -> Result<RawFd, BusError> {
        Ok(self.sock.get_fd()?)
    }

    /// Whether a full message is waiting.
    pub fn has_input(&self) -> bool {
        matches!(self.sock.get_events(), Ok(events) if events.contains(zmq::POLLIN))
    }

    /// Send a multipart message without blocking. Messages the transport
    /// cannot take now are queued and flushed on the next writability or
    /// explicit [`flush`](Self::flush).
    pub fn send(&mut self, parts: Vec<Vec<u8>>) -> Result<(), BusError> {
        if !self.pending.is_empty() {
            self.queue(parts)?;
            self.flush();
            return Ok(());
        }

        match self.try_send(&parts) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => self.queue(parts),
            Err(e) => Err(e.into()),
        }
    }

    /// Attempt queued sends. Returns true when the queue is empty.
    pub fn flush(&mut self) -> bool {
        while let Some(parts) = self.pending.front() {
            match self.try_send(parts) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(zmq::Error::EAGAIN) => return false,
                Err(e) => {
                    tracing::error!(socket = self.name, error = %e, "dropping queued message");
                    self.pending.pop_front();
                }
            }
        }

        true
    }

    /// Receive one multipart message, or `None` if nothing is waiting.
    pub fn recv(&mut self) -> Result<Option<Vec<Vec<u8>>>, BusError> {
        match self.sock.recv_multipart(zmq::DONTWAIT) {
            Ok(parts) => Ok(Some(parts)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn try_send(&self, parts: &[Vec<u8>]) -> Result<(), zmq::Error> {
        self.sock
            .send_multipart(parts.iter().map(|p| p.as_slice()), zmq::DONTWAIT)
    }

    fn queue(&mut self, parts: Vec<Vec<u8>>) -> Result<(), BusError> {
        if self.pending.len() >= PENDING_MAX {
            tracing::error!(socket = self.name, "send queue full; dropping message");
            return Err(BusError::QueueFull);
        }

        self.pending.push_back(parts);
        Ok(())
    }
}

fn set_ipc_file_mode(path: &str, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        tracing::warn!(path, mode = format!("{:o}", mode), error = %e, "failed to set ipc file mode");
    }
}
