//! OS signal handling.
//!
//! A dedicated thread blocks on the signal set and forwards each signal
//! as one byte through a self-pipe registered with the main event loop.
//! The second quit signal bypasses the pipe and exits the process
//! directly, so a wedged shutdown can still be interrupted.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use mio::unix::pipe;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::event_loop::{EventLoopError, FdId, Interest, LoopHandle};

/// Signals the proxy acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT or SIGTERM: begin ordered shutdown.
    Quit,
    /// SIGHUP: reload routes, rotate log.
    Hup,
}

/// Owns the signal thread and the read end of the self-pipe.
pub struct SignalListener {
    receiver: pipe::Receiver,
}

impl SignalListener {
    /// Install handlers and start the signal thread.
    pub fn start() -> io::Result<SignalListener> {
        let (mut tx, receiver) = pipe::new()?;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

        std::thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || {
                let mut quit_count = 0u32;

                for signal in signals.forever() {
                    let byte = match signal {
                        SIGINT | SIGTERM => {
                            quit_count += 1;
                            if quit_count > 1 {
                                // the first quit is being handled; force out
                                std::process::exit(1);
                            }
                            b'q'
                        }
                        SIGHUP => b'h',
                        _ => continue,
                    };

                    loop {
                        match tx.write(&[byte]) {
                            Ok(_) => break,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(_) => return,
                        }
                    }
                }
            })?;

        Ok(SignalListener { receiver })
    }

    /// Register the pipe with the event loop. `on_signal` runs on the
    /// loop thread for each delivered signal.
    pub fn register<F: FnMut(Signal) + 'static>(
        self,
        handle: &LoopHandle,
        mut on_signal: F,
    ) -> Result<FdId, EventLoopError> {
        let mut receiver = self.receiver;
        let fd = receiver.as_raw_fd();

        handle.register_fd(fd, Interest::READABLE, move |_| {
            let mut buf = [0u8; 16];
            loop {
                match receiver.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            match byte {
                                b'q' => on_signal(Signal::Quit),
                                b'h' => on_signal(Signal::Hup),
                                _ => {}
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })
    }
}
