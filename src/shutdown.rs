//! Shutdown supervision.
//!
//! Signal listeners only record which termination condition arrived; the
//! acceptor observes it through [`ShutdownSignal`] and performs the actual
//! teardown (socket close, session stop) in ordinary task context.
//!
//! Only the controllable conditions (SIGINT, SIGQUIT, SIGTERM) are hooked.
//! SIGILL, SIGABRT, SIGFPE and SIGSEGV keep their default disposition so
//! the kernel terminates the process and releases its sockets.

use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Termination condition that ends the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGINT, interactive interrupt
    Interrupt,
    /// SIGQUIT, quit request
    Quit,
    /// SIGTERM, termination request
    Terminate,
}

impl TerminationSignal {
    pub const ALL: [TerminationSignal; 3] = [
        TerminationSignal::Interrupt,
        TerminationSignal::Quit,
        TerminationSignal::Terminate,
    ];

    /// Numeric signal identifier, also used as the exit status.
    pub fn number(self) -> i32 {
        match self {
            TerminationSignal::Interrupt => libc::SIGINT,
            TerminationSignal::Quit => libc::SIGQUIT,
            TerminationSignal::Terminate => libc::SIGTERM,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Quit => "SIGQUIT",
            TerminationSignal::Terminate => "SIGTERM",
        }
    }

    fn kind(self) -> SignalKind {
        match self {
            TerminationSignal::Interrupt => SignalKind::interrupt(),
            TerminationSignal::Quit => SignalKind::quit(),
            TerminationSignal::Terminate => SignalKind::terminate(),
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.number())
    }
}

/// Posts termination conditions to every [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<Option<TerminationSignal>>>,
}

impl ShutdownController {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, ShutdownSignal { rx })
    }

    /// Record `signal` as the shutdown cause. The first condition wins.
    pub fn trigger(&self, signal: TerminationSignal) {
        let posted = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(signal);
                true
            } else {
                false
            }
        });
        if !posted {
            debug!(signal = %signal, "Shutdown already in progress");
        }
    }

    /// Hook the controllable termination signals.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install(&self) -> io::Result<()> {
        for termination in TerminationSignal::ALL {
            let mut stream = signal(termination.kind())?;
            let controller = self.clone();

            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    warn!(signal = %termination, "Termination signal received");
                    controller.trigger(termination);
                }
            });
        }
        Ok(())
    }
}

/// Resolves once a termination condition has been posted.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<TerminationSignal>>,
}

impl ShutdownSignal {
    /// Wait for the termination condition. Cancel-safe.
    pub async fn recv(&mut self) -> TerminationSignal {
        loop {
            if let Some(signal) = *self.rx.borrow_and_update() {
                return signal;
            }
            if self.rx.changed().await.is_err() {
                // Controller gone without a condition: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_numbers() {
        assert_eq!(TerminationSignal::Interrupt.number(), 2);
        assert_eq!(TerminationSignal::Quit.number(), 3);
        assert_eq!(TerminationSignal::Terminate.number(), 15);
        assert_eq!(TerminationSignal::Terminate.to_string(), "SIGTERM (15)");
    }

    #[tokio::test]
    async fn test_trigger_wakes_receivers() {
        let (controller, mut signal) = ShutdownController::new();
        let mut other = signal.clone();

        controller.trigger(TerminationSignal::Quit);

        assert_eq!(signal.recv().await, TerminationSignal::Quit);
        assert_eq!(other.recv().await, TerminationSignal::Quit);
    }

    #[tokio::test]
    async fn test_first_condition_wins() {
        let (controller, mut signal) = ShutdownController::new();

        controller.trigger(TerminationSignal::Interrupt);
        controller.trigger(TerminationSignal::Terminate);

        assert_eq!(signal.recv().await, TerminationSignal::Interrupt);
    }

    #[tokio::test]
    async fn test_recv_pending_until_triggered() {
        let (controller, mut signal) = ShutdownController::new();

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.recv()).await;
        assert!(waited.is_err());

        controller.trigger(TerminationSignal::Terminate);
        assert_eq!(signal.recv().await, TerminationSignal::Terminate);
    }

    // Both raises live in one test: signal handlers are process-wide, so a
    // second installed controller would observe the other test's signal.
    #[tokio::test]
    async fn test_os_signal_reaches_receiver() {
        for expected in [TerminationSignal::Terminate, TerminationSignal::Quit] {
            let (controller, mut signal) = ShutdownController::new();
            controller.install().unwrap();

            // SAFETY: raise only delivers a signal to this process, which
            // now has a handler installed for it.
            assert_eq!(unsafe { libc::raise(expected.number()) }, 0);

            let received = tokio::time::timeout(Duration::from_secs(5), signal.recv())
                .await
                .unwrap();
            assert_eq!(received, expected);
        }
    }
}
