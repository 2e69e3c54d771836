use log::info;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

const SIG_NONE: u8 = 0;
const SIG_INT: u8 = 1;
const SIG_TERM: u8 = 2;

/// Process-wide cooperative shutdown flag.
///
/// Every blocking loop in the gateway checks [`Shutdown::is_running`] before
/// its next blocking call and arms its timed waits with
/// [`Shutdown::notified`], so a termination signal propagates without any
/// thread being killed.
pub struct Shutdown {
    running: AtomicBool,
    notify: Notify,
    signal: AtomicU8,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Shutdown {
            running: AtomicBool::new(true),
            notify: Notify::new(),
            signal: AtomicU8::new(SIG_NONE),
        })
    }

    /// Spawn the task that converts SIGINT/SIGTERM into a cooperative stop.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let ctrl_c = async {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    this.signal.store(SIG_INT, Ordering::Relaxed);
                    info!("Received SIGINT, starting shutdown");
                }
                _ = terminate => {
                    this.signal.store(SIG_TERM, Ordering::Relaxed);
                    info!("Received SIGTERM, starting shutdown");
                }
            }

            this.shutdown();
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip the running flag and wake everything. Re-entrant: the second and
    /// later calls return immediately.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Resolves once `running` has become false.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_running() {
            return;
        }
        notified.await;
    }

    /// Armed waiter for use inside `tokio::select!` branches. The future is
    /// registered before the caller re-checks `is_running`, so a concurrent
    /// `shutdown()` cannot be missed.
    pub async fn notified(&self) {
        self.wait().await
    }

    /// Name of the signal that caused the shutdown, for the final log line.
    pub fn signal_name(&self) -> &'static str {
        match self.signal.load(Ordering::Relaxed) {
            SIG_INT => "SIGINT",
            SIG_TERM => "SIGTERM",
            _ => "internal request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_running() {
        let shutdown = Shutdown::new();
        assert!(shutdown.is_running());
        assert_eq!(shutdown.signal_name(), "internal request");
    }

    #[test]
    fn shutdown_is_reentrant() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        assert!(!shutdown.is_running());
        // second call must return immediately and keep the state
        shutdown.shutdown();
        assert!(!shutdown.is_running());
    }

    #[tokio::test]
    async fn wait_returns_after_shutdown() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait() did not return after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_stopped() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("wait() must not block after shutdown");
    }
}
