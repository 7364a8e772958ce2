//! Signal-driven cancellation.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the token returned by
//! [`install_signal_handler`]. Passes notice it at their next suspension
//! point, save a checkpoint, and return. A second signal exits at once.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

/// Exit status for a forced exit (128 + SIGINT).
const FORCE_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalResponse {
    Checkpoint,
    ForceExit,
}

#[derive(Debug, Default)]
struct SignalCounter(AtomicU32);

impl SignalCounter {
    fn record(&self) -> SignalResponse {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            SignalResponse::Checkpoint
        } else {
            SignalResponse::ForceExit
        }
    }
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = self.term.recv() => "SIGTERM",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}

/// Register the handlers and return the token they cancel.
pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut signals = Signals::register()?;
    let counter = SignalCounter::default();

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            match counter.record() {
                SignalResponse::Checkpoint => {
                    tracing::info!(signal = name, "Stopping after the current item");
                    tracing::info!("Progress will be saved. Signal again to exit immediately");
                    handler_token.cancel();
                }
                SignalResponse::ForceExit => {
                    tracing::warn!(signal = name, "Forced exit");
                    std::process::exit(FORCE_EXIT_CODE);
                }
            }
        }
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_signal_forces_exit() {
        let counter = SignalCounter::default();
        assert_eq!(counter.record(), SignalResponse::Checkpoint);
        assert_eq!(counter.record(), SignalResponse::ForceExit);
        assert_eq!(counter.record(), SignalResponse::ForceExit);
    }

    // Signal delivery can't be safely tested in a shared test binary.
    #[tokio::test]
    async fn test_install_returns_live_token() {
        let token = install_signal_handler().unwrap();
        assert!(!token.is_cancelled());
    }
}
