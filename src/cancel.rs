use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::warn;

use crate::error::SraError;

/// Shared flag tripped by an interrupt or termination request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trips the token and reports whether it was already tripped.
    pub fn trip(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }
}

/// Exit status used when a run is interrupted (128 + SIGTERM).
pub const INTERRUPTED_EXIT_CODE: u8 = 143;

/// Trips `token` on Ctrl-C, SIGTERM or SIGHUP. The listener keeps running
/// for the whole process: a second request exits immediately with
/// [`INTERRUPTED_EXIT_CODE`].
///
/// The listener runs on its own thread with a single-threaded tokio runtime
/// so the rest of the program stays blocking.
pub fn install_signal_forwarder(token: CancelToken) -> Result<(), SraError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| SraError::Submit(format!("signal runtime: {err}")))?;
    thread::Builder::new()
        .name("signal-forwarder".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(err) = forward_signals(token).await {
                    warn!(error = %err, "signal listener unavailable");
                }
            });
        })
        .map_err(|err| SraError::Submit(format!("signal thread: {err}")))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    Stop,
    Exit,
}

fn on_signal(token: &CancelToken, name: &str) -> SignalAction {
    if token.trip() {
        warn!(signal = name, "second termination request, exiting");
        SignalAction::Exit
    } else {
        warn!(signal = name, "received termination request, stopping chunk jobs");
        SignalAction::Stop
    }
}

fn apply(action: SignalAction) {
    if action == SignalAction::Exit {
        std::process::exit(i32::from(INTERRUPTED_EXIT_CODE));
    }
}

#[cfg(unix)]
async fn forward_signals(token: CancelToken) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    loop {
        let name = tokio::select! {
            _ = int.recv() => "SIGINT",
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
        };
        apply(on_signal(&token, name));
    }
}

#[cfg(not(unix))]
async fn forward_signals(token: CancelToken) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        apply(on_signal(&token, "ctrl-c"));
    }
}
