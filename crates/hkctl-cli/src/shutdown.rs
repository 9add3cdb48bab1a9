//! SIGINT/SIGTERM handling
//!
//! The first signal cancels the run's token so retry loops unwind at their
//! next checkpoint. If the process is still alive after [`EXIT_GRACE`], it
//! exits with status 1.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// How long a cancelled run may take to unwind
pub const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Cancel `token` on SIGINT or SIGTERM and arm the exit watchdog
pub fn install(token: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        warn!(signal = signal, "Received signal, cancelling");
        token.cancel();

        tokio::time::sleep(EXIT_GRACE).await;
        error!("Graceful shutdown timed out, exiting");
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        name = ctrl_c() => name,
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
