use serde::Serialize;
use tracing::error;

/// An OS signal caught while the run was in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Interrupt {
    pub signal: &'static str,
    /// Conventional shell exit code for the signal (128 + signo).
    pub exit_code: i32,
}

pub const SIGINT: Interrupt = Interrupt {
    signal: "SIGINT",
    exit_code: 130,
};

pub const SIGTERM: Interrupt = Interrupt {
    signal: "SIGTERM",
    exit_code: 143,
};

/// Resolves on the first SIGINT or SIGTERM. A handler that cannot be
/// installed never fires.
pub async fn shutdown_signal() -> Interrupt {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => SIGINT,
        _ = terminate => SIGTERM,
    }
}
