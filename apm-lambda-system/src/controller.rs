use tokio_util::sync::CancellationToken;

/// Coordinates cooperative shutdown of all services.
///
/// The controller holds the root cancellation token. Per-invocation tokens are derived from it
/// with [`CancellationToken::child_token`], so a process shutdown also ends the invocation that is
/// currently being processed.
#[derive(Debug, Default)]
pub struct Controller {
    token: CancellationToken,
}

impl Controller {
    /// Creates a controller and starts listening for `SIGTERM` and `SIGINT`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start() -> Self {
        let controller = Self::default();
        tokio::spawn(monitor_signals(controller.token.clone()));
        controller
    }

    /// Returns the root token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(unix)]
async fn monitor_signals(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_term = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(error) => {
            apm_lambda_log::error!("failed to install SIGTERM handler: {error}");
            return;
        }
    };

    tokio::select! {
        _ = sig_term.recv() => apm_lambda_log::info!("SIGTERM received, shutting down"),
        _ = tokio::signal::ctrl_c() => apm_lambda_log::info!("SIGINT received, shutting down"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[cfg(not(unix))]
async fn monitor_signals(token: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => apm_lambda_log::info!("SIGINT received, shutting down"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let controller = Controller::start();
        let root = controller.token();
        let child = root.child_token();
        assert!(!child.is_cancelled());

        root.cancel();

        assert!(child.is_cancelled());
    }
}
