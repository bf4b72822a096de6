use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on Ctrl+C or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::warn!(error = %e, "signal handler failed, falling back to ctrl_c()");
            let _ = signal::ctrl_c().await;
        }
        token.cancel();
    });
}

async fn wait_for_signal() -> Result<()> {
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("received Ctrl+C");
        }
        result = wait_sigterm() => {
            result?;
            tracing::info!("received SIGTERM");
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_sigterm() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    term.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_sigterm() -> Result<()> {
    std::future::pending::<Result<()>>().await
}
