use std::sync::Arc;

use tokio::task::JoinHandle;

use super::service::Orchestrator;

/// 等待 Ctrl-C，Unix 下同时等待 SIGTERM
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// 停止编排器并给出进程退出码：成功为 0，停止失败为 1
pub async fn shutdown_exit_code(orchestrator: &Orchestrator) -> i32 {
    match orchestrator.stop().await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "Graceful shutdown failed");
            1
        }
    }
}

/// 收到终止信号后停止编排器并退出进程
pub fn install_shutdown_hook(orchestrator: Arc<Orchestrator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signals");
            return;
        }
        tracing::info!("Shutdown signal received, stopping orchestrator");
        let code = shutdown_exit_code(&orchestrator).await;
        std::process::exit(code);
    })
}
