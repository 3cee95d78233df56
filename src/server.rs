//! Process lifecycle: capture loop, HTTP listener, and shutdown

use anyhow::{Context, Result};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::camera::CameraDriver;
use crate::config::Config;
use crate::streaming::{CaptureError, CaptureLoop, CaptureSettings, FrameDistributor};
use crate::web::{self, AppState};

/// Extra time the capture thread gets after a stop request, on top of one
/// frame timeout.
const CAPTURE_STOP_SLACK: Duration = Duration::from_secs(2);

pub struct Server {
    config: Config,
    driver: Arc<dyn CameraDriver>,
}

impl Server {
    pub fn new(config: Config, driver: Arc<dyn CameraDriver>) -> Self {
        Self { config, driver }
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.server.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {}", addr))?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Start capture and serve on `listener` until `shutdown` resolves.
    ///
    /// On shutdown the capture loop is stopped and the distributor closed,
    /// which ends every open stream. Connections still open after the
    /// grace period are dropped.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let config = Arc::new(self.config);
        let distributor = Arc::new(FrameDistributor::new(config.stream.subscriber_buffer));

        let capture = CaptureLoop::new(
            Arc::clone(&self.driver),
            Arc::clone(&distributor),
            CaptureSettings::from_config(&config),
        )?;
        let monitor = capture.monitor();
        let capture_task = capture.spawn();

        let app = web::router(AppState::new(
            Arc::clone(&config),
            Arc::clone(&distributor),
            self.driver,
            Some(monitor.clone()),
        ));

        let local_addr = listener.local_addr().context("listener has no local address")?;
        info!(addr = %local_addr, info_enabled = config.server.enable_info, "Web server listening");

        let (triggered_tx, mut triggered_rx) = watch::channel(false);
        let stop_monitor = monitor.clone();
        let stop_distributor = Arc::clone(&distributor);
        let graceful = async move {
            shutdown.await;
            info!("Server is shutting down");
            stop_monitor.stop();
            stop_distributor.close();
            let _ = triggered_tx.send(true);
        };

        let serving = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .into_future();

        let grace = config.server.shutdown_grace();
        let drain_deadline = async move {
            if triggered_rx.wait_for(|triggered| *triggered).await.is_err() {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = serving => result.context("web server failed")?,
            _ = drain_deadline => {
                warn!(grace_secs = grace.as_secs(), "Grace period elapsed, dropping open connections");
            }
        }

        // Covers a serve error that returned before the shutdown future ran
        monitor.stop();
        distributor.close();

        let capture_wait = config.camera.frame_timeout() + CAPTURE_STOP_SLACK;
        match tokio::time::timeout(capture_wait, capture_task).await {
            Ok(joined) => match joined.map_err(CaptureError::from).and_then(|result| result) {
                Ok(()) => {}
                Err(e @ CaptureError::Join(_)) => error!(error = %e, "Capture task panicked"),
                Err(e) => warn!(error = %e, "Capture loop had already stopped"),
            },
            Err(_) => warn!("Capture loop did not stop in time"),
        }

        distributor.log_stats();
        info!("Server stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
