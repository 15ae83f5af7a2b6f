//! Process-wide service context.
//!
//! Built once at startup and torn down in reverse order. Anything that needs
//! the driver or the scheduler borrows it from here.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::alerts::{AlertDriver, AlertError, AlertSource, SubscribeRequest, Subscription};
use crate::config::UndertowConfig;
use crate::engine::{Alert, AlertCategory, AlertKind, Session};
use crate::pieces::PieceScheduler;
use crate::session::SessionService;
use crate::{Result, UndertowError};

/// Owns the running alert pipeline and piece scheduler.
pub struct Services {
    config: UndertowConfig,
    session: Arc<SessionService>,
    driver: AlertDriver,
    scheduler: Arc<PieceScheduler>,
    run_task: Option<JoinHandle<std::result::Result<(), AlertError>>>,
    janitor: Option<JoinHandle<()>>,
}

impl Services {
    /// Validates `config` and starts every service against `engine`.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Configuration` - `config` failed validation
    /// - `UndertowError::Alert` - The alert source could not be opened
    pub fn start(config: UndertowConfig, engine: Arc<dyn Session>) -> Result<Self> {
        config.validate()?;

        let session = Arc::new(SessionService::new(engine, config.alerts.alert_mask));
        let source = AlertSource::open(
            Arc::clone(session.session()),
            config.alerts.source_mode,
            config.alerts.thread_wait,
        )?;
        tracing::info!("Alert source opened in {} mode", source.mode());

        let driver = AlertDriver::new(Arc::clone(&session), config.alerts.stall_timeout);
        let run_driver = driver.clone();
        let run_task = tokio::spawn(async move { run_driver.run(source).await });

        let scheduler = Arc::new(PieceScheduler::new(
            driver.clone(),
            config.scheduler.clone(),
        ));

        let removed = driver.subscribe(SubscribeRequest::new([AlertKind::TorrentRemoved]));
        let janitor = tokio::spawn(forget_removed(removed, Arc::clone(&scheduler)));

        Ok(Self {
            config,
            session,
            driver,
            scheduler,
            run_task: Some(run_task),
            janitor: Some(janitor),
        })
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionService> {
        &self.session
    }

    pub fn driver(&self) -> &AlertDriver {
        &self.driver
    }

    pub fn scheduler(&self) -> &Arc<PieceScheduler> {
        &self.scheduler
    }

    /// Replaces the statically configured alert mask once the driver is
    /// idle, so no subscriber is mid-batch when the engine's output changes.
    ///
    /// A slow subscriber only delays the change by `timeout`; the mask is
    /// applied either way.
    pub async fn stage_alert_mask(&self, mask: AlertCategory, timeout: Duration) {
        if let Err(e) = self.driver.wait_until_idle(timeout).await {
            tracing::warn!("Staging alert mask {} without idle driver: {}", mask, e);
        }
        self.session.stage_alert_mask(mask);
    }

    /// Stops the janitor and the driver, then waits for the pump to exit.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Alert` - The pump had already failed
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
            let _ = janitor.await;
        }
        self.driver.shutdown();

        let Some(run_task) = self.run_task.take() else {
            return Ok(());
        };
        match run_task.await {
            Ok(result) => result.map_err(UndertowError::from),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
        if self.run_task.is_some() {
            self.driver.shutdown();
        }
    }
}

/// Drops piece windows of removed torrents.
async fn forget_removed(mut removed: Subscription, scheduler: Arc<PieceScheduler>) {
    loop {
        match removed.next().await {
            Ok(alert) => {
                if let Alert::TorrentRemoved { handle, .. } = &*alert {
                    scheduler.forget(*handle);
                }
            }
            Err(AlertError::Shutdown) => return,
            Err(e) => {
                tracing::warn!("Window janitor stopped: {}", e);
                return;
            }
        }
    }
}
