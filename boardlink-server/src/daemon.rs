//! Daemon lifecycle management for boardlink-server.
//!
//! This module handles the core daemon functionality including initialization,
//! task management, signal handling, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    config::Config,
    context::AppContext,
    server,
    transport::{HotplugEvent, UsbMonitor},
};

/// Give the kernel time to create tty nodes after a USB add.
const HOTPLUG_SETTLE: Duration = Duration::from_millis(500);

/// Shortest accepted refresh period.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// The main daemon.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let ctx = Arc::new(AppContext::from_config(self.config)?);

        let report = ctx.registry.reconcile().await;
        info!(
            devices = ctx.registry.len(),
            detected = report.added.len(),
            "Initial device scan complete"
        );

        // Create and start USB hotplug monitoring
        if ctx.config.usb_disable {
            info!("USB hotplug monitoring disabled");
        } else {
            let (hotplug_tx, hotplug_rx) = mpsc::channel::<HotplugEvent>(100);
            match UsbMonitor::new(hotplug_tx).start(self.shutdown.clone()) {
                Ok(()) => {
                    self.tracker
                        .spawn(hotplug_task(ctx.clone(), hotplug_rx, self.shutdown.clone()));
                }
                Err(e) => error!("Failed to start USB monitoring: {}", e),
            }
        }

        self.tracker
            .spawn(refresh_task(ctx.clone(), self.shutdown.clone()));

        // Start the websocket server
        let listener = TcpListener::bind(&ctx.config.address)
            .await
            .with_context(|| format!("failed to listen on {}", ctx.config.address))?;
        self.tracker.spawn(server::accept_loop(
            listener,
            ctx.clone(),
            self.tracker.clone(),
            self.shutdown.clone(),
        ));

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=boardlink_server=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Initiate shutdown
        self.shutdown.cancel();

        // Wait for all tasks, connections included, to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Reconcile after USB devices come and go.
///
/// Events arriving while one reconcile is pending are folded into it.
async fn hotplug_task(
    ctx: Arc<AppContext>,
    mut events: mpsc::Receiver<HotplugEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        debug!(?event, "USB hotplug");

        tokio::time::sleep(HOTPLUG_SETTLE).await;
        while events.try_recv().is_ok() {}

        let report = ctx.registry.reconcile().await;
        if !report.is_quiet() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                "Device list updated"
            );
        }
    }
    trace!("Hotplug task exiting");
}

/// Periodic reconcile, skipped while nobody is connected unless
/// `always_refresh` is set.
async fn refresh_task(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    let period = ctx.config.refresh_interval().max(MIN_REFRESH_INTERVAL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !ctx.config.always_refresh && ctx.connections.is_empty() {
            continue;
        }
        let report = ctx.registry.reconcile().await;
        if !report.is_quiet() {
            debug!(
                added = report.added.len(),
                removed = report.removed.len(),
                changed = report.port_changed.len(),
                "Periodic refresh"
            );
        }
    }
    trace!("Refresh task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionId;
    use crate::context::testing::{context, simulated_config};
    use crate::registry::testing::{uno_sighting, ScriptedDetector};

    fn config(always_refresh: bool) -> Config {
        Config {
            always_refresh,
            refresh_interval_secs: 15,
            ..simulated_config(0, 0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_idle_without_clients() {
        let detector = Arc::new(ScriptedDetector::default());
        let ctx = context(config(false), detector.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(refresh_task(ctx, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(detector.sweeps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_runs_while_client_connected() {
        let detector = Arc::new(ScriptedDetector::default());
        detector.attach(uno_sighting("A1", "/dev/ttyACM0"));
        let ctx = context(config(false), detector.clone());
        ctx.connections.add(ConnectionId::next());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(refresh_task(ctx.clone(), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(detector.sweeps(), 1);
        assert!(ctx.registry.get("A1").is_some());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_refresh() {
        let detector = Arc::new(ScriptedDetector::default());
        let ctx = context(config(true), detector.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(refresh_task(ctx, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(46)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(detector.sweeps(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotplug_events_are_coalesced() {
        let detector = Arc::new(ScriptedDetector::default());
        detector.attach(uno_sighting("A1", "/dev/ttyACM0"));
        let ctx = context(config(false), detector.clone());
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(hotplug_task(ctx.clone(), rx, shutdown.clone()));

        for _ in 0..3 {
            tx.send(HotplugEvent::Added {
                device_path: "/sys/bus/usb/devices/A1".into(),
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(detector.sweeps(), 1);
        assert!(ctx.registry.get("A1").is_some());

        drop(tx);
        task.await.unwrap();
    }
}
