//! Re-acquiring a board after it reboots into its bootloader.
//!
//! Native-USB boards such as the Leonardo run their bootloader as a
//! different USB device. To flash one, the server touches its port, waits
//! for a device of the bootloader template to show up, and flashes that
//! device instead. If two unregistered bootloader devices appear at once
//! there is no safe way to tell which one is ours, so the flash is
//! refused.
//!
//! Handshakes are serialized process-wide: while one runs, the registry is
//! told not to auto-register the bootloader template, and a second
//! handshake would see the first one's board.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::{
    board::{BoardError, FlashContext},
    catalog::TemplateId,
    registry::DeviceRegistry,
    tracing::prelude::*,
    transport::{DetectedDevice, PortReboot, TouchReboot},
};

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Detection sweeps before giving up.
    pub attempts: u32,
    /// Pause before each sweep.
    pub interval: Duration,
    /// Settling time after the handshake, on every outcome.
    pub grace: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            attempts: 25,
            interval: Duration::from_millis(500),
            grace: Duration::from_millis(500),
        }
    }
}

pub struct BootloaderHandshake {
    lock: Mutex<()>,
    reboot: Arc<dyn PortReboot>,
    config: HandshakeConfig,
}

impl Default for BootloaderHandshake {
    fn default() -> Self {
        Self::new(Arc::new(TouchReboot), HandshakeConfig::default())
    }
}

/// Keeps a template out of auto-registration while alive.
struct Suppression<'a> {
    registry: &'a DeviceRegistry,
    template: TemplateId,
}

impl<'a> Suppression<'a> {
    fn new(registry: &'a DeviceRegistry, template: TemplateId) -> Self {
        registry.suppress(template);
        Self { registry, template }
    }
}

impl Drop for Suppression<'_> {
    fn drop(&mut self) {
        self.registry.allow(self.template);
    }
}

impl BootloaderHandshake {
    pub fn new(reboot: Arc<dyn PortReboot>, config: HandshakeConfig) -> Self {
        Self {
            lock: Mutex::new(()),
            reboot,
            config,
        }
    }

    /// Reboot the board on `port` into its bootloader and flash it there.
    pub async fn flash_via_bootloader(
        &self,
        port: &str,
        bootloader: TemplateId,
        firmware: &Path,
        ctx: FlashContext<'_>,
    ) -> Result<String, BoardError> {
        let _serialized = self.lock.lock().await;

        let result = self.reboot_and_flash(port, bootloader, firmware, ctx).await;
        if let Err(e) = &result {
            warn!(port, error = %e, "Bootloader flash failed");
        }

        tokio::time::sleep(self.config.grace).await;
        result
    }

    async fn reboot_and_flash(
        &self,
        port: &str,
        bootloader: TemplateId,
        firmware: &Path,
        ctx: FlashContext<'_>,
    ) -> Result<String, BoardError> {
        self.reboot
            .reboot_to_bootloader(port)
            .await
            .map_err(BoardError::Reboot)?;

        let registry = ctx.registry;
        let _suppressed = Suppression::new(registry, bootloader);

        let target = self.locate(registry, bootloader).await?;
        info!(
            port,
            bootloader_port = ?target.usb.serial_ports.first(),
            "Board found in bootloader mode"
        );

        let device = registry
            .build_device(&target)
            .ok_or(BoardError::BootloaderNotFound)?;
        device.board().flash(firmware, ctx).await
    }

    /// Poll detection for exactly one unregistered bootloader device.
    async fn locate(
        &self,
        registry: &DeviceRegistry,
        bootloader: TemplateId,
    ) -> Result<DetectedDevice, BoardError> {
        for attempt in 1..=self.config.attempts {
            tokio::time::sleep(self.config.interval).await;

            let report = registry.reconcile().await;
            let mut candidates: Vec<_> = report
                .not_added
                .into_iter()
                .filter(|d| d.template_id == bootloader)
                .collect();

            match candidates.len() {
                0 => trace!(attempt, "No bootloader device yet"),
                1 => return candidates.pop().ok_or(BoardError::BootloaderNotFound),
                n => {
                    warn!(attempt, candidates = n, "Several boards in bootloader mode");
                    return Err(BoardError::BootloaderAmbiguous);
                }
            }
        }
        Err(BoardError::BootloaderNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{arduino::ArduinoBoard, Board};
    use crate::catalog::{BoardTemplate, Catalog};
    use crate::registry::testing::{sighting, ScriptedDetector};
    use crate::tool::testing::{toolchain, ScriptedTool};
    use crate::transport::UsbDeviceInfo;
    use async_trait::async_trait;

    /// Records the touched port and plugs in the given bootloader devices.
    struct ScriptedReboot {
        detector: Arc<ScriptedDetector>,
        appear: Vec<DetectedDevice>,
        fail: bool,
        touched: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PortReboot for ScriptedReboot {
        async fn reboot_to_bootloader(&self, port: &str) -> std::io::Result<()> {
            self.touched.lock().unwrap().push(port.to_string());
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such port"));
            }
            for device in &self.appear {
                self.detector.detach(&device.id);
                self.detector.attach(device.clone());
            }
            Ok(())
        }
    }

    struct Fixture {
        registry: DeviceRegistry,
        handshake: BootloaderHandshake,
        reboot: Arc<ScriptedReboot>,
        detector: Arc<ScriptedDetector>,
        avrdude: Arc<ScriptedTool>,
        board: ArduinoBoard,
        bootloader: TemplateId,
    }

    fn fixture(appearing: usize, fail: bool) -> Fixture {
        let catalog = Arc::new(Catalog::builtin().unwrap());
        let leonardo: BoardTemplate = catalog.find(0x2341, 0x8036).unwrap().clone();
        let bootloader = leonardo.bootloader_id.unwrap();

        let detector = Arc::new(ScriptedDetector::default());
        let avrdude = Arc::new(ScriptedTool::succeeding());
        let tools = Arc::new(toolchain(avrdude.clone(), Arc::new(ScriptedTool::succeeding())));

        let appear = (0..appearing)
            .map(|i| {
                sighting(
                    &format!("BL{}", i),
                    bootloader,
                    0x2341,
                    0x0036,
                    &format!("/dev/ttyACM{}", 10 + i),
                )
            })
            .collect();
        let reboot = Arc::new(ScriptedReboot {
            detector: detector.clone(),
            appear,
            fail,
            touched: std::sync::Mutex::new(Vec::new()),
        });

        let board = ArduinoBoard::new(
            Arc::new(leonardo),
            UsbDeviceInfo {
                vid: 0x2341,
                pid: 0x8036,
                serial_ports: vec!["/dev/ttyACM0".into()],
                ..Default::default()
            },
            tools.clone(),
        );

        Fixture {
            registry: DeviceRegistry::new(catalog, detector.clone(), tools),
            handshake: BootloaderHandshake::new(reboot.clone(), HandshakeConfig::default()),
            reboot,
            detector,
            avrdude,
            board,
            bootloader,
        }
    }

    async fn flash(f: &Fixture) -> Result<String, BoardError> {
        f.board
            .flash(
                Path::new("/tmp/blink.hex"),
                FlashContext {
                    registry: &f.registry,
                    handshake: &f.handshake,
                    progress: None,
                    address: None,
                    verify: false,
                },
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_bootloader_device_is_flashed() {
        let f = fixture(1, false);

        flash(&f).await.unwrap();

        assert_eq!(*f.reboot.touched.lock().unwrap(), vec!["/dev/ttyACM0".to_string()]);
        let calls = f.avrdude.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&"/dev/ttyACM10".to_string()));
        assert!(!f.registry.is_suppressed(f.bootloader));
        // The bootloader identity is transient and never registered.
        assert!(f.registry.get("BL0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_bootloader_devices_are_ambiguous() {
        let f = fixture(2, false);

        let err = flash(&f).await.unwrap_err();

        assert!(matches!(err, BoardError::BootloaderAmbiguous));
        assert!(f.avrdude.calls().is_empty());
        assert_eq!(f.detector.sweeps(), 1);
        assert!(!f.registry.is_suppressed(f.bootloader));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_bootloader_device_times_out() {
        let f = fixture(0, false);
        let started = tokio::time::Instant::now();

        let err = flash(&f).await.unwrap_err();

        assert!(matches!(err, BoardError::BootloaderNotFound));
        assert_eq!(f.detector.sweeps(), 25);
        assert!(f.avrdude.calls().is_empty());
        // 25 polls at 500ms plus the grace period.
        assert!(started.elapsed() >= Duration::from_millis(25 * 500 + 500));
        assert!(!f.registry.is_suppressed(f.bootloader));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_failure_aborts() {
        let f = fixture(1, true);

        let err = flash(&f).await.unwrap_err();

        assert!(matches!(err, BoardError::Reboot(_)));
        assert_eq!(f.detector.sweeps(), 0);
        assert!(!f.registry.is_suppressed(f.bootloader));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_bootloader_device_is_ignored() {
        let f = fixture(1, false);
        // A board already sitting in its bootloader before the handshake.
        let stale = sighting("OLD", f.bootloader, 0x2341, 0x0036, "/dev/ttyACM7");
        f.detector.attach(stale);
        f.registry.reconcile().await;
        assert!(f.registry.get("OLD").is_some());

        flash(&f).await.unwrap();
        assert!(f.avrdude.calls()[0].contains(&"/dev/ttyACM10".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshakes_are_serialized() {
        let f = Arc::new(fixture(1, false));
        let started = tokio::time::Instant::now();

        let first = {
            let f = f.clone();
            tokio::spawn(async move { flash(&f).await })
        };
        let second = {
            let f = f.clone();
            tokio::spawn(async move { flash(&f).await })
        };

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(f.reboot.touched.lock().unwrap().len(), 2);
        // One poll plus the grace period each, back to back.
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
