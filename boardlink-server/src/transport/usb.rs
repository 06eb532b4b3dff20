//! USB board discovery.
//!
//! [`UsbDetector`] runs enumeration sweeps on demand and matches what it
//! finds against the board catalog. [`UsbMonitor`] watches for hotplug
//! events so the registry can reconcile as soon as something changes.
//!
//! ## Platform Support
//!
//! - **Linux**: udev for enumeration and hotplug monitoring
//! - **Others**: nothing is ever found

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{same_device, DetectedDevice, Detector};
use crate::{
    catalog::{BoardTemplate, Catalog},
    error::Result,
    tracing::prelude::*,
};

/// Information about a discovered USB device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbDeviceInfo {
    /// USB vendor ID
    pub vid: u16,
    /// USB product ID
    pub pid: u16,
    /// Device serial number (if available)
    pub serial_number: Option<String>,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// USB device path (e.g., "/sys/bus/usb/devices/1-1.2")
    pub device_path: String,
    /// Timestamp udev assigned when the device was initialized. Unique for
    /// the lifetime of one plug-in.
    pub session_id: Option<String>,
    /// Serial port device nodes associated with this USB device, sorted
    /// (e.g., ["/dev/ttyACM0", "/dev/ttyACM1"])
    pub serial_ports: Vec<String>,
}

/// A USB device came or went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added { device_path: String },
    Removed { device_path: String },
}

/// Identity of a device across sweeps.
///
/// The USB serial number when the board has one. Multi-port boards share a
/// serial across units, so they, and boards without a serial, use the
/// session id udev assigned at plug-in, then the sysfs path.
pub fn device_identity(info: &UsbDeviceInfo, template: &BoardTemplate) -> String {
    let serial = info
        .serial_number
        .as_deref()
        .filter(|s| !s.is_empty() && template.device_class != "ms1");

    match (serial, info.session_id.as_deref()) {
        (Some(serial), _) => serial.to_string(),
        (None, Some(session)) => format!("{:04x}{:04x}-{}", info.vid, info.pid, session),
        (None, None) => info.device_path.clone(),
    }
}

/// Sweeps the USB bus and matches devices against the catalog.
pub struct UsbDetector {
    catalog: Arc<Catalog>,
}

impl UsbDetector {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    fn classify(&self, devices: Vec<UsbDeviceInfo>) -> Vec<DetectedDevice> {
        devices
            .into_iter()
            .filter_map(|usb| {
                let template = self.catalog.find(usb.vid, usb.pid)?;
                if usb.serial_ports.is_empty() {
                    trace!(
                        board = %template.name,
                        device_path = %usb.device_path,
                        "Known board has no serial port yet"
                    );
                    return None;
                }
                Some(DetectedDevice {
                    id: device_identity(&usb, template),
                    template_id: template.id,
                    usb,
                })
            })
            .collect()
    }

    async fn enumerate() -> Vec<UsbDeviceInfo> {
        match tokio::task::spawn_blocking(platform::enumerate_devices).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                warn!(error = %e, "USB enumeration failed");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "USB enumeration task failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Detector for UsbDetector {
    async fn detect(&self) -> Vec<DetectedDevice> {
        let detected = self.classify(Self::enumerate().await);
        debug!(count = detected.len(), "USB sweep complete");
        detected
    }

    async fn refresh_port(&self, usb: &UsbDeviceInfo) -> Option<Vec<String>> {
        let devices = Self::enumerate().await;
        let found = devices.into_iter().find(|d| same_device(usb, d))?;

        if found.serial_ports.is_empty() {
            None
        } else {
            Some(found.serial_ports)
        }
    }
}

/// Hotplug monitor.
pub struct UsbMonitor {
    event_tx: mpsc::Sender<HotplugEvent>,
}

impl UsbMonitor {
    pub fn new(event_tx: mpsc::Sender<HotplugEvent>) -> Self {
        Self { event_tx }
    }

    /// Start monitoring on a dedicated thread.
    ///
    /// udev handles are !Send and libudev expects them to stay on one
    /// thread, so the monitor gets its own OS thread with a current-thread
    /// runtime rather than running as a task on the shared runtime. The
    /// thread exits when `shutdown` is cancelled or the receiver is dropped.
    pub fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let event_tx = self.event_tx.clone();

        std::thread::Builder::new()
            .name("usb-monitor".to_string())
            .spawn(move || {
                if let Err(e) = platform::monitor_blocking(event_tx, shutdown) {
                    error!("USB monitoring failed: {}", e);
                }
                trace!("USB monitoring thread exiting");
            })
            .map_err(|e| {
                crate::error::Error::Other(format!("Failed to spawn USB monitor thread: {}", e))
            })?;

        trace!("USB monitor thread spawned");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::{HotplugEvent, UsbDeviceInfo};
    use crate::error::Result;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    pub fn enumerate_devices() -> Result<Vec<UsbDeviceInfo>> {
        Ok(Vec::new())
    }

    pub fn monitor_blocking(
        _event_tx: mpsc::Sender<HotplugEvent>,
        _shutdown: CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(class: &str) -> BoardTemplate {
        BoardTemplate {
            id: 0,
            name: "Test".into(),
            vendor_ids: vec![0x2341],
            product_ids: vec![0x0043],
            controller: "atmega328p".into(),
            programmer: "arduino".into(),
            bootloader_id: None,
            device_class: class.into(),
        }
    }

    fn info(serial: Option<&str>, session: Option<&str>) -> UsbDeviceInfo {
        UsbDeviceInfo {
            vid: 0x2341,
            pid: 0x0043,
            serial_number: serial.map(str::to_string),
            device_path: "/sys/devices/usb1/1-1".into(),
            session_id: session.map(str::to_string),
            serial_ports: vec!["/dev/ttyACM0".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_prefers_serial() {
        let id = device_identity(&info(Some("8573531"), Some("123")), &template("arduino"));
        assert_eq!(id, "8573531");
    }

    #[test]
    fn test_identity_falls_back_to_session() {
        let id = device_identity(&info(None, Some("123")), &template("arduino"));
        assert_eq!(id, "23410043-123");

        let id = device_identity(&info(Some(""), None), &template("arduino"));
        assert_eq!(id, "/sys/devices/usb1/1-1");
    }

    #[test]
    fn test_multi_port_boards_ignore_serial() {
        let id = device_identity(&info(Some("FT1234"), Some("55")), &template("ms1"));
        assert_eq!(id, "23410043-55");
    }

    #[test]
    fn test_classify_skips_unknown_and_portless() {
        let catalog = Arc::new(Catalog::builtin().unwrap());
        let detector = UsbDetector::new(catalog);

        let uno = info(Some("A"), None);
        let mut portless = info(Some("B"), None);
        portless.serial_ports.clear();
        let mut unknown = info(Some("C"), None);
        unknown.vid = 0xdead;

        let detected = detector.classify(vec![uno, portless, unknown]);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].id, "A");
    }
}
