//! Physical transport layer.
//!
//! Finds boards on the USB bus and resolves their serial port paths, and
//! provides the serial-side operations the server needs (the reboot into a
//! bootloader, opening a port for live monitoring).

pub mod serial;
pub mod usb;

use async_trait::async_trait;

use crate::catalog::TemplateId;

pub use serial::{PortReboot, TouchReboot};
pub use usb::{HotplugEvent, UsbDetector, UsbDeviceInfo, UsbMonitor};

/// One board seen by a detection sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDevice {
    /// Stable identity used as the device id.
    pub id: String,
    pub template_id: TemplateId,
    pub usb: UsbDeviceInfo,
}

/// Source of board sightings.
///
/// Failures degrade to "nothing found": a sweep that can't talk to the OS
/// reports no devices, and a refresh that can't find the device reports it
/// absent.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Full sweep of attached boards matching the catalog.
    async fn detect(&self) -> Vec<DetectedDevice>;

    /// Current serial ports of a previously seen device, or `None` when it
    /// is no longer attached.
    async fn refresh_port(&self, usb: &UsbDeviceInfo) -> Option<Vec<String>>;
}

/// Whether two USB records describe the same physical board.
///
/// Boards with a serial number are matched on it, otherwise on the USB
/// device path; vid and pid must agree either way.
pub fn same_device(a: &UsbDeviceInfo, b: &UsbDeviceInfo) -> bool {
    if a.vid != b.vid || a.pid != b.pid {
        return false;
    }
    match &a.serial_number {
        Some(serial) if !serial.is_empty() => b.serial_number.as_ref() == Some(serial),
        _ => a.device_path == b.device_path,
    }
}

/// The outcome of one `detect` call, reused to answer port refreshes so a
/// reconcile pass walks the bus once however many boards are known.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    devices: Vec<DetectedDevice>,
}

impl Sweep {
    pub fn new(devices: Vec<DetectedDevice>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[DetectedDevice] {
        &self.devices
    }
}

#[async_trait]
impl Detector for Sweep {
    async fn detect(&self) -> Vec<DetectedDevice> {
        self.devices.clone()
    }

    async fn refresh_port(&self, usb: &UsbDeviceInfo) -> Option<Vec<String>> {
        let found = self.devices.iter().find(|d| same_device(usb, &d.usb))?;
        if found.usb.serial_ports.is_empty() {
            None
        } else {
            Some(found.usb.serial_ports.clone())
        }
    }
}

/// Detector that never finds anything. Used when USB discovery is disabled
/// and on platforms without a native implementation.
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    async fn detect(&self) -> Vec<DetectedDevice> {
        Vec::new()
    }

    async fn refresh_port(&self, _usb: &UsbDeviceInfo) -> Option<Vec<String>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(id: &str, serial: Option<&str>, path: &str, ports: &[&str]) -> DetectedDevice {
        DetectedDevice {
            id: id.to_string(),
            template_id: 0,
            usb: UsbDeviceInfo {
                vid: 0x2341,
                pid: 0x0043,
                serial_number: serial.map(String::from),
                device_path: path.to_string(),
                serial_ports: ports.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_sweep_answers_refreshes() {
        let sweep = Sweep::new(vec![
            seen("A1", Some("A1"), "/sys/bus/usb/devices/1-1", &["/dev/ttyACM4"]),
            seen("p", None, "/sys/bus/usb/devices/1-2", &["/dev/ttyUSB0"]),
            seen("bare", Some("C3"), "/sys/bus/usb/devices/1-3", &[]),
        ]);

        // Matched by serial even though the board moved to another hub port.
        let moved = seen("A1", Some("A1"), "/sys/bus/usb/devices/2-4", &[]).usb;
        assert_eq!(
            sweep.refresh_port(&moved).await,
            Some(vec!["/dev/ttyACM4".to_string()])
        );

        let by_path = seen("p", None, "/sys/bus/usb/devices/1-2", &[]).usb;
        assert_eq!(
            sweep.refresh_port(&by_path).await,
            Some(vec!["/dev/ttyUSB0".to_string()])
        );

        let without_port = seen("bare", Some("C3"), "/sys/bus/usb/devices/1-3", &[]).usb;
        assert_eq!(sweep.refresh_port(&without_port).await, None);

        let mut other_pid = moved.clone();
        other_pid.pid = 0x0001;
        assert_eq!(sweep.refresh_port(&other_pid).await, None);
        assert_eq!(sweep.detect().await.len(), 3);
    }
}
