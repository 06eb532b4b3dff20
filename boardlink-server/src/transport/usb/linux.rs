//! Linux udev backend.
//!
//! Enumeration is synchronous and runs on the blocking pool; hotplug
//! monitoring runs on its own thread with a current-thread runtime so the
//! !Send udev handles never leave it.
//!
//! When a USB device has several serial ports they are sorted by node name,
//! so a multi-port board reports them in the same order on every plug-in.

use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{HotplugEvent, UsbDeviceInfo};
use crate::{
    error::{Error, Result},
    tracing::prelude::*,
};

fn udev_error(what: &str, e: std::io::Error) -> Error {
    Error::Other(format!("{}: {}", what, e))
}

fn attribute(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .and_then(|v| v.to_str())
        .map(|s| s.trim().to_string())
}

fn hex_attribute(device: &udev::Device, name: &str) -> Result<u16> {
    let value = attribute(device, name)
        .ok_or_else(|| Error::Other(format!("Missing {} attribute", name)))?;
    u16::from_str_radix(&value, 16)
        .map_err(|e| Error::Other(format!("Invalid {} '{}': {}", name, value, e)))
}

/// tty device nodes below `device` in the sysfs tree, sorted.
fn find_serial_ports(device: &udev::Device) -> Result<Vec<String>> {
    let device_syspath = device.syspath();

    let mut enumerator =
        udev::Enumerator::new().map_err(|e| udev_error("Failed to create enumerator", e))?;
    enumerator
        .match_subsystem("tty")
        .map_err(|e| udev_error("Failed to filter by subsystem", e))?;

    let mut ports = Vec::new();
    for tty in enumerator
        .scan_devices()
        .map_err(|e| udev_error("Failed to scan devices", e))?
    {
        if !tty.syspath().starts_with(device_syspath) {
            continue;
        }
        if let Some(path) = tty.devnode().and_then(|n| n.to_str()) {
            ports.push(path.to_string());
        }
    }

    ports.sort();
    Ok(ports)
}

fn build_device_info(device: &udev::Device) -> Result<UsbDeviceInfo> {
    let vid = hex_attribute(device, "idVendor")?;
    let pid = hex_attribute(device, "idProduct")?;

    let device_path = device
        .syspath()
        .to_str()
        .ok_or_else(|| Error::Other("Invalid device path".to_string()))?
        .to_string();

    let session_id = device
        .property_value("USEC_INITIALIZED")
        .and_then(|v| v.to_str())
        .map(str::to_string);

    let info = UsbDeviceInfo {
        vid,
        pid,
        serial_number: attribute(device, "serial"),
        manufacturer: attribute(device, "manufacturer"),
        product: attribute(device, "product"),
        device_path,
        session_id,
        serial_ports: find_serial_ports(device)?,
    };

    trace!(
        vid = %format!("{:04x}", info.vid),
        pid = %format!("{:04x}", info.pid),
        serial = ?info.serial_number,
        ports = ?info.serial_ports,
        "Enumerated USB device"
    );

    Ok(info)
}

/// Snapshot of the USB devices currently attached.
pub fn enumerate_devices() -> Result<Vec<UsbDeviceInfo>> {
    let mut enumerator =
        udev::Enumerator::new().map_err(|e| udev_error("Failed to create enumerator", e))?;
    enumerator
        .match_subsystem("usb")
        .map_err(|e| udev_error("Failed to match subsystem", e))?;

    let mut devices = Vec::new();
    for device in enumerator
        .scan_devices()
        .map_err(|e| udev_error("Failed to scan devices", e))?
    {
        // Interfaces carry no idVendor; only whole devices do.
        if device.attribute_value("idVendor").is_none() {
            continue;
        }

        match build_device_info(&device) {
            Ok(info) => devices.push(info),
            Err(e) => trace!(error = %e, "Skipping device"),
        }
    }

    Ok(devices)
}

/// Forward USB add/remove events until shutdown or the receiver goes away.
pub fn monitor_blocking(
    event_tx: mpsc::Sender<HotplugEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Other(format!("Failed to create runtime: {}", e)))?;

    runtime.block_on(async {
        let socket = tokio_udev::MonitorBuilder::new()
            .map_err(|e| udev_error("Failed to create monitor", e))?
            .match_subsystem("usb")
            .map_err(|e| udev_error("Failed to filter monitor", e))?
            .listen()
            .map_err(|e| udev_error("Failed to listen", e))?;

        let mut monitor = tokio_udev::AsyncMonitorSocket::new(socket)
            .map_err(|e| udev_error("Failed to create async socket", e))?;

        debug!("USB monitor created, entering event loop");

        loop {
            tokio::select! {
                event_result = monitor.next() => {
                    let event = match event_result {
                        Some(Ok(e)) => e,
                        Some(Err(e)) => {
                            error!("Error from USB monitor: {}", e);
                            continue;
                        }
                        None => {
                            warn!("USB monitor stream ended");
                            return Ok(());
                        }
                    };

                    let device = event.device();
                    let Some(device_path) = device.syspath().to_str().map(str::to_string) else {
                        continue;
                    };

                    let hotplug = match event.event_type() {
                        tokio_udev::EventType::Add => HotplugEvent::Added { device_path },
                        tokio_udev::EventType::Remove => HotplugEvent::Removed { device_path },
                        other => {
                            trace!(event_type = ?other, "Ignoring USB event");
                            continue;
                        }
                    };

                    debug!(event = ?hotplug, "USB hotplug");
                    if event_tx.send(hotplug).await.is_err() {
                        info!("Hotplug receiver dropped, exiting USB monitor");
                        return Ok(());
                    }
                }

                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, exiting USB monitor");
                    return Ok(());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // needs udev; run with --ignored on a Linux host
    fn test_enumerate_devices() {
        let devices = enumerate_devices().unwrap();
        for device in devices {
            assert!(!device.device_path.is_empty());
        }
    }
}
