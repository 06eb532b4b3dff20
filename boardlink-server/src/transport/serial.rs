//! Serial port operations.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::tracing::prelude::*;

/// Baud rate that tells an Arduino-style CDC bootloader to take over.
pub const TOUCH_BAUD: u32 = 1200;

/// Asks the board on a port to restart into its bootloader.
#[async_trait]
pub trait PortReboot: Send + Sync {
    async fn reboot_to_bootloader(&self, port: &str) -> io::Result<()>;
}

/// The "1200 baud touch": open the port at 1200 baud, drop DTR and close it.
pub struct TouchReboot;

#[async_trait]
impl PortReboot for TouchReboot {
    async fn reboot_to_bootloader(&self, port: &str) -> io::Result<()> {
        debug!(port, "Sending 1200 baud touch");

        let mut stream = tokio_serial::new(port, TOUCH_BAUD)
            .timeout(Duration::from_millis(500))
            .open_native_async()
            .map_err(io::Error::from)?;
        stream
            .write_data_terminal_ready(false)
            .map_err(io::Error::from)?;
        drop(stream);

        Ok(())
    }
}

/// Open a port for live monitoring.
pub fn open_monitor(port: &str, baud: u32) -> io::Result<SerialStream> {
    let stream = tokio_serial::new(port, baud)
        .open_native_async()
        .map_err(io::Error::from)?;
    trace!(port, baud, "Serial port opened");
    Ok(stream)
}
