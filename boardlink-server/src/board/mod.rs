pub(crate) mod arduino;
pub(crate) mod ms1;
pub mod simulated;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    catalog::BoardTemplate,
    handshake::BootloaderHandshake,
    protocol::{ErrorKind, ServerMessage},
    registry::DeviceRegistry,
    tool::Toolchain,
    transport::{Detector, UsbDeviceInfo},
};

/// Progress report from a board that streams it while flashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashProgress {
    pub stage: String,
    pub current: u64,
    pub total: u64,
}

/// What a flash needs beyond the image itself.
pub struct FlashContext<'a> {
    /// Registry used to re-acquire a board that changes identity mid-flash.
    pub registry: &'a DeviceRegistry,
    pub handshake: &'a BootloaderHandshake,
    pub progress: Option<mpsc::UnboundedSender<FlashProgress>>,
    /// Target address on a multi-port board.
    pub address: Option<String>,
    /// Read the image back after writing.
    pub verify: bool,
}

/// A programmable target.
///
/// Implementations keep their port information behind interior mutability,
/// so a board can be shared between the registry and the session flashing
/// it.
#[async_trait]
pub trait Board: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Port clients see for this board.
    fn current_port(&self) -> Option<String>;

    /// Re-resolve the board's port. Returns whether it changed.
    async fn refresh(&self, detector: &dyn Detector) -> bool;

    /// Program `firmware` into the board. Returns the tool's output.
    async fn flash(&self, firmware: &Path, ctx: FlashContext<'_>) -> Result<String, BoardError>;

    async fn ping(&self, address: Option<&str>) -> Result<String, BoardError>;

    async fn reset(&self, address: Option<&str>) -> Result<String, BoardError>;

    async fn metadata(&self, _address: Option<&str>) -> Result<serde_json::Value, BoardError> {
        Err(BoardError::Unsupported("metadata"))
    }

    /// Read the firmware currently on the board.
    async fn read_firmware(&self, _address: Option<&str>) -> Result<Bytes, BoardError> {
        Err(BoardError::Unsupported("firmware retrieval"))
    }

    fn to_message(&self, name: &str, id: &str) -> ServerMessage;

    /// Wire type of the message `to_message` builds.
    fn message_kind(&self) -> &'static str {
        "device"
    }

    fn is_simulated(&self) -> bool {
        false
    }

    fn ports(&self) -> Vec<String> {
        self.current_port().into_iter().collect()
    }
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("board is not connected")]
    Disconnected,

    #[error("{0}")]
    ToolFailed(String),

    #[error("failed to run external tool: {0}")]
    Io(#[from] std::io::Error),

    #[error("reboot into bootloader failed: {0}")]
    Reboot(std::io::Error),

    #[error("more than one board appeared in bootloader mode")]
    BootloaderAmbiguous,

    #[error("board did not appear in bootloader mode")]
    BootloaderNotFound,

    #[error("{0} is not supported by this board")]
    Unsupported(&'static str),

    #[error("unexpected helper output: {0}")]
    InvalidResponse(String),
}

impl BoardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BoardError::Disconnected | BoardError::Reboot(_) => ErrorKind::DeviceDisconnected,
            BoardError::BootloaderAmbiguous => ErrorKind::BootloaderAmbiguous,
            BoardError::BootloaderNotFound => ErrorKind::BootloaderNotFound,
            BoardError::ToolFailed(_)
            | BoardError::Io(_)
            | BoardError::Unsupported(_)
            | BoardError::InvalidResponse(_) => ErrorKind::ToolFailed,
        }
    }
}

/// Port bookkeeping shared by the hardware boards.
pub(crate) struct PortSlot {
    usb: Mutex<UsbDeviceInfo>,
}

impl PortSlot {
    pub fn new(usb: UsbDeviceInfo) -> Self {
        Self {
            usb: Mutex::new(usb),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsbDeviceInfo> {
        self.usb.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn ports(&self) -> Vec<String> {
        self.lock().serial_ports.clone()
    }

    pub fn port(&self, index: usize) -> Option<String> {
        self.lock().serial_ports.get(index).cloned()
    }

    pub fn is_connected(&self) -> bool {
        !self.lock().serial_ports.is_empty()
    }

    /// Ask the detector for the current ports; an absent device ends up
    /// with none.
    pub async fn refresh(&self, detector: &dyn Detector) -> bool {
        let snapshot = self.lock().clone();
        let fresh = detector.refresh_port(&snapshot).await.unwrap_or_default();

        let mut usb = self.lock();
        let changed = usb.serial_ports != fresh;
        usb.serial_ports = fresh;
        changed
    }
}

/// Everything a board factory gets to build a board.
pub struct BoardSpec {
    pub template: Arc<BoardTemplate>,
    pub usb: UsbDeviceInfo,
    pub tools: Arc<Toolchain>,
}

/// Type alias for board factory function
pub type BoardFactoryFn = fn(BoardSpec) -> Arc<dyn Board>;

/// Board family registered with inventory.
///
/// Catalog entries name their family through `deviceClass`; the registry
/// builds boards with the factory whose `device_class` matches.
pub struct BoardDescriptor {
    pub device_class: &'static str,
    /// Human-readable family name
    pub name: &'static str,
    pub create_fn: BoardFactoryFn,
}

inventory::collect!(BoardDescriptor);

pub fn find_descriptor(device_class: &str) -> Option<&'static BoardDescriptor> {
    inventory::iter::<BoardDescriptor>().find(|desc| desc.device_class == device_class)
}

/// Build a board for a detected device, if its family is registered.
pub fn create_board(spec: BoardSpec) -> Option<Arc<dyn Board>> {
    let desc = find_descriptor(&spec.template.device_class)?;
    Some((desc.create_fn)(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_classes_are_registered() {
        let catalog = crate::catalog::Catalog::builtin().unwrap();
        for template in catalog.templates() {
            assert!(
                find_descriptor(&template.device_class).is_some(),
                "no board family for class '{}'",
                template.device_class
            );
        }
        assert!(find_descriptor("toaster").is_none());
    }
}
