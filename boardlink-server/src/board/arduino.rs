//! Arduino-style boards programmed over serial with avrdude.
//!
//! Boards whose catalog entry names a bootloader template (the native-USB
//! ATmega32U4 family) can't be flashed on their normal port. They are
//! rebooted into the bootloader, found again under its USB identity and
//! flashed there; see [`crate::handshake`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Board, BoardDescriptor, BoardError, BoardSpec, FlashContext, PortSlot};
use crate::{
    catalog::BoardTemplate,
    protocol::ServerMessage,
    tool::Toolchain,
    tracing::prelude::*,
    transport::{Detector, UsbDeviceInfo},
};

pub struct ArduinoBoard {
    template: Arc<BoardTemplate>,
    port: PortSlot,
    tools: Arc<Toolchain>,
}

impl ArduinoBoard {
    pub fn new(template: Arc<BoardTemplate>, usb: UsbDeviceInfo, tools: Arc<Toolchain>) -> Self {
        Self {
            template,
            port: PortSlot::new(usb),
            tools,
        }
    }

    /// Arguments shared by every avrdude call; `-D` keeps it from erasing.
    fn base_args(&self, port: &str) -> Vec<String> {
        let mut args = vec![
            "-D".to_string(),
            "-p".to_string(),
            self.template.controller.clone(),
            "-c".to_string(),
            self.template.programmer.clone(),
            "-P".to_string(),
            port.to_string(),
        ];
        if let Some(config) = &self.tools.avrdude_config {
            args.push("-C".to_string());
            args.push(config.display().to_string());
        }
        args
    }

    fn flash_args(&self, port: &str, firmware: &Path) -> std::io::Result<Vec<String>> {
        let firmware = std::path::absolute(firmware)?;
        let mut args = self.base_args(port);
        args.push("-U".to_string());
        args.push(format!("flash:w:{}:a", firmware.display()));
        Ok(args)
    }

    async fn run_avrdude(&self, args: Vec<String>) -> Result<String, BoardError> {
        let output = self.tools.avrdude.run(&args, None).await?;
        if output.success {
            Ok(output.combined())
        } else {
            Err(BoardError::ToolFailed(output.combined()))
        }
    }

    fn primary_port(&self) -> Result<String, BoardError> {
        self.port.port(0).ok_or(BoardError::Disconnected)
    }
}

#[async_trait]
impl Board for ArduinoBoard {
    fn is_connected(&self) -> bool {
        self.port.is_connected()
    }

    fn current_port(&self) -> Option<String> {
        self.port.port(0)
    }

    async fn refresh(&self, detector: &dyn Detector) -> bool {
        self.port.refresh(detector).await
    }

    async fn flash(&self, firmware: &Path, ctx: FlashContext<'_>) -> Result<String, BoardError> {
        let port = self.primary_port()?;

        if let Some(bootloader) = self.template.bootloader_id {
            debug!(
                board = %self.template.name,
                port = %port,
                bootloader,
                "Flashing through bootloader"
            );
            let handshake = ctx.handshake;
            return handshake.flash_via_bootloader(&port, bootloader, firmware, ctx).await;
        }

        info!(board = %self.template.name, port = %port, "Flashing");
        self.run_avrdude(self.flash_args(&port, firmware)?).await
    }

    async fn ping(&self, _address: Option<&str>) -> Result<String, BoardError> {
        let mut args = self.base_args(&self.primary_port()?);
        args.push("-n".to_string());
        self.run_avrdude(args).await
    }

    async fn reset(&self, _address: Option<&str>) -> Result<String, BoardError> {
        let mut args = self.base_args(&self.primary_port()?);
        args.push("-r".to_string());
        self.run_avrdude(args).await
    }

    fn to_message(&self, name: &str, id: &str) -> ServerMessage {
        ServerMessage::Device {
            device_id: id.to_string(),
            name: name.to_string(),
            controller: self.template.controller.clone(),
            programmer: self.template.programmer.clone(),
            port: self.current_port().unwrap_or_default(),
            simulated: false,
        }
    }
}

fn create(spec: BoardSpec) -> Arc<dyn Board> {
    Arc::new(ArduinoBoard::new(spec.template, spec.usb, spec.tools))
}

inventory::submit! {
    BoardDescriptor {
        device_class: "arduino",
        name: "Arduino",
        create_fn: create,
    }
}
