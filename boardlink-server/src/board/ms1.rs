//! Multi-port boards driven through an external helper.
//!
//! An MS1 exposes four serial ports. The helper talks to the first one;
//! clients see the fourth, which carries the board's own serial output.
//! Several modules can sit behind one USB device, each selected by a 16
//! hex digit address.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Board, BoardDescriptor, BoardError, BoardSpec, FlashContext, FlashProgress, PortSlot};
use crate::{
    catalog::BoardTemplate,
    protocol::ServerMessage,
    tool::Toolchain,
    tracing::prelude::*,
    transport::{Detector, UsbDeviceInfo},
};

const HELPER_PORT: usize = 0;
const CLIENT_PORT: usize = 3;

/// Parse a helper progress line of the form `STAGE current/total`.
pub fn parse_progress(line: &str) -> Option<FlashProgress> {
    let (stage, counts) = line.trim().split_once(' ')?;
    let (current, total) = counts.trim().split_once('/')?;
    if stage.is_empty() || !stage.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        return None;
    }
    Some(FlashProgress {
        stage: stage.to_string(),
        current: current.parse().ok()?,
        total: total.parse().ok()?,
    })
}

pub struct Ms1Board {
    template: Arc<BoardTemplate>,
    port: PortSlot,
    tools: Arc<Toolchain>,
}

impl Ms1Board {
    pub fn new(template: Arc<BoardTemplate>, usb: UsbDeviceInfo, tools: Arc<Toolchain>) -> Self {
        Self {
            template,
            port: PortSlot::new(usb),
            tools,
        }
    }

    fn args(&self, command: &str, address: Option<&str>) -> Result<Vec<String>, BoardError> {
        let port = self.port.port(HELPER_PORT).ok_or(BoardError::Disconnected)?;
        let mut args = vec![command.to_string(), "--port".to_string(), port];
        if let Some(address) = address {
            args.push("--address".to_string());
            args.push(address.to_string());
        }
        Ok(args)
    }

    async fn run_helper(
        &self,
        args: Vec<String>,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String, BoardError> {
        let output = self.tools.ms1.run(&args, lines).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(BoardError::ToolFailed(output.combined()))
        }
    }
}

#[async_trait]
impl Board for Ms1Board {
    fn is_connected(&self) -> bool {
        self.port.is_connected()
    }

    fn current_port(&self) -> Option<String> {
        self.port.port(CLIENT_PORT)
    }

    async fn refresh(&self, detector: &dyn Detector) -> bool {
        self.port.refresh(detector).await
    }

    async fn flash(&self, firmware: &Path, ctx: FlashContext<'_>) -> Result<String, BoardError> {
        let mut args = self.args("flash", ctx.address.as_deref())?;
        if ctx.verify {
            args.push("--verify".to_string());
        }
        args.push(std::path::absolute(firmware)?.display().to_string());

        info!(board = %self.template.name, address = ?ctx.address, "Flashing");

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let progress = ctx.progress;
        let forward = async move {
            while let Some(line) = line_rx.recv().await {
                match (parse_progress(&line), &progress) {
                    (Some(p), Some(tx)) => {
                        let _ = tx.send(p);
                    }
                    _ => trace!(line = %line, "Helper output"),
                }
            }
        };

        let (result, ()) = tokio::join!(self.run_helper(args, Some(line_tx)), forward);
        result
    }

    async fn ping(&self, address: Option<&str>) -> Result<String, BoardError> {
        self.run_helper(self.args("ping", address)?, None).await
    }

    async fn reset(&self, address: Option<&str>) -> Result<String, BoardError> {
        self.run_helper(self.args("reset", address)?, None).await
    }

    async fn metadata(&self, address: Option<&str>) -> Result<serde_json::Value, BoardError> {
        let stdout = self.run_helper(self.args("meta", address)?, None).await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| BoardError::InvalidResponse(format!("metadata: {}", e)))
    }

    async fn read_firmware(&self, address: Option<&str>) -> Result<Bytes, BoardError> {
        let out = tempfile::Builder::new()
            .prefix("ms1-firmware-")
            .suffix(".bin")
            .tempfile()?;

        let mut args = self.args("get-firmware", address)?;
        args.push("--out".to_string());
        args.push(out.path().display().to_string());
        self.run_helper(args, None).await?;

        let bytes = tokio::fs::read(out.path()).await?;
        Ok(Bytes::from(bytes))
    }

    fn to_message(&self, name: &str, id: &str) -> ServerMessage {
        ServerMessage::MsDevice {
            device_id: id.to_string(),
            name: name.to_string(),
            ports: self.port.ports(),
            address: None,
            simulated: false,
        }
    }

    fn message_kind(&self) -> &'static str {
        "ms-device"
    }

    fn ports(&self) -> Vec<String> {
        self.port.ports()
    }
}

fn create(spec: BoardSpec) -> Arc<dyn Board> {
    Arc::new(Ms1Board::new(spec.template, spec.usb, spec.tools))
}

inventory::submit! {
    BoardDescriptor {
        device_class: "ms1",
        name: "MS1",
        create_fn: create,
    }
}
