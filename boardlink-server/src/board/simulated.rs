//! Boards that exist only in software.
//!
//! Configured by count at startup. They never touch hardware: operations
//! sleep for the configured flash duration and report success, which makes
//! the server usable for client development and deterministic tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Board, BoardError, FlashContext, FlashProgress};
use crate::{
    catalog::{BoardTemplate, TemplateId},
    protocol::ServerMessage,
    tracing::prelude::*,
    transport::Detector,
};

/// Template ids outside anything a catalog file uses.
pub const SIMULATED_TEMPLATE_ID: TemplateId = usize::MAX;
pub const SIMULATED_MS1_TEMPLATE_ID: TemplateId = usize::MAX - 1;

const SIMULATED_FIRMWARE_LEN: usize = 3000;

pub fn simulated_template() -> BoardTemplate {
    BoardTemplate {
        id: SIMULATED_TEMPLATE_ID,
        name: "Simulated board".to_string(),
        vendor_ids: Vec::new(),
        product_ids: Vec::new(),
        controller: "simulated".to_string(),
        programmer: "simulated".to_string(),
        bootloader_id: None,
        device_class: "simulated".to_string(),
    }
}

pub fn simulated_ms1_template() -> BoardTemplate {
    BoardTemplate {
        id: SIMULATED_MS1_TEMPLATE_ID,
        name: "Simulated MS1".to_string(),
        vendor_ids: Vec::new(),
        product_ids: Vec::new(),
        controller: "simulated".to_string(),
        programmer: "simulated".to_string(),
        bootloader_id: None,
        device_class: "simulated-ms1".to_string(),
    }
}

/// Single-port simulated board.
pub struct SimulatedBoard {
    port: String,
    delay: Duration,
}

impl SimulatedBoard {
    pub fn new(index: usize, delay: Duration) -> Self {
        Self {
            port: format!("fakecom-{}", index),
            delay,
        }
    }

    pub fn device_id(index: usize) -> String {
        format!("fakeid-{}", index)
    }
}

#[async_trait]
impl Board for SimulatedBoard {
    fn is_connected(&self) -> bool {
        true
    }

    fn current_port(&self) -> Option<String> {
        Some(self.port.clone())
    }

    async fn refresh(&self, _detector: &dyn Detector) -> bool {
        false
    }

    async fn flash(&self, firmware: &Path, _ctx: FlashContext<'_>) -> Result<String, BoardError> {
        tokio::time::sleep(self.delay).await;
        debug!(port = %self.port, firmware = %firmware.display(), "Simulated flash complete");
        Ok("Simulated flashing is completed".to_string())
    }

    async fn ping(&self, _address: Option<&str>) -> Result<String, BoardError> {
        Ok(String::new())
    }

    async fn reset(&self, _address: Option<&str>) -> Result<String, BoardError> {
        Ok(String::new())
    }

    fn to_message(&self, name: &str, id: &str) -> ServerMessage {
        ServerMessage::Device {
            device_id: id.to_string(),
            name: name.to_string(),
            controller: "simulated".to_string(),
            programmer: "simulated".to_string(),
            port: self.port.clone(),
            simulated: true,
        }
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// Four-port simulated board with a fixed module address.
pub struct SimulatedMs1 {
    ports: Vec<String>,
    address: String,
    delay: Duration,
}

impl SimulatedMs1 {
    pub fn new(index: usize, delay: Duration) -> Self {
        Self {
            ports: (0..4).map(|p| format!("fms-{}-{}", index, p)).collect(),
            address: format!("{:016}", index),
            delay,
        }
    }

    pub fn device_id(index: usize) -> String {
        format!("fakems-{}", index)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn check_address(&self, address: Option<&str>) -> Result<(), BoardError> {
        if address == Some(self.address.as_str()) {
            Ok(())
        } else {
            Err(BoardError::ToolFailed(format!(
                "Address doesn't match (expected {}, got {})",
                self.address,
                address.unwrap_or("none")
            )))
        }
    }
}

#[async_trait]
impl Board for SimulatedMs1 {
    fn is_connected(&self) -> bool {
        true
    }

    fn current_port(&self) -> Option<String> {
        self.ports.get(3).cloned()
    }

    async fn refresh(&self, _detector: &dyn Detector) -> bool {
        false
    }

    async fn flash(&self, _firmware: &Path, ctx: FlashContext<'_>) -> Result<String, BoardError> {
        self.check_address(ctx.address.as_deref())?;

        const STAGES: [&str; 3] = ["PREPARE_FIRMWARE", "PUSH_FIRMWARE", "CHANGE_MODE_TO_RUN"];
        let step = self.delay / STAGES.len() as u32;
        for (i, stage) in STAGES.iter().enumerate() {
            tokio::time::sleep(step).await;
            if let Some(tx) = &ctx.progress {
                let _ = tx.send(FlashProgress {
                    stage: stage.to_string(),
                    current: i as u64 + 1,
                    total: STAGES.len() as u64,
                });
            }
        }
        Ok("Simulated flashing is completed".to_string())
    }

    async fn ping(&self, address: Option<&str>) -> Result<String, BoardError> {
        self.check_address(address)?;
        Ok(String::new())
    }

    async fn reset(&self, address: Option<&str>) -> Result<String, BoardError> {
        self.check_address(address)?;
        Ok(String::new())
    }

    async fn metadata(&self, _address: Option<&str>) -> Result<serde_json::Value, BoardError> {
        Ok(serde_json::json!({
            "RefBlHw": "simulated",
            "RefBlFw": "simulated",
            "address": self.address,
        }))
    }

    async fn read_firmware(&self, address: Option<&str>) -> Result<Bytes, BoardError> {
        self.check_address(address)?;
        tokio::time::sleep(self.delay).await;
        Ok(simulated_firmware())
    }

    fn to_message(&self, name: &str, id: &str) -> ServerMessage {
        ServerMessage::MsDevice {
            device_id: id.to_string(),
            name: name.to_string(),
            ports: self.ports.clone(),
            address: Some(self.address.clone()),
            simulated: true,
        }
    }

    fn message_kind(&self) -> &'static str {
        "ms-device"
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn ports(&self) -> Vec<String> {
        self.ports.clone()
    }
}

/// The image every simulated MS1 reports as its current firmware.
pub fn simulated_firmware() -> Bytes {
    (0..SIMULATED_FIRMWARE_LEN)
        .map(|i| (i % 251) as u8)
        .collect::<Vec<_>>()
        .into()
}

/// Build the configured simulated devices as `(id, template, board)`.
pub fn simulated_devices(
    boards: usize,
    ms1: usize,
    delay: Duration,
) -> Vec<(String, Arc<BoardTemplate>, Arc<dyn Board>)> {
    let board_template = Arc::new(simulated_template());
    let ms1_template = Arc::new(simulated_ms1_template());

    let mut devices: Vec<(String, Arc<BoardTemplate>, Arc<dyn Board>)> = Vec::new();
    for i in 0..boards {
        devices.push((
            SimulatedBoard::device_id(i),
            board_template.clone(),
            Arc::new(SimulatedBoard::new(i, delay)),
        ));
    }
    for i in 0..ms1 {
        devices.push((
            SimulatedMs1::device_id(i),
            ms1_template.clone(),
            Arc::new(SimulatedMs1::new(i, delay)),
        ));
    }
    devices
}
