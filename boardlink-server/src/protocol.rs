//! Websocket message protocol.
//!
//! Text frames carry a JSON envelope `{"type": ..., "payload": ...}`; binary
//! frames carry raw firmware blocks. Errors travel as envelopes whose `type`
//! is the error kind and whose payload is an optional human-readable comment.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Result codes carried in `flash-done`, `pong`, `reset-result` and
/// `serial-connection-status`.
pub mod code {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const NO_REPLY: i32 = 2;
    pub const SERIAL_OPENED: i32 = 3;
    pub const SERIAL_CLOSED: i32 = 4;
    pub const SERIAL_READ_ERROR: i32 = 5;
    pub const SERIAL_BUSY: i32 = 6;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Machine-readable error kinds reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    EventNotSupported,
    FlashNotFinished,
    FlashNotStarted,
    UnknownDevice,
    DeviceDisconnected,
    DeviceLocked,
    BlockTooLarge,
    FileTooLarge,
    ToolFailed,
    Malformed,
    Cooldown,
    TooManyPending,
    BootloaderAmbiguous,
    BootloaderNotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::EventNotSupported => "event-not-supported",
            ErrorKind::FlashNotFinished => "flash-not-finish",
            ErrorKind::FlashNotStarted => "flash-not-started",
            ErrorKind::UnknownDevice => "flash-wrong-id",
            ErrorKind::DeviceDisconnected => "flash-disconnected",
            ErrorKind::DeviceLocked => "flash-blocked",
            ErrorKind::BlockTooLarge => "flash-large-block",
            ErrorKind::FileTooLarge => "flash-large-file",
            ErrorKind::ToolFailed => "flash-avrdude-error",
            ErrorKind::Malformed => "unmarshal-err",
            ErrorKind::Cooldown => "get-list-cooldown",
            ErrorKind::TooManyPending => "too-many-messages",
            ErrorKind::BootloaderAmbiguous => "bootloader-ambiguous",
            ErrorKind::BootloaderNotFound => "bootloader-not-found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [ErrorKind; 14] = [
            ErrorKind::EventNotSupported,
            ErrorKind::FlashNotFinished,
            ErrorKind::FlashNotStarted,
            ErrorKind::UnknownDevice,
            ErrorKind::DeviceDisconnected,
            ErrorKind::DeviceLocked,
            ErrorKind::BlockTooLarge,
            ErrorKind::FileTooLarge,
            ErrorKind::ToolFailed,
            ErrorKind::Malformed,
            ErrorKind::Cooldown,
            ErrorKind::TooManyPending,
            ErrorKind::BootloaderAmbiguous,
            ErrorKind::BootloaderNotFound,
        ];
        ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported event type '{0}'")]
    Unsupported(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Unsupported(_) => ErrorKind::EventNotSupported,
            ProtocolError::Malformed(_) => ErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashStart {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub file_size: usize,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub verify: bool,
}

/// Payload naming a device, optionally one address on a multi-port board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConnect {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub baud: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSend {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub msg: String,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    GetList,
    FlashStart(FlashStart),
    /// Raw firmware block for the upload in progress.
    Block(Bytes),
    GetFirmwareStart(DeviceRequest),
    GetFirmwareNextBlock(DeviceRequest),
    Ping(DeviceRequest),
    Reset(DeviceRequest),
    GetMetaData(DeviceRequest),
    SerialConnect(SerialConnect),
    SerialDisconnect(DeviceRequest),
    SerialSend(SerialSend),
}

impl ClientEvent {
    /// Decode a text frame.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
        }

        let event = match envelope.kind.as_str() {
            "get-list" => ClientEvent::GetList,
            "flash-start" => ClientEvent::FlashStart(payload(envelope.payload)?),
            "get-firmware-start" => ClientEvent::GetFirmwareStart(payload(envelope.payload)?),
            "get-firmware-next-block" => {
                ClientEvent::GetFirmwareNextBlock(payload(envelope.payload)?)
            }
            "ping" => ClientEvent::Ping(payload(envelope.payload)?),
            "reset" => ClientEvent::Reset(payload(envelope.payload)?),
            "get-meta-data" => ClientEvent::GetMetaData(payload(envelope.payload)?),
            "serial-connect" => ClientEvent::SerialConnect(payload(envelope.payload)?),
            "serial-disconnect" => ClientEvent::SerialDisconnect(payload(envelope.payload)?),
            "serial-send" => ClientEvent::SerialSend(payload(envelope.payload)?),
            other => return Err(ProtocolError::Unsupported(other.to_string())),
        };
        Ok(event)
    }

    /// Encode as a text frame. Blocks have no text form.
    pub fn to_envelope(&self) -> Option<Envelope> {
        let (kind, payload) = match self {
            ClientEvent::GetList => ("get-list", Value::Null),
            ClientEvent::FlashStart(p) => ("flash-start", json!(p)),
            ClientEvent::Block(_) => return None,
            ClientEvent::GetFirmwareStart(p) => ("get-firmware-start", json!(p)),
            ClientEvent::GetFirmwareNextBlock(p) => ("get-firmware-next-block", json!(p)),
            ClientEvent::Ping(p) => ("ping", json!(p)),
            ClientEvent::Reset(p) => ("reset", json!(p)),
            ClientEvent::GetMetaData(p) => ("get-meta-data", json!(p)),
            ClientEvent::SerialConnect(p) => ("serial-connect", json!(p)),
            ClientEvent::SerialDisconnect(p) => ("serial-disconnect", json!(p)),
            ClientEvent::SerialSend(p) => ("serial-send", json!(p)),
        };
        Some(Envelope::new(kind, payload))
    }
}

/// Messages the server sends.
///
/// Serializes to the `{"type": ..., "payload": ...}` envelope. Metadata and
/// errors have irregular payloads and are built by hand in `to_envelope`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    Device {
        #[serde(rename = "deviceID")]
        device_id: String,
        name: String,
        controller: String,
        programmer: String,
        #[serde(rename = "portName")]
        port: String,
        simulated: bool,
    },
    MsDevice {
        #[serde(rename = "deviceID")]
        device_id: String,
        name: String,
        #[serde(rename = "portNames")]
        ports: Vec<String>,
        address: Option<String>,
        simulated: bool,
    },
    DeviceUpdatePort {
        #[serde(rename = "deviceID")]
        device_id: String,
        #[serde(rename = "portNames")]
        ports: Vec<String>,
    },
    DeviceUpdateDelete {
        #[serde(rename = "deviceID")]
        device_id: String,
    },
    FlashNextBlock,
    FlashDone {
        code: i32,
        #[serde(rename = "avrdudeMsg")]
        message: String,
    },
    #[serde(rename = "flash-backtrack-ms")]
    FlashProgress {
        #[serde(rename = "uploadStage")]
        stage: String,
        #[serde(rename = "curPack")]
        current: u64,
        #[serde(rename = "totalPacks")]
        total: u64,
    },
    GetFirmwareApprove {
        #[serde(rename = "deviceID")]
        device_id: String,
        size: usize,
    },
    GetFirmwareFinish {
        #[serde(rename = "deviceID")]
        device_id: String,
    },
    Pong {
        #[serde(rename = "deviceID")]
        device_id: String,
        code: i32,
        comment: String,
    },
    ResetResult {
        #[serde(rename = "deviceID")]
        device_id: String,
        code: i32,
        comment: String,
    },
    #[serde(skip_serializing)]
    MetaData {
        device_id: String,
        meta: Value,
    },
    #[serde(rename = "serial-device-read")]
    SerialRead {
        #[serde(rename = "deviceID")]
        device_id: String,
        msg: String,
    },
    #[serde(rename = "serial-connection-status")]
    SerialStatus {
        #[serde(rename = "deviceID")]
        device_id: String,
        code: i32,
        comment: String,
    },
    #[serde(skip_serializing)]
    Error {
        kind: ErrorKind,
        comment: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind) -> Self {
        ServerMessage::Error {
            kind,
            comment: None,
        }
    }

    pub fn error_with(kind: ErrorKind, comment: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            comment: Some(comment.into()),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            ServerMessage::MetaData { device_id, meta } => {
                let mut payload = match meta {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("meta".to_string(), other.clone());
                        map
                    }
                };
                payload.insert("deviceID".to_string(), json!(device_id));
                Envelope::new("meta-data", Value::Object(payload))
            }
            ServerMessage::Error { kind, comment } => Envelope::new(
                kind.as_str(),
                comment.as_ref().map_or(Value::Null, |c| json!(c)),
            ),
            other => serde_json::to_value(other)
                .and_then(serde_json::from_value)
                .unwrap_or_else(|e| {
                    Envelope::new(ErrorKind::Malformed.as_str(), json!(e.to_string()))
                }),
        }
    }

    pub fn to_text(&self) -> String {
        // Envelopes hold only strings, numbers and JSON values, which always
        // serialize.
        serde_json::to_string(&self.to_envelope()).unwrap_or_default()
    }
}

/// Item queued for a connection's websocket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(ServerMessage),
    Block(Bytes),
}

impl From<ServerMessage> for Outgoing {
    fn from(message: ServerMessage) -> Self {
        Outgoing::Message(message)
    }
}
