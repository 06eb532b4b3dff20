//! Live serial monitors.
//!
//! A connection may attach to the serial port of any board that isn't
//! being flashed. Received lines are pushed to the client as they arrive
//! and text from the client is written to the port. Only one connection
//! monitors a given device at a time.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    connections::ConnectionId,
    protocol::{code, Outgoing, ServerMessage},
    registry::{Device, RegistryEvent},
    tracing::prelude::*,
    transport::serial::open_monitor,
};

/// Writes queued for one port.
const INPUT_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("device is busy")]
    Busy,

    #[error("serial connection is not open")]
    NotOpen,

    #[error("device has no serial port")]
    NoPort,

    #[error("failed to open serial port: {0}")]
    Open(#[from] io::Error),
}

impl MonitorError {
    /// Status message reporting this failure to the client.
    pub fn to_status(&self, device_id: &str) -> ServerMessage {
        let code = match self {
            MonitorError::Busy => code::SERIAL_BUSY,
            MonitorError::NotOpen => code::SERIAL_CLOSED,
            MonitorError::NoPort | MonitorError::Open(_) => code::FAILED,
        };
        ServerMessage::SerialStatus {
            device_id: device_id.to_string(),
            code,
            comment: self.to_string(),
        }
    }
}

struct Monitor {
    input: mpsc::Sender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The monitors one connection has open, by device id.
pub struct MonitorSet {
    conn: ConnectionId,
    monitors: HashMap<String, Monitor>,
}

impl MonitorSet {
    pub fn new(conn: ConnectionId) -> Self {
        Self {
            conn,
            monitors: HashMap::new(),
        }
    }

    pub fn is_open(&self, device_id: &str) -> bool {
        self.monitors
            .get(device_id)
            .is_some_and(|m| !m.task.is_finished())
    }

    /// Open `device`'s port at `baud` and start relaying.
    pub fn open(
        &mut self,
        device: Arc<Device>,
        baud: u32,
        out: mpsc::Sender<Outgoing>,
        events: broadcast::Receiver<RegistryEvent>,
    ) -> Result<(), MonitorError> {
        self.claim(&device)?;

        let opened = device
            .board()
            .current_port()
            .ok_or(MonitorError::NoPort)
            .and_then(|port| open_monitor(&port, baud).map_err(MonitorError::from));
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                device.release_monitor(self.conn);
                return Err(e);
            }
        };

        info!(conn = %self.conn, device = %device.id(), baud, "Serial monitor opened");
        self.spawn(device, stream, out, events);
        Ok(())
    }

    /// Queue `msg` for the device's port.
    pub async fn send(&self, device_id: &str, msg: String) -> Result<(), MonitorError> {
        let monitor = self.monitors.get(device_id).ok_or(MonitorError::NotOpen)?;
        monitor
            .input
            .send(msg)
            .await
            .map_err(|_| MonitorError::NotOpen)
    }

    /// Stop relaying and wait until the port is closed.
    ///
    /// Returns `false` if no monitor was open.
    pub async fn close(&mut self, device_id: &str) -> bool {
        let Some(monitor) = self.monitors.remove(device_id) else {
            return false;
        };
        monitor.cancel.cancel();
        let _ = monitor.task.await;
        true
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<String> = self.monitors.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    fn claim(&mut self, device: &Arc<Device>) -> Result<(), MonitorError> {
        // Forget monitors whose task ended on its own.
        self.monitors.retain(|_, m| !m.task.is_finished());

        if self.monitors.contains_key(device.id()) || !device.try_monitor(self.conn) {
            return Err(MonitorError::Busy);
        }
        Ok(())
    }

    fn spawn<S>(
        &mut self,
        device: Arc<Device>,
        stream: S,
        out: mpsc::Sender<Outgoing>,
        events: broadcast::Receiver<RegistryEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (input, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let cancel = CancellationToken::new();
        let id = device.id().to_string();

        let relay = Relay {
            conn: self.conn,
            device,
            out,
            events,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(relay.run(stream, input_rx));

        self.monitors.insert(
            id,
            Monitor {
                input,
                cancel,
                task,
            },
        );
    }
}

struct Relay {
    conn: ConnectionId,
    device: Arc<Device>,
    out: mpsc::Sender<Outgoing>,
    events: broadcast::Receiver<RegistryEvent>,
    cancel: CancellationToken,
}

impl Relay {
    async fn run<S>(mut self, stream: S, mut input: mpsc::Receiver<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let device_id = self.device.id().to_string();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        let (code, comment) = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break (code::SERIAL_CLOSED, "Serial connection closed".to_string());
                }
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break (code::SERIAL_CLOSED, "Serial port closed".to_string()),
                    Ok(_) => {
                        // Line noise is passed on rather than treated as an error.
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\r', '\n']);
                        if !line.is_empty() {
                            let msg = line.to_string();
                            self.forward(ServerMessage::SerialRead {
                                device_id: device_id.clone(),
                                msg,
                            })
                            .await;
                        }
                        buf.clear();
                    }
                    Err(e) => break (code::SERIAL_READ_ERROR, e.to_string()),
                },
                msg = input.recv() => {
                    let Some(msg) = msg else {
                        break (code::SERIAL_CLOSED, "Serial connection closed".to_string());
                    };
                    let written = async {
                        writer.write_all(msg.as_bytes()).await?;
                        writer.flush().await
                    };
                    if let Err(e) = written.await {
                        break (code::FAILED, e.to_string());
                    }
                }
                event = self.events.recv() => match event {
                    Ok(RegistryEvent::Removed { id, .. }) if id == device_id => {
                        break (code::SERIAL_CLOSED, "Device removed".to_string());
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break (code::SERIAL_CLOSED, "Serial connection closed".to_string());
                    }
                    _ => {}
                },
            }
        };

        self.device.release_monitor(self.conn);
        debug!(conn = %self.conn, device = %device_id, %comment, "Serial monitor closed");
        self.forward(ServerMessage::SerialStatus {
            device_id,
            code,
            comment,
        })
        .await;
    }

    async fn forward(&self, message: ServerMessage) {
        // The connection may already be gone; nothing left to tell.
        let _ = self.out.send(message.into()).await;
    }
}
