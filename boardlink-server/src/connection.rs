//! One websocket client.
//!
//! Each connection runs three tasks. The reader decodes frames and queues
//! them for the dispatcher; the queue is bounded, and a request arriving
//! while it is full is answered with an error instead of waiting. The
//! dispatcher handles requests strictly one at a time, in arrival order.
//! The writer owns the socket's send half and interleaves responses with
//! registry notifications.

use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::{
    board::{BoardError, FlashProgress},
    connections::ConnectionId,
    context::AppContext,
    cooldown::Cooldown,
    monitor::{MonitorError, MonitorSet},
    protocol::{
        code, ClientEvent, DeviceRequest, ErrorKind, FlashStart, Outgoing, SerialConnect,
        SerialSend, ServerMessage,
    },
    registry::RegistryEvent,
    session::{BlockOutcome, FlashSession},
    tracing::prelude::*,
};

/// Responses queued for the writer.
const OUTGOING_CAPACITY: usize = 64;

/// What the reader makes of one incoming frame.
#[derive(Debug)]
enum Frame {
    Event(ClientEvent),
    Reject(ServerMessage),
    Close,
    Ignore,
}

fn decode(message: Message, max_size: usize) -> Frame {
    match message {
        Message::Text(text) if text.len() > max_size => Frame::Reject(ServerMessage::error_with(
            ErrorKind::Malformed,
            format!("message of {} bytes exceeds {} bytes", text.len(), max_size),
        )),
        Message::Text(text) => match ClientEvent::from_text(&text) {
            Ok(event) => Frame::Event(event),
            Err(e) => Frame::Reject(ServerMessage::error_with(e.kind(), e.to_string())),
        },
        Message::Binary(data) if data.len() > max_size => Frame::Reject(ServerMessage::error_with(
            ErrorKind::BlockTooLarge,
            format!("block of {} bytes exceeds {} bytes", data.len(), max_size),
        )),
        Message::Binary(data) => Frame::Event(ClientEvent::Block(data.into())),
        Message::Close(_) => Frame::Close,
        _ => Frame::Ignore,
    }
}

fn encode(item: Outgoing) -> Message {
    match item {
        Outgoing::Message(message) => Message::Text(message.to_text()),
        Outgoing::Block(data) => Message::Binary(data.to_vec()),
    }
}

/// Serve one accepted websocket until the client leaves or `shutdown` fires.
pub async fn serve<S>(ws: WebSocketStream<S>, ctx: Arc<AppContext>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ConnectionId::next();
    ctx.connections.add(id);
    info!(conn = %id, clients = ctx.connections.len(), "Client connected");

    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
    let writer = tokio::spawn(write_loop(sink, out_rx, ctx.registry.subscribe()));

    let (event_tx, event_rx) = mpsc::channel(ctx.config.max_pending.max(1));
    let dropped = CancellationToken::new();
    let handler = ConnectionHandler::new(id, ctx.clone(), out_tx.clone());
    let dispatcher = tokio::spawn(dispatch_loop(handler, event_rx, dropped.clone()));

    let max_size = ctx.config.max_msg_size;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(conn = %id, error = %e, "Websocket read failed");
                break;
            }
            None => break,
        };

        match decode(message, max_size) {
            Frame::Event(event) => match event_tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(conn = %id, "Request queue full");
                    let _ = out_tx
                        .send(ServerMessage::error(ErrorKind::TooManyPending).into())
                        .await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Frame::Reject(message) => {
                let _ = out_tx.send(message.into()).await;
            }
            Frame::Close => break,
            Frame::Ignore => {}
        }
    }

    // Queued requests are dropped; one already running finishes first.
    dropped.cancel();
    drop(event_tx);
    let _ = dispatcher.await;
    drop(out_tx);
    let _ = writer.await;

    ctx.connections.remove(id);
    info!(conn = %id, clients = ctx.connections.len(), "Client disconnected");
}

async fn dispatch_loop(
    mut handler: ConnectionHandler,
    mut events: mpsc::Receiver<ClientEvent>,
    dropped: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = dropped.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handler.handle(event).await;
    }
    handler.close().await;
}

async fn write_loop<W>(
    mut sink: W,
    mut out: mpsc::Receiver<Outgoing>,
    mut events: broadcast::Receiver<RegistryEvent>,
) where
    W: Sink<Message> + Unpin,
{
    loop {
        let item = tokio::select! {
            item = out.recv() => match item {
                Some(item) => item,
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => event.to_message().into(),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Client fell behind on device notifications");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if sink.send(encode(item)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Request handling for one connection.
pub struct ConnectionHandler {
    id: ConnectionId,
    ctx: Arc<AppContext>,
    out: mpsc::Sender<Outgoing>,
    cooldown: Cooldown,
    session: FlashSession,
    monitors: MonitorSet,
}

impl ConnectionHandler {
    pub fn new(id: ConnectionId, ctx: Arc<AppContext>, out: mpsc::Sender<Outgoing>) -> Self {
        let cooldown = Cooldown::new(ctx.config.list_cooldown(), ctx.connections.clone());
        Self {
            id,
            ctx,
            out,
            cooldown,
            session: FlashSession::new(id),
            monitors: MonitorSet::new(id),
        }
    }

    async fn send(&self, item: impl Into<Outgoing>) {
        // A closed writer means the client is gone; the reader notices too.
        let _ = self.out.send(item.into()).await;
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        trace!(conn = %self.id, ?event, "Request");
        match event {
            ClientEvent::GetList => self.get_list().await,
            ClientEvent::FlashStart(request) => self.flash_start(request).await,
            ClientEvent::Block(data) => self.block(&data).await,
            ClientEvent::GetFirmwareStart(request) => self.firmware_start(request).await,
            ClientEvent::GetFirmwareNextBlock(request) => self.firmware_next(request).await,
            ClientEvent::Ping(request) => self.ping_or_reset(request, false).await,
            ClientEvent::Reset(request) => self.ping_or_reset(request, true).await,
            ClientEvent::GetMetaData(request) => self.metadata(request).await,
            ClientEvent::SerialConnect(request) => self.serial_connect(request).await,
            ClientEvent::SerialDisconnect(request) => self.serial_disconnect(request).await,
            ClientEvent::SerialSend(request) => self.serial_send(request).await,
        }
    }

    /// Release everything this connection holds.
    pub async fn close(&mut self) {
        self.session.abort();
        self.monitors.close_all().await;
    }

    async fn get_list(&mut self) {
        if self.cooldown.is_blocked() {
            self.send(ServerMessage::error(ErrorKind::Cooldown)).await;
            return;
        }
        self.cooldown.freeze();
        self.ctx.registry.reconcile().await;
        for device in self.ctx.registry.list_all() {
            self.send(device.to_message()).await;
        }
        self.cooldown.start();
    }

    async fn flash_start(&mut self, request: FlashStart) {
        // Flashing a board this connection monitors closes the monitor first.
        if self.session.is_idle() && self.monitors.is_open(&request.device_id) {
            self.monitors.close(&request.device_id).await;
        }
        match self.session.start_flash(&self.ctx, request).await {
            Ok(()) => self.send(ServerMessage::FlashNextBlock).await,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Flash start rejected");
                self.send(e.to_message()).await;
            }
        }
    }

    async fn block(&mut self, data: &[u8]) {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<FlashProgress>();
        let out = &self.out;
        let forward = async {
            while let Some(p) = progress_rx.recv().await {
                let _ = out
                    .send(
                        ServerMessage::FlashProgress {
                            stage: p.stage,
                            current: p.current,
                            total: p.total,
                        }
                        .into(),
                    )
                    .await;
            }
        };
        let flashing = self.session.add_block(&self.ctx, data, Some(progress_tx));
        let (result, ()) = tokio::join!(flashing, forward);

        match result {
            Ok(BlockOutcome::NeedMore) => self.send(ServerMessage::FlashNextBlock).await,
            Ok(BlockOutcome::Flashed(message)) => {
                self.send(ServerMessage::FlashDone {
                    code: code::OK,
                    message,
                })
                .await
            }
            Err(e) => self.send(e.to_message()).await,
        }
    }

    async fn firmware_start(&mut self, request: DeviceRequest) {
        match self.session.start_retrieval(&self.ctx, &request).await {
            Ok(size) => {
                self.send(ServerMessage::GetFirmwareApprove {
                    device_id: request.device_id,
                    size,
                })
                .await
            }
            Err(e) => self.send(e.to_message()).await,
        }
    }

    async fn firmware_next(&mut self, request: DeviceRequest) {
        match self.session.next_block(&request.device_id) {
            Ok(block) => {
                self.send(Outgoing::Block(block.data)).await;
                if block.finished {
                    self.send(ServerMessage::GetFirmwareFinish {
                        device_id: request.device_id,
                    })
                    .await;
                }
            }
            Err(e) => self.send(e.to_message()).await,
        }
    }

    async fn ping_or_reset(&mut self, request: DeviceRequest, reset: bool) {
        let Some(device) = self.ctx.registry.get(&request.device_id) else {
            self.send(ServerMessage::error(ErrorKind::UnknownDevice)).await;
            return;
        };
        // Hold the device for the duration so nobody starts flashing it.
        let Some(_lease) = device.try_lock(self.id) else {
            self.send(ServerMessage::error(ErrorKind::DeviceLocked)).await;
            return;
        };

        let address = request.address.as_deref();
        let result = if reset {
            device.board().reset(address).await
        } else {
            device.board().ping(address).await
        };
        let (code, comment) = match result {
            Ok(output) => (code::OK, output),
            Err(BoardError::Disconnected) => (code::NO_REPLY, BoardError::Disconnected.to_string()),
            Err(BoardError::ToolFailed(output)) => (code::FAILED, output),
            Err(e) => (code::FAILED, e.to_string()),
        };
        let device_id = request.device_id;
        if reset {
            self.send(ServerMessage::ResetResult {
                device_id,
                code,
                comment,
            })
            .await;
        } else {
            self.send(ServerMessage::Pong {
                device_id,
                code,
                comment,
            })
            .await;
        }
    }

    async fn metadata(&mut self, request: DeviceRequest) {
        let Some(device) = self.ctx.registry.get(&request.device_id) else {
            self.send(ServerMessage::error(ErrorKind::UnknownDevice)).await;
            return;
        };
        let Some(_lease) = device.try_lock(self.id) else {
            self.send(ServerMessage::error(ErrorKind::DeviceLocked)).await;
            return;
        };

        match device.board().metadata(request.address.as_deref()).await {
            Ok(meta) => {
                self.send(ServerMessage::MetaData {
                    device_id: request.device_id,
                    meta,
                })
                .await
            }
            Err(e) => {
                self.send(ServerMessage::error_with(e.kind(), e.to_string()))
                    .await
            }
        }
    }

    async fn serial_connect(&mut self, request: SerialConnect) {
        let Some(device) = self.ctx.registry.get(&request.device_id) else {
            self.send(ServerMessage::error(ErrorKind::UnknownDevice)).await;
            return;
        };
        let opened = self.monitors.open(
            device,
            request.baud,
            self.out.clone(),
            self.ctx.registry.subscribe(),
        );
        let status = match opened {
            Ok(()) => ServerMessage::SerialStatus {
                device_id: request.device_id,
                code: code::SERIAL_OPENED,
                comment: "Serial connection opened".to_string(),
            },
            Err(e) => {
                debug!(conn = %self.id, device = %request.device_id, error = %e, "Serial connect failed");
                e.to_status(&request.device_id)
            }
        };
        self.send(status).await;
    }

    async fn serial_disconnect(&mut self, request: DeviceRequest) {
        // The monitor reports its own closing.
        if !self.monitors.close(&request.device_id).await {
            self.send(MonitorError::NotOpen.to_status(&request.device_id))
                .await;
        }
    }

    async fn serial_send(&mut self, request: SerialSend) {
        if let Err(e) = self.monitors.send(&request.device_id, request.msg).await {
            self.send(e.to_status(&request.device_id)).await;
        }
    }
}
