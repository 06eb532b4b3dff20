//! Per-connection firmware transfers.
//!
//! A [`FlashSession`] belongs to exactly one connection and moves through
//! `Idle -> Locking -> Transferring -> Flashing -> Idle` for uploads, or
//! `Idle -> Locking -> Serving -> Idle` when the client retrieves the
//! firmware currently on a board. The device lease and the transfer buffer
//! live inside the active phase, so leaving a phase (by finishing, by an
//! error, or by dropping the session along with its connection) releases
//! both.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    board::{BoardError, FlashContext, FlashProgress},
    connections::ConnectionId,
    context::AppContext,
    protocol::{DeviceRequest, ErrorKind, FlashStart, ServerMessage},
    registry::Lease,
    tracing::prelude::*,
    transfer::{InboundTransfer, OutboundTransfer, TransferError},
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a transfer is already in progress on this connection")]
    AlreadyActive,

    #[error("no transfer in progress")]
    NotStarted,

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("device is locked by another connection")]
    Locked,

    #[error("device disconnected")]
    Disconnected,

    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: usize, max: usize },

    #[error("empty firmware image")]
    EmptyImage,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Board(#[from] BoardError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::AlreadyActive => ErrorKind::FlashNotFinished,
            SessionError::NotStarted => ErrorKind::FlashNotStarted,
            SessionError::UnknownDevice(_) => ErrorKind::UnknownDevice,
            SessionError::Locked => ErrorKind::DeviceLocked,
            SessionError::Disconnected => ErrorKind::DeviceDisconnected,
            SessionError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            SessionError::EmptyImage => ErrorKind::Malformed,
            SessionError::Transfer(TransferError::BlockTooLarge { .. }) => ErrorKind::BlockTooLarge,
            SessionError::Transfer(TransferError::NotStarted) => ErrorKind::FlashNotStarted,
            SessionError::Transfer(TransferError::Io(_)) => ErrorKind::ToolFailed,
            SessionError::Board(e) => e.kind(),
        }
    }

    /// Error envelope for the client. Tool failures carry the tool output.
    pub fn to_message(&self) -> ServerMessage {
        match self {
            SessionError::Board(BoardError::ToolFailed(output)) => {
                ServerMessage::error_with(self.kind(), output.clone())
            }
            SessionError::FileTooLarge { .. }
            | SessionError::Transfer(_)
            | SessionError::Board(_) => ServerMessage::error_with(self.kind(), self.to_string()),
            _ => ServerMessage::error(self.kind()),
        }
    }
}

/// What the client should hear after a block.
#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    /// Send the next block.
    NeedMore,
    /// The image was flashed; carries the tool output.
    Flashed(String),
}

/// Next piece of an outbound transfer.
#[derive(Debug)]
pub struct ServedBlock {
    pub data: Bytes,
    pub finished: bool,
}

enum Phase {
    Idle,
    Receiving {
        lease: Lease,
        transfer: InboundTransfer,
        request: FlashStart,
    },
    Serving {
        lease: Lease,
        transfer: OutboundTransfer,
    },
}

pub struct FlashSession {
    conn: ConnectionId,
    phase: Phase,
}

impl FlashSession {
    pub fn new(conn: ConnectionId) -> Self {
        Self {
            conn,
            phase: Phase::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// Device of the transfer in progress, if any.
    pub fn device_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Receiving { lease, .. } | Phase::Serving { lease, .. } => {
                Some(lease.device().id())
            }
        }
    }

    /// Drop whatever is in progress, releasing the device.
    pub fn abort(&mut self) {
        if let Some(id) = self.device_id() {
            debug!(conn = %self.conn, device = %id, "Transfer aborted");
        }
        self.phase = Phase::Idle;
    }

    /// Validate a flash request and take the device.
    ///
    /// On success the caller asks the client for the first block.
    pub async fn start_flash(
        &mut self,
        ctx: &AppContext,
        request: FlashStart,
    ) -> Result<(), SessionError> {
        if !self.is_idle() {
            return Err(SessionError::AlreadyActive);
        }
        let max = ctx.config.max_file_size;
        if request.file_size > max {
            return Err(SessionError::FileTooLarge {
                size: request.file_size,
                max,
            });
        }
        if request.file_size == 0 {
            return Err(SessionError::EmptyImage);
        }

        let lease = self.take_device(ctx, &request.device_id).await?;

        let mut transfer = InboundTransfer::new();
        transfer.start(request.file_size);
        info!(
            conn = %self.conn,
            device = %request.device_id,
            size = request.file_size,
            "Flash started"
        );
        self.phase = Phase::Receiving {
            lease,
            transfer,
            request,
        };
        Ok(())
    }

    /// Accept one uploaded block. The block that completes the image also
    /// flashes it, reporting progress on `progress` if the board has any.
    ///
    /// The session is idle again after anything but [`BlockOutcome::NeedMore`].
    pub async fn add_block(
        &mut self,
        ctx: &AppContext,
        block: &[u8],
        progress: Option<mpsc::UnboundedSender<FlashProgress>>,
    ) -> Result<BlockOutcome, SessionError> {
        let removed = match &self.phase {
            Phase::Receiving { lease, .. } => lease.device().is_removed(),
            _ => return Err(SessionError::NotStarted),
        };
        if removed {
            self.abort();
            return Err(SessionError::Disconnected);
        }

        let Phase::Receiving { transfer, .. } = &mut self.phase else {
            return Err(SessionError::NotStarted);
        };
        match transfer.add_block(block) {
            Ok(false) => return Ok(BlockOutcome::NeedMore),
            Ok(true) => {}
            Err(e) => {
                self.abort();
                return Err(e.into());
            }
        }

        let Phase::Receiving {
            lease,
            transfer,
            request,
        } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return Err(SessionError::NotStarted);
        };

        let image = transfer.persist(None)?;
        drop(transfer);

        let device = lease.device();
        info!(conn = %self.conn, device = %device.id(), "Image received, flashing");
        let result = device
            .board()
            .flash(
                image.path(),
                FlashContext {
                    registry: &ctx.registry,
                    handshake: &ctx.handshake,
                    progress,
                    address: request.address,
                    verify: request.verify,
                },
            )
            .await;

        match &result {
            Ok(_) => info!(device = %device.id(), "Flash finished"),
            Err(e) => warn!(device = %device.id(), error = %e, "Flash failed"),
        }
        // `image` and `lease` go out of scope here on both outcomes.
        Ok(BlockOutcome::Flashed(result?))
    }

    /// Lock a device and read its current firmware into memory.
    ///
    /// Returns the image size for the approval message.
    pub async fn start_retrieval(
        &mut self,
        ctx: &AppContext,
        request: &DeviceRequest,
    ) -> Result<usize, SessionError> {
        if !self.is_idle() {
            return Err(SessionError::AlreadyActive);
        }
        let lease = self.take_device(ctx, &request.device_id).await?;

        let image = lease
            .device()
            .board()
            .read_firmware(request.address.as_deref())
            .await?;
        let size = image.len();
        info!(conn = %self.conn, device = %request.device_id, size, "Firmware retrieval started");

        self.phase = Phase::Serving {
            lease,
            transfer: OutboundTransfer::new(image, ctx.block_size()),
        };
        Ok(size)
    }

    /// Hand out the next block of the firmware being retrieved from `device_id`.
    pub fn next_block(&mut self, device_id: &str) -> Result<ServedBlock, SessionError> {
        let removed = match &self.phase {
            Phase::Serving { lease, .. } if lease.device().id() == device_id => {
                lease.device().is_removed()
            }
            _ => return Err(SessionError::NotStarted),
        };
        if removed {
            self.abort();
            return Err(SessionError::Disconnected);
        }

        let Phase::Serving { transfer, .. } = &mut self.phase else {
            return Err(SessionError::NotStarted);
        };
        let data = transfer.pop_block();
        let finished = transfer.is_finished();
        if finished {
            debug!(conn = %self.conn, device = %device_id, "Firmware retrieval finished");
            self.phase = Phase::Idle;
        }
        Ok(ServedBlock { data, finished })
    }

    async fn take_device(&self, ctx: &AppContext, id: &str) -> Result<Lease, SessionError> {
        let device = ctx
            .registry
            .get(id)
            .ok_or_else(|| SessionError::UnknownDevice(id.to_string()))?;
        let lease = device.try_lock(self.conn).ok_or(SessionError::Locked)?;

        if !ctx.registry.revalidate(&device).await {
            return Err(SessionError::Disconnected);
        }
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::simulated::simulated_firmware;
    use crate::context::testing::{context, simulated_config};
    use crate::registry::testing::{uno_sighting, ScriptedDetector};
    use std::sync::Arc;

    fn flash_request(id: &str, size: usize) -> FlashStart {
        FlashStart {
            device_id: id.to_string(),
            file_size: size,
            address: None,
            verify: false,
        }
    }

    fn simulated_ctx() -> Arc<AppContext> {
        context(simulated_config(2, 1), Arc::new(ScriptedDetector::default()))
    }

    #[tokio::test]
    async fn test_unknown_device_leaves_state_alone() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());

        let err = session
            .start_flash(&ctx, flash_request("nope", 10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownDevice);
        assert!(session.is_idle());
        assert!(ctx.registry.list_all().iter().all(|d| !d.is_locked()));
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());
        let size = ctx.config.max_file_size + 1;

        let err = session
            .start_flash(&ctx, flash_request("fakeid-0", size))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FileTooLarge);
        assert!(!ctx.registry.get("fakeid-0").unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_second_connection_sees_lock() {
        let ctx = simulated_ctx();
        let mut a = FlashSession::new(ConnectionId::next());
        let mut b = FlashSession::new(ConnectionId::next());

        a.start_flash(&ctx, flash_request("fakeid-0", 10)).await.unwrap();
        let err = b
            .start_flash(&ctx, flash_request("fakeid-0", 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceLocked);

        // The same connection gets a different error.
        let err = a
            .start_flash(&ctx, flash_request("fakeid-1", 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FlashNotFinished);
    }

    #[tokio::test]
    async fn test_block_without_session() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());

        let err = session.add_block(&ctx, b"abc", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FlashNotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_flashes_and_releases() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());
        session.start_flash(&ctx, flash_request("fakeid-0", 6)).await.unwrap();
        let device = ctx.registry.get("fakeid-0").unwrap();
        assert!(device.is_locked());

        assert_eq!(
            session.add_block(&ctx, b"abc", None).await.unwrap(),
            BlockOutcome::NeedMore
        );
        let outcome = session.add_block(&ctx, b"def", None).await.unwrap();

        assert!(matches!(outcome, BlockOutcome::Flashed(_)));
        assert!(session.is_idle());
        assert!(!device.is_locked());
    }

    #[tokio::test]
    async fn test_overflowing_block_aborts() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());
        session.start_flash(&ctx, flash_request("fakeid-0", 4)).await.unwrap();

        let err = session.add_block(&ctx, b"too long", None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BlockTooLarge);
        assert!(session.is_idle());
        assert!(!ctx.registry.get("fakeid-0").unwrap().is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_failure_still_releases() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());
        // No address, so the simulated multi-port board refuses.
        session.start_flash(&ctx, flash_request("fakems-0", 3)).await.unwrap();

        let err = session.add_block(&ctx, b"abc", None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert!(matches!(
            err.to_message(),
            ServerMessage::Error { comment: Some(c), .. } if c.contains("Address")
        ));
        assert!(!ctx.registry.get("fakems-0").unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_dropped_session_releases_device() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());
        session.start_flash(&ctx, flash_request("fakeid-1", 100)).await.unwrap();
        session.add_block(&ctx, b"partial", None).await.unwrap();

        drop(session);
        assert!(!ctx.registry.get("fakeid-1").unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_unplugged_device_evicted_on_start() {
        let detector = Arc::new(ScriptedDetector::default());
        detector.attach(uno_sighting("A1", "/dev/ttyACM0"));
        let ctx = context(simulated_config(0, 0), detector.clone());
        ctx.registry.reconcile().await;

        detector.detach("A1");
        let mut session = FlashSession::new(ConnectionId::next());
        let err = session
            .start_flash(&ctx, flash_request("A1", 10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceDisconnected);
        assert!(ctx.registry.get("A1").is_none());
        assert!(session.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_retrieval_in_blocks() {
        let ctx = simulated_ctx();
        let mut session = FlashSession::new(ConnectionId::next());
        let request = DeviceRequest {
            device_id: "fakems-0".to_string(),
            address: Some(format!("{:016}", 0)),
        };

        let size = session.start_retrieval(&ctx, &request).await.unwrap();
        assert_eq!(size, simulated_firmware().len());

        let mut image = Vec::new();
        loop {
            let block = session.next_block("fakems-0").unwrap();
            assert!(block.data.len() <= ctx.block_size());
            image.extend_from_slice(&block.data);
            if block.finished {
                break;
            }
        }

        assert_eq!(Bytes::from(image), simulated_firmware());
        assert!(session.is_idle());
        assert!(!ctx.registry.get("fakems-0").unwrap().is_locked());
        assert_eq!(
            session.next_block("fakems-0").unwrap_err().kind(),
            ErrorKind::FlashNotStarted
        );
    }
}
