//! Session engine
//!
//! One session services one file transfer over its own ephemeral endpoint,
//! in strict lock-step: the RRQ side sends DATA and awaits the matching
//! ACK, the WRQ side sends ACK and awaits the next DATA. Each round gets a
//! bounded number of attempts with a per-attempt receive deadline; terminal
//! failures are reported to the peer with a best-effort ERROR packet and
//! recorded in the server control block.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::endpoint::{Endpoint, PeerFilter};
use crate::protocol::{
    BLOCK_SIZE, MAX_FRAME_SIZE, TftpData, TftpErrorCode, build_ack, build_data, build_error, parse_ack, parse_data,
    parse_error, parse_request,
};
use crate::server::ServerState;

/// Per-attempt receive deadline.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Attempts per DATA/ACK round before the transfer is abandoned.
pub const RECV_ATTEMPTS: usize = 2;

/// Parameters handed from the listener to a session worker. The request
/// frame is copied out of the listener's receive buffer before the
/// listener resumes receiving.
pub(crate) struct SessionContext {
    pub server: Arc<ServerState>,
    pub peer: SocketAddr,
    pub frame: Vec<u8>,
    pub registry_index: usize,
}

/// Session bookkeeping that must run on every exit path: the session
/// counter is incremented on entry, and dropping the guard frees the
/// registry slot and decrements the counter again.
struct SessionGuard {
    server: Arc<ServerState>,
    registry_index: usize,
}

impl SessionGuard {
    fn enter(ctx: &SessionContext) -> Self {
        let sessions = ctx.server.opened_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("session for {} started (sessions = {})", ctx.peer, sessions);

        Self {
            server: ctx.server.clone(),
            registry_index: ctx.registry_index,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.server.registry.remove(self.registry_index);
        let sessions = self.server.opened_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!("session finished (sessions = {})", sessions);
    }
}

/// Service a read request: send the file to the client.
pub(crate) async fn run_rrq_session(ctx: SessionContext) {
    let _guard = SessionGuard::enter(&ctx);
    if let Err(e) = serve_read(&ctx).await {
        tracing::warn!("read transfer for {} failed: {:#}", ctx.peer, e);
    }
}

/// Service a write request: receive a file from the client.
pub(crate) async fn run_wrq_session(ctx: SessionContext) {
    let _guard = SessionGuard::enter(&ctx);
    if let Err(e) = serve_write(&ctx).await {
        tracing::warn!("write transfer for {} failed: {:#}", ctx.peer, e);
    }
}

/// Send a best-effort ERROR to the peer, record the terminal code in the
/// control block, and produce the error that ends the session.
async fn session_error(ctx: &SessionContext, endpoint: &Endpoint, code: TftpErrorCode) -> anyhow::Error {
    let _ = endpoint.send_to(ctx.peer, &build_error(code)).await;
    ctx.server.set_last_error(code);
    anyhow::anyhow!("{}", code.wire_message())
}

async fn serve_read(ctx: &SessionContext) -> Result<()> {
    let endpoint = Endpoint::bind(0).await?;
    let request = parse_request(&ctx.frame)?;

    if !request.mode.is_supported() {
        return Err(session_error(ctx, &endpoint, TftpErrorCode::IllegalOperation).await);
    }

    let mut reader = match ctx.server.store.open_read(&request.filename).await {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!("cannot open {:?} for read: {}", ctx.server.store.read_path(&request.filename), e);
            return Err(session_error(ctx, &endpoint, TftpErrorCode::FileNotFound).await);
        }
    };

    let size = reader.size();
    // When the size is a multiple of 512 the protocol still needs a
    // trailing zero-length DATA to signal end-of-file, hence the +1.
    let total_blocks = size / BLOCK_SIZE as u64 + 1;

    tracing::debug!(
        "uploading {} ({} bytes, {} blocks) to {}",
        request.filename,
        size,
        total_blocks,
        ctx.peer
    );

    let filter = PeerFilter::exact(ctx.peer);
    let mut chunk = vec![0u8; BLOCK_SIZE];
    let mut frame = vec![0u8; MAX_FRAME_SIZE];
    let mut block: u16 = 0;
    let mut last_acked: u16 = 0;

    for i in 0..total_blocks {
        let want = if i + 1 < total_blocks {
            BLOCK_SIZE
        } else {
            (size % BLOCK_SIZE as u64) as usize
        };
        if reader.read_chunk(&mut chunk[..want]).await.ok() != Some(want) {
            return Err(session_error(ctx, &endpoint, TftpErrorCode::AccessViolation).await);
        }

        block = block.wrapping_add(1);
        let packet = build_data(block, &chunk[..want]);

        let mut acknowledged = false;
        let mut await_only = false;

        for _attempt in 0..RECV_ATTEMPTS {
            if !await_only {
                endpoint.send_to(ctx.peer, &packet).await.context("send DATA")?;
            }
            await_only = false;

            let Some((len, _)) = endpoint.recv_from_expected(&mut frame, filter, RECV_TIMEOUT).await? else {
                tracing::warn!("no ACK for block {} from {}", block, ctx.peer);
                continue;
            };

            if let Ok(err) = parse_error(&frame[..len]) {
                tracing::debug!("peer {} aborted transfer: {}", ctx.peer, err);
                return Ok(());
            }

            match parse_ack(&frame[..len]) {
                Ok(ack) if ack.block == block => {
                    last_acked = ack.block;
                    acknowledged = true;
                    break;
                }
                Ok(ack) => {
                    tracing::warn!("expected ACK {} from {}, got ACK {}", block, ctx.peer, ack.block);
                    // A re-ACK of an earlier block is the client retrying;
                    // absorb it and keep waiting without retransmitting.
                    await_only = ack.block <= last_acked;
                }
                Err(e) => {
                    tracing::warn!("dropping malformed packet from {}: {}", ctx.peer, e);
                }
            }
        }

        if !acknowledged {
            tracing::warn!("read transfer stopped, block {} never acknowledged", block);
            return Err(session_error(ctx, &endpoint, TftpErrorCode::NotDefined).await);
        }
    }

    tracing::info!("sent {} ({} bytes) to {}", request.filename, size, ctx.peer);
    Ok(())
}

async fn serve_write(ctx: &SessionContext) -> Result<()> {
    let endpoint = Endpoint::bind(0).await?;
    let request = parse_request(&ctx.frame)?;

    if !request.mode.is_supported() {
        return Err(session_error(ctx, &endpoint, TftpErrorCode::IllegalOperation).await);
    }

    // Overwrite semantics: an existing file is truncated, never refused.
    let mut writer = match ctx.server.store.open_write(&request.filename).await {
        Ok(writer) => writer,
        Err(e) => {
            tracing::warn!("cannot open {:?} for write: {}", ctx.server.store.write_path(&request.filename), e);
            return Err(session_error(ctx, &endpoint, TftpErrorCode::DiskFull).await);
        }
    };

    tracing::debug!("downloading {} from {}", request.filename, ctx.peer);

    let filter = PeerFilter::exact(ctx.peer);
    let mut frame = vec![0u8; MAX_FRAME_SIZE];
    let mut acked: u16 = 0;
    let mut written: u64 = 0;

    loop {
        let expected = acked.wrapping_add(1);
        let mut received: Option<TftpData> = None;
        let mut resend_ack = true;

        for _attempt in 0..RECV_ATTEMPTS {
            // ACK(0) tells the client to start sending; a timeout re-sends
            // the previous ACK unchanged.
            if resend_ack {
                endpoint.send_to(ctx.peer, &build_ack(acked)).await.context("send ACK")?;
            }
            resend_ack = true;

            let Some((len, _)) = endpoint.recv_from_expected(&mut frame, filter, RECV_TIMEOUT).await? else {
                tracing::warn!("no DATA {} from {}", expected, ctx.peer);
                continue;
            };

            if let Ok(err) = parse_error(&frame[..len]) {
                tracing::debug!("peer {} aborted transfer: {}", ctx.peer, err);
                return Ok(());
            }

            match parse_data(&frame[..len]) {
                Ok(data) if data.block == expected => {
                    received = Some(data);
                    break;
                }
                Ok(data) => {
                    tracing::warn!("expected DATA {} from {}, got block {}", expected, ctx.peer, data.block);
                    resend_ack = false;
                }
                Err(e) => {
                    tracing::warn!("dropping malformed packet from {}: {}", ctx.peer, e);
                    resend_ack = false;
                }
            }
        }

        let Some(data) = received else {
            tracing::warn!("write transfer stopped, block {} never received", expected);
            return Err(session_error(ctx, &endpoint, TftpErrorCode::NotDefined).await);
        };

        if let Err(e) = writer.append(&data.data).await {
            tracing::warn!("write of block {} failed: {}", data.block, e);
            return Err(session_error(ctx, &endpoint, TftpErrorCode::DiskFull).await);
        }
        written += data.data.len() as u64;
        acked = data.block;

        if data.is_last_block() {
            endpoint.send_to(ctx.peer, &build_ack(acked)).await.context("send final ACK")?;
            break;
        }
    }

    tracing::info!("received {} ({} bytes) from {}", request.filename, written, ctx.peer);
    Ok(())
}
