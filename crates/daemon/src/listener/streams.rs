// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming requests: `Watch` and `Tail` hold the connection open and
//! write one frame per event or chunk, then `End`.

use ot_core::Clock;
use ot_engine::ReplicaHandle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{detect_client_disconnect, ConnectionError, ListenCtx};
use crate::protocol::{self, Request, Response};

pub(super) async fn serve<C, R, W>(
    request: Request,
    replica: &ReplicaHandle<C>,
    mut reader: R,
    mut writer: W,
    ctx: &ListenCtx<C>,
) -> Result<(), ConnectionError>
where
    C: Clock,
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    match request {
        Request::Watch { filter } => {
            // Subscribed before anything is written, so the client may act
            // as soon as it reads the first frame
            let mut events = replica.runs.watch(filter.to_event_filter());
            protocol::write_response(&mut writer, &Response::Ok, ctx.timeout).await?;
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = detect_client_disconnect(&mut reader) => {
                        debug!("watcher disconnected");
                        return Ok(());
                    }
                    _ = ctx.shutdown.cancelled() => None,
                };
                let Some(event) = event else { break };
                let frame = Response::Event {
                    event: Box::new(event),
                };
                protocol::write_response(&mut writer, &frame, ctx.timeout).await?;
            }
        }
        Request::Tail {
            run_id,
            phase,
            offset,
        } => {
            let mut tail = match replica.logs.tail(&run_id, phase, offset) {
                Ok(tail) => tail,
                Err(e) => {
                    let response: Response = e.into();
                    protocol::write_response(&mut writer, &response, ctx.timeout).await?;
                    return Ok(());
                }
            };
            protocol::write_response(&mut writer, &Response::Ok, ctx.timeout).await?;
            loop {
                let chunk = tokio::select! {
                    chunk = tail.next() => chunk,
                    _ = detect_client_disconnect(&mut reader) => {
                        debug!(run_id = %run_id, "tail reader disconnected");
                        return Ok(());
                    }
                    _ = ctx.shutdown.cancelled() => None,
                };
                let Some(chunk) = chunk else { break };
                protocol::write_response(&mut writer, &Response::Chunk { chunk }, ctx.timeout)
                    .await?;
            }
        }
        other => {
            let response = super::requests::handle(other, replica).await;
            protocol::write_response(&mut writer, &response, ctx.timeout).await?;
            return Ok(());
        }
    }
    protocol::write_response(&mut writer, &Response::End, ctx.timeout).await?;
    Ok(())
}
