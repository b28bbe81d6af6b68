//! TCP client towards the TLC daemon.
//!
//! TLC is strictly single-threaded cooperative: one request in flight
//! at a time, so this client never pipelines -- each `call` writes a frame
//! and waits for the one response that must echo its id before returning.
//!
//! The connection is split into independently-typed halves (`FramedWrite`
//! for outgoing `TlcRequest` envelopes, `FramedRead` for incoming
//! `TlcResponse` envelopes), the split-stream idiom used elsewhere in this
//! codebase for one-directional chunk streams with `FramedRead`/`BytesCodec`
//! -- `JsonFrameCodec` is
//! generic in one message type, so a single `Framed` can't carry two.

use std::time::Duration;

use anyhow::{bail, Error};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use phobos_api_types::RequestId;
use phobos_proto::tlc::{TlcRequest, TlcResponse};
use phobos_proto::{Envelope, JsonFrameCodec};

pub struct TlcClient {
    writer: FramedWrite<OwnedWriteHalf, JsonFrameCodec<Envelope<TlcRequest>>>,
    reader: FramedRead<OwnedReadHalf, JsonFrameCodec<Envelope<TlcResponse>>>,
    next_id: RequestId,
    request_timeout: Duration,
}

impl TlcClient {
    pub async fn connect(addr: &str, request_timeout: Duration) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            writer: FramedWrite::new(write_half, JsonFrameCodec::default()),
            reader: FramedRead::new(read_half, JsonFrameCodec::default()),
            next_id: 1,
            request_timeout,
        })
    }

    /// Send `req` and wait for the matching response. A mismatched id is a
    /// fatal protocol error for this connection.
    pub async fn call(&mut self, req: TlcRequest) -> Result<TlcResponse, Error> {
        let id = self.next_id;
        self.next_id += 1;

        self.writer
            .send(Envelope::new(id, req))
            .await
            .map_err(|err| anyhow::format_err!("sending request to TLC failed: {err}"))?;

        let envelope = match timeout(self.request_timeout, self.reader.next()).await {
            Ok(Some(Ok(env))) => env,
            Ok(Some(Err(err))) => bail!("decoding TLC response failed: {err}"),
            Ok(None) => bail!("TLC closed the connection"),
            Err(_) => bail!("TLC request timed out after {:?}", self.request_timeout),
        };

        if envelope.id != id {
            bail!("protocol error: expected response id {id}, got {}", envelope.id);
        }

        Ok(envelope.body)
    }
}
