//! Socket plumbing shared by the capabilities.

use super::InboxSender;
use crate::wire::frame::{self, Hello};
use crate::wire::{CodecError, KindSet, Message};
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Time allowed for the hello/ack exchange once a socket is connected.
pub(super) const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_RETRY: Duration = Duration::from_millis(500);

pub(super) fn frame_message(message: &Message) -> Result<Bytes, CodecError> {
    Ok(frame::encode_frame(&message.encode()?))
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

/// Connects, retrying with backoff until the other side is listening.
pub(super) async fn connect_with_retry(address: &str, retry: Duration) -> TcpStream {
    let mut delay = retry.max(Duration::from_millis(1));
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(address, error = %e, "could not disable Nagle");
                }
                return stream;
            }
            Err(e) => {
                trace!(address, error = %e, "connect failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY);
            }
        }
    }
}

/// Connecting side: send hello, wait for the ack.
pub(super) async fn open_link(
    address: &str,
    hello: &Hello,
    retry: Duration,
    max_frame_bytes: usize,
) -> io::Result<TcpStream> {
    let mut stream = connect_with_retry(address, retry).await;
    stream
        .write_all(&frame::encode_frame(&hello.to_parts()))
        .await?;
    let reply = tokio::time::timeout(HELLO_TIMEOUT, frame::read_frame(&mut stream, max_frame_bytes))
        .await
        .map_err(|_| timed_out("ack"))??;
    match reply {
        Some(parts) if frame::is_ack(&parts) => Ok(stream),
        Some(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "expected ack")),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "closed before ack",
        )),
    }
}

/// Accepting side: read and parse the hello frame.
pub(super) async fn read_hello(stream: &mut TcpStream, max_frame_bytes: usize) -> io::Result<Hello> {
    let parts = tokio::time::timeout(HELLO_TIMEOUT, frame::read_frame(stream, max_frame_bytes))
        .await
        .map_err(|_| timed_out("hello"))??
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before hello"))?;
    Hello::from_parts(&parts).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub(super) async fn send_ack(stream: &mut TcpStream) -> io::Result<()> {
    stream
        .write_all(&frame::encode_frame(&frame::ack_parts()))
        .await
}

/// Reads frames until end of stream, forwarding admitted messages into the inbox.
///
/// Undecodable frames are logged and dropped; they never end the link.
pub(super) async fn pump_inbound<R>(
    mut reader: R,
    inbox: InboxSender,
    kinds: KindSet,
    label: String,
    max_frame_bytes: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(parts) = frame::read_frame(&mut reader, max_frame_bytes).await? {
        match Message::decode(&parts) {
            Ok(message) if kinds.contains(message.kind()) => {
                if inbox.send(message).await.is_err() {
                    debug!(link = %label, "inbox closed");
                    return Ok(());
                }
            }
            Ok(message) => {
                trace!(link = %label, kind = %message.kind(), "filtered out");
            }
            Err(e) => {
                warn!(link = %label, error = %e, "dropping undecodable message");
            }
        }
    }
    Ok(())
}

/// Runs a full-duplex link until either direction fails.
///
/// Frames already taken from `outbound` when the write fails are lost; frames still queued
/// stay for the next connection.
pub(super) async fn run_duplex(
    stream: TcpStream,
    outbound: &mut mpsc::Receiver<Bytes>,
    inbox: InboxSender,
    label: String,
    max_frame_bytes: usize,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::spawn(pump_inbound(
        read_half,
        inbox,
        KindSet::all(),
        label.clone(),
        max_frame_bytes,
    ));

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(bytes) => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        warn!(link = %label, error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
            result = &mut reader => {
                match result {
                    Ok(Ok(())) => debug!(link = %label, "peer closed"),
                    Ok(Err(e)) => warn!(link = %label, error = %e, "read failed"),
                    Err(e) => warn!(link = %label, error = %e, "reader task failed"),
                }
                return;
            }
        }
    }
    reader.abort();
}
