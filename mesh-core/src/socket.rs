//! Socket protocol (component C3): line-delimited JSON frames over the
//! group-owner TCP socket. Framing is a thin `tokio_util::codec::LinesCodec`
//! wrapper per stream; the per-peer reader/writer tasks and their lifetime
//! are the coordinator's job (§3 "ownership & lifetime" — the coordinator
//! exclusively owns the transport handles), this module only knows how to
//! turn bytes into `Frame`s and back.

use crate::config::MAX_FRAME;
use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::message::Frame;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// A single peer's framed stream, both directions on one handle — handy for
/// request/response exchanges like the handshake, where one task owns the
/// whole stream.
pub type FramedStream = Framed<TcpStream, LinesCodec>;

/// The read half, once a stream has been handed off to separate reader and
/// writer tasks (§5: "reader task per neighbour" vs. the coordinator's
/// outbound queue consumer).
pub type FramedReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub type FramedWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Splits an established stream into an independent reader and writer, so
/// one task can forward inbound frames to the coordinator while another
/// drains its outbound queue, per §5's task model.
pub fn into_split(stream: TcpStream) -> (FramedReader, FramedWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME)),
        FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_FRAME)),
    )
}

/// Binds the group-owner listener (§4.2 `start_server`). Binding twice is
/// the caller's responsibility to avoid — unlike the source's
/// in-process idempotency check, a `TcpListener` bound to the same port
/// twice is simply a second, independent listener, so callers should hold
/// on to the one returned here instead of calling this again.
pub async fn start_server(bind_addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(bind_addr).await.map_err(Error::Io)
}

/// Accepts the next incoming raw stream (§4.2 "accept in a loop"), left
/// unwrapped so the caller can choose a combined [`FramedStream`] via
/// [`wrap`] or split reader/writer halves via [`into_split`].
pub async fn accept_raw(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    listener.accept().await.map_err(Error::Io)
}

/// Accepts the next incoming stream and wraps it in the line-delimited
/// frame codec as one combined handle.
pub async fn accept(listener: &TcpListener) -> Result<(FramedStream, SocketAddr)> {
    let (stream, addr) = accept_raw(listener).await?;
    Ok((wrap(stream), addr))
}

/// Establishes one outbound raw stream to the group owner, bounded by
/// `connect_timeout`.
pub async fn connect_raw(owner_addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(owner_addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Unreachable(DeviceId::from_canonical(owner_addr.to_string()))),
    }
}

/// Establishes one outbound stream to the group owner (§4.2 `connect_to`),
/// wrapped as one combined handle.
pub async fn connect_to(owner_addr: SocketAddr, connect_timeout: Duration) -> Result<FramedStream> {
    connect_raw(owner_addr, connect_timeout).await.map(wrap)
}

/// Wraps an already-established stream in the line-delimited frame codec.
pub fn wrap_stream(stream: TcpStream) -> FramedStream {
    wrap(stream)
}

fn wrap(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME))
}

/// Serializes and writes one frame, retrying once after 100 ms on failure
/// before surfacing the error (§4.2 "write errors are retried once"). Works
/// on a combined [`FramedStream`] or a split-off [`FramedWriter`] alike.
pub async fn write_frame<S>(sink: &mut S, frame: &Frame) -> Result<()>
where
    S: futures_util::Sink<String> + Unpin,
    S::Error: std::fmt::Display,
{
    let line = serde_json::to_string(frame).map_err(|e| Error::Malformed(e.to_string()))?;

    if sink.send(line.clone()).await.is_ok() {
        return Ok(());
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    sink.send(line)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Reads and parses the next frame. `Ok(None)` signals a clean stream end;
/// an oversized (over `MAX_FRAME`) or JSON-malformed line is reported as
/// `Error::Malformed` without closing the stream (§ "a frame whose decoded
/// size exceeds MAX_FRAME is dropped and logged" — one bad frame, not a dead
/// connection). Only an actual I/O failure on the underlying socket is
/// `Error::Io`, which the caller should treat as fatal. Works on a combined
/// [`FramedStream`] or a split-off [`FramedReader`] alike.
pub async fn read_frame<S>(source: &mut S) -> Result<Option<Frame>>
where
    S: futures_util::Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
{
    match source.next().await {
        None => Ok(None),
        Some(Ok(line)) => {
            let frame: Frame = serde_json::from_str(&line).map_err(|e| Error::Malformed(e.to_string()))?;
            Ok(Some(frame))
        }
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            Err(Error::Malformed(format!("frame exceeds {MAX_FRAME} bytes")))
        }
        Some(Err(LinesCodecError::Io(e))) => Err(Error::Io(e)),
    }
}

/// Registry of live per-peer outbound channels, keyed by device id (§4.2
/// `send`/`broadcast`/`force_cleanup`). The actual socket write loop lives
/// in whatever task owns the matching receiver; this table only holds the
/// sending half so `send`/`broadcast` never block on a slow peer beyond the
/// channel's buffer.
#[derive(Default)]
pub struct StreamTable {
    senders: HashMap<DeviceId, mpsc::UnboundedSender<Frame>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: DeviceId, sender: mpsc::UnboundedSender<Frame>) {
        self.senders.insert(id, sender);
    }

    pub fn remove(&mut self, id: &DeviceId) {
        self.senders.remove(id);
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.senders.contains_key(id)
    }

    pub fn direct_neighbours(&self) -> impl Iterator<Item = &DeviceId> {
        self.senders.keys()
    }

    /// Sends to one target (§4.2 `send`); `Unreachable` if no stream is
    /// registered for it — a known device with no current route, which is
    /// what the reconnection path (§4.5, triggered off `Unreachable`/
    /// `Timeout`) is meant to catch. `NotConnected` is reserved for
    /// [`crate::coordinator::ConnectionCoordinator::originate`]'s distinct
    /// "no direct neighbour at all" case.
    pub fn send(&self, target: &DeviceId, frame: Frame) -> Result<()> {
        self.senders
            .get(target)
            .ok_or_else(|| Error::Unreachable(target.clone()))
            .and_then(|tx| tx.send(frame).map_err(|_| Error::Unreachable(target.clone())))
    }

    /// Sends to every direct neighbour except those in `exclude` (split
    /// horizon, §4.6). A failure to enqueue for one neighbour never aborts
    /// delivery to the others (§4.2 "partial failure ... never aborts the
    /// broadcast").
    pub fn broadcast(&self, frame: Frame, exclude: &std::collections::HashSet<DeviceId>) {
        for (id, tx) in &self.senders {
            if exclude.contains(id) {
                continue;
            }
            let _ = tx.send(frame.clone());
        }
    }

    /// Drops every registered sender, which closes each peer's write loop
    /// the next time it tries to recv (§4.2 `force_cleanup`).
    pub fn force_cleanup(&mut self) {
        self.senders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn frame() -> Frame {
        Frame {
            kind: MessageKind::Ping,
            message_id: "m".into(),
            device_id: "d".into(),
            user_name: "alice".into(),
            target: None,
            ttl: 5,
            route: vec![],
            ts: 0,
            payload: String::new(),
            lat: None,
            lon: None,
        }
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_real_loopback_socket() {
        let listener = start_server("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = accept(&listener).await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap()
        });

        let mut client = connect_to(addr, Duration::from_secs(1)).await.unwrap();
        write_frame(&mut client, &frame()).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.message_id, "m");
        assert_eq!(received.kind, MessageKind::Ping);
    }

    #[tokio::test]
    async fn split_reader_and_writer_carry_a_frame_independently() {
        let listener = start_server("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = accept_raw(&listener).await.unwrap();
            let (mut reader, _writer) = into_split(stream);
            read_frame(&mut reader).await.unwrap().unwrap()
        });

        let client = connect_raw(addr, Duration::from_secs(1)).await.unwrap();
        let (_reader, mut writer) = into_split(client);
        write_frame(&mut writer, &frame()).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.message_id, "m");
    }

    #[tokio::test]
    async fn connect_to_a_dead_port_times_out() {
        let result = connect_to(
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn send_without_a_registered_stream_is_unreachable() {
        let table = StreamTable::new();
        let err = table.send(&DeviceId::from_canonical("missing"), frame()).unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_malformed_and_does_not_close_the_stream() {
        let listener = start_server("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = accept_raw(&listener).await.unwrap();
            let (mut reader, _writer) = into_split(stream);
            let first = read_frame(&mut reader).await;
            let second = read_frame(&mut reader).await.unwrap().unwrap();
            (first, second)
        });

        let client = connect_raw(addr, Duration::from_secs(1)).await.unwrap();
        let (_raw_reader, mut raw_writer) = client.into_split();
        use tokio::io::AsyncWriteExt;
        let oversized = "x".repeat(MAX_FRAME + 1);
        raw_writer.write_all(oversized.as_bytes()).await.unwrap();
        raw_writer.write_all(b"\n").await.unwrap();
        let mut writer = FramedWrite::new(raw_writer, LinesCodec::new_with_max_length(MAX_FRAME));
        write_frame(&mut writer, &frame()).await.unwrap();

        let (first, second) = server.await.unwrap();
        assert!(matches!(first, Err(Error::Malformed(_))));
        assert_eq!(second.message_id, "m");
    }

    #[test]
    fn broadcast_respects_split_horizon_exclusion() {
        let mut table = StreamTable::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        table.register(DeviceId::from_canonical("a"), tx_a);
        table.register(DeviceId::from_canonical("b"), tx_b);

        let mut exclude = std::collections::HashSet::new();
        exclude.insert(DeviceId::from_canonical("b"));
        table.broadcast(frame(), &exclude);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
