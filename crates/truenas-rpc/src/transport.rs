//! Message transports for JSON-RPC traffic.
//!
//! A [`Transport`] is one full-duplex, message-oriented connection split into a
//! [`MessageSink`] for outbound text frames and a [`MessageStream`] for inbound
//! ones. The end of the stream is the normal termination signal; anything else
//! arrives as a [`TransportError`].
//!
//! Two transports are provided:
//!
//! - WebSocket (`ws://`, and `wss://` with the `native-tls` feature), one JSON
//!   message per text frame.
//! - Length-prefixed frames over any byte stream (Unix socket, TCP, in-memory
//!   duplex):
//!
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (JSON payload)  |
//! +----------------+------------------+
//! ```

use std::io;
use std::pin::Pin;

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Maximum message size (16 MB)
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// Outbound half of a transport.
pub type MessageSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a transport. `None` means the peer closed normally.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Errors raised by a transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<WsError>),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Connection closed by peer with code {code}: {reason}")]
    Closed { code: u16, reason: String },
}

impl From<WsError> for TransportError {
    fn from(e: WsError) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl TransportError {
    /// True when the peer is already gone, which is not worth reporting on close.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            Self::WebSocket(e) => matches!(**e, WsError::ConnectionClosed | WsError::AlreadyClosed),
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// One connection, split into its write and read halves.
pub struct Transport {
    sink: MessageSink,
    stream: MessageStream,
}

impl Transport {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Dial a WebSocket endpoint.
    ///
    /// `verify_tls` only has an effect for `wss://` URLs when the crate is
    /// built with the `native-tls` feature.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the TCP connection fails, or the
    /// WebSocket handshake is rejected.
    pub async fn connect_websocket(url: &str, verify_tls: bool) -> Result<Self, TransportError> {
        let ws = dial(url, verify_tls).await?;
        tracing::debug!("WebSocket connected to {url}");
        Ok(Self::websocket(ws))
    }

    /// Wrap an established WebSocket stream.
    pub fn websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|text: String| future::ready(Ok::<_, TransportError>(WsMessage::text(text))));

        let stream = stream.filter_map(|item| future::ready(websocket_frame(item)));

        Self::new(sink, stream)
    }

    /// Frame messages over a byte stream with a 4-byte big-endian length prefix.
    pub fn framed<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, FrameCodec::new()).split();
        Self::new(sink, stream)
    }

    pub fn into_parts(self) -> (MessageSink, MessageStream) {
        (self.sink, self.stream)
    }
}

type WsClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[cfg(feature = "native-tls")]
async fn dial(url: &str, verify_tls: bool) -> Result<WsClientStream, TransportError> {
    use tokio_tungstenite::Connector;

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!verify_tls)
        .danger_accept_invalid_hostnames(!verify_tls)
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
        url,
        None,
        false,
        Some(Connector::NativeTls(connector)),
    )
    .await?;
    Ok(ws)
}

#[cfg(not(feature = "native-tls"))]
async fn dial(url: &str, verify_tls: bool) -> Result<WsClientStream, TransportError> {
    if !verify_tls {
        tracing::debug!("TLS verification toggle ignored: built without native-tls");
    }
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

/// Map one WebSocket frame to an inbound message, skipping control frames.
fn websocket_frame(item: Result<WsMessage, WsError>) -> Option<Result<String, TransportError>> {
    match item {
        Ok(WsMessage::Text(text)) => Some(Ok(text.to_string())),
        Ok(WsMessage::Binary(data)) => Some(
            String::from_utf8(data.to_vec()).map_err(|e| TransportError::Utf8(e.utf8_error())),
        ),
        Ok(WsMessage::Close(Some(frame)))
            if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) =>
        {
            Some(Err(TransportError::Closed {
                code: u16::from(frame.code),
                reason: frame.reason.to_string(),
            }))
        }
        Ok(WsMessage::Close(_) | WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))
        | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => None,
        Err(e) => Some(Err(e.into())),
    }
}

/// Codec for length-prefixed UTF-8 frames.
///
/// Stateless: a frame stays in the read buffer, prefix included, until all of
/// it has arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Declared payload length of the frame at the head of `src`, if the
    /// prefix is complete.
    fn peek_length(src: &[u8]) -> Option<usize> {
        let prefix: [u8; LENGTH_PREFIX_SIZE] = src.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix) as usize)
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(length) = Self::peek_length(src) else {
            return Ok(None);
        };
        if length > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(length));
        }

        let frame_len = LENGTH_PREFIX_SIZE + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length);
        Ok(Some(std::str::from_utf8(&payload)?.to_owned()))
    }
}

impl Encoder<String> for FrameCodec {
    type Error = TransportError;

    // Message size is checked against MAX_MESSAGE_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.as_bytes();

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(bytes.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(bytes);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::cast_possible_truncation)] // Test constants bounded to u32

    use super::*;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[test]
    fn test_encode_decode_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#.to_string(), &mut buf)
            .unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_passes_malformed_json_through() {
        // Framing does not parse JSON; the dispatch loop decides what to drop
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let invalid_json = b"not valid json";
        buf.put_u32(invalid_json.len() as u32);
        buf.extend_from_slice(invalid_json);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "not valid json");
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("{\"id\":12}".to_string(), &mut buf).unwrap();

        let full_buf = buf.clone();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full_buf[..2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf[2..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf[6..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), "{\"id\":12}");
    }

    #[test]
    fn test_incomplete_frame_is_left_in_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.extend_from_slice(b"abc");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b"defghij");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "abcdefghij");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("first".to_string(), &mut buf).unwrap();
        codec.encode("second".to_string(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_message_too_large() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(TransportError::MessageTooLarge(_))));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let invalid_utf8 = [0xff, 0xfe, 0x00, 0x01];
        buf.put_u32(invalid_utf8.len() as u32);
        buf.extend_from_slice(&invalid_utf8);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Utf8(_))
        ));
    }

    #[test]
    fn test_length_prefix_format() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("{}".to_string(), &mut buf).unwrap();

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(length, buf.len() - 4);
    }

    #[test]
    fn test_websocket_frame_mapping() {
        let text = websocket_frame(Ok(WsMessage::text("{\"id\":3}")));
        assert_eq!(text.unwrap().unwrap(), "{\"id\":3}");

        let binary = websocket_frame(Ok(WsMessage::binary(b"{}".to_vec())));
        assert_eq!(binary.unwrap().unwrap(), "{}");

        assert!(websocket_frame(Ok(WsMessage::Ping(Vec::new().into()))).is_none());
        assert!(websocket_frame(Err(WsError::ConnectionClosed)).is_none());
    }

    #[test]
    fn test_websocket_close_codes() {
        let normal = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        assert!(websocket_frame(Ok(normal)).is_none());

        let away = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        }));
        assert!(websocket_frame(Ok(away)).is_none());

        let abnormal = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "middleware restarting".into(),
        }));
        match websocket_frame(Ok(abnormal)) {
            Some(Err(TransportError::Closed { code, reason })) => {
                assert_eq!(code, 1011);
                assert_eq!(reason, "middleware restarting");
            }
            other => panic!("Expected Closed error, got {other:?}"),
        }
    }

    #[test]
    fn test_is_disconnect() {
        let broken = TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(broken.is_disconnect());
        assert!(TransportError::from(WsError::AlreadyClosed).is_disconnect());
        assert!(!TransportError::MessageTooLarge(1).is_disconnect());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::MessageTooLarge(20_000_000);
        assert!(err.to_string().contains("20000000"));
        assert!(err.to_string().contains("too large"));

        let err = TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_framed_transport_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let (mut left_sink, mut left_stream) = Transport::framed(left).into_parts();
        let (mut right_sink, mut right_stream) = Transport::framed(right).into_parts();

        left_sink.send("{\"id\":1}".to_string()).await.unwrap();
        assert_eq!(right_stream.next().await.unwrap().unwrap(), "{\"id\":1}");

        right_sink.send("{\"id\":2}".to_string()).await.unwrap();
        assert_eq!(left_stream.next().await.unwrap().unwrap(), "{\"id\":2}");

        left_sink.close().await.unwrap();
        drop(left_stream);
        assert!(right_stream.next().await.is_none());
    }
}
