//! STOMP 1.2 client used to publish and receive invalidation messages.
//!
//! Only the subset needed for a broadcast topic is implemented: the
//! CONNECT/CONNECTED handshake, SEND, SUBSCRIBE with automatic
//! acknowledgement, MESSAGE and ERROR frames, and DISCONNECT.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::bus::{BusConnector, BusTransport, MessageSource};
use super::error::BusError;
use super::message::InvalidationMessage;
use crate::config::BusSettings;

const SUBSCRIPTION_ID: &str = "quire-0";

/// Longest command or header line accepted from the broker.
pub const MAX_LINE_BYTES: usize = 64 * 1024;
/// Most headers accepted on one frame.
pub const MAX_HEADERS: usize = 256;
/// Largest frame body accepted from the broker.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// First value of header `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// CONNECT and CONNECTED frames carry their headers verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self.command.as_str(), "CONNECT" | "CONNECTED")
    }

    pub fn encode(&self) -> Vec<u8> {
        let escapes = self.escapes_headers();
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escapes {
                out.extend_from_slice(escape(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    fn error_message(&self) -> String {
        match self.get("message") {
            Some(message) => message.to_string(),
            None => String::from_utf8_lossy(&self.body).into_owned(),
        }
    }
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(value: &str) -> Result<String, BusError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(BusError::protocol(format!("undefined escape `\\{other}`")));
            }
            None => return Err(BusError::protocol("dangling escape")),
        }
    }
    Ok(out)
}

fn read_error(err: std::io::Error) -> BusError {
    BusError::protocol(err.to_string())
}

/// `read_line` that refuses lines longer than [`MAX_LINE_BYTES`].
async fn read_line_bounded<R>(reader: &mut R, line: &mut String) -> Result<usize, BusError>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_line(line)
        .await
        .map_err(read_error)?;
    if line.len() > MAX_LINE_BYTES {
        return Err(BusError::FrameTooLarge {
            part: "line",
            limit: MAX_LINE_BYTES,
        });
    }
    Ok(read)
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames.
///
/// Blank lines between frames are heart-beats and are skipped.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, BusError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let command = loop {
        line.clear();
        if read_line_bounded(reader, &mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            break trimmed.to_string();
        }
    };

    let mut frame = Frame::new(command);
    let escapes = frame.escapes_headers();
    loop {
        line.clear();
        if read_line_bounded(reader, &mut line).await? == 0 {
            return Err(BusError::Closed);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if frame.headers.len() == MAX_HEADERS {
            return Err(BusError::FrameTooLarge {
                part: "headers",
                limit: MAX_HEADERS,
            });
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| BusError::protocol(format!("header without colon: `{trimmed}`")))?;
        if escapes {
            frame.headers.push((unescape(name)?, unescape(value)?));
        } else {
            frame.headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = match frame.get("content-length") {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .map_err(|_| BusError::protocol(format!("invalid content-length `{raw}`")))?,
        ),
        None => None,
    };

    let body = match content_length {
        Some(len) if len > MAX_FRAME_BYTES => {
            return Err(BusError::FrameTooLarge {
                part: "body",
                limit: MAX_FRAME_BYTES,
            });
        }
        Some(len) => {
            let mut body = vec![0; len];
            reader.read_exact(&mut body).await.map_err(read_error)?;
            let terminator = reader.read_u8().await.map_err(read_error)?;
            if terminator != 0 {
                return Err(BusError::protocol("frame body not NUL-terminated"));
            }
            body
        }
        None => {
            let mut body = Vec::new();
            (&mut *reader)
                .take(MAX_FRAME_BYTES as u64 + 1)
                .read_until(0, &mut body)
                .await
                .map_err(read_error)?;
            if body.pop() != Some(0) {
                if body.len() >= MAX_FRAME_BYTES {
                    return Err(BusError::FrameTooLarge {
                        part: "body",
                        limit: MAX_FRAME_BYTES,
                    });
                }
                return Err(BusError::Closed);
            }
            body
        }
    };

    frame.body = Bytes::from(body);
    Ok(Some(frame))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Clone)]
pub struct StompOptions {
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub connect_timeout: Duration,
}

impl StompOptions {
    /// `None` when no broker host is configured.
    pub fn from_settings(settings: &BusSettings) -> Option<Self> {
        let host = settings.host.clone()?;
        Some(Self {
            host,
            port: settings.port,
            login: settings.login.clone(),
            passcode: settings.passcode.clone(),
            connect_timeout: settings.connect_timeout,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect_frame(&self) -> Frame {
        let mut frame = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", self.host.clone())
            .header("heart-beat", "0,0");
        if let Some(login) = &self.login {
            frame = frame.header("login", login.clone());
        }
        if let Some(passcode) = &self.passcode {
            frame = frame.header("passcode", passcode.clone());
        }
        frame
    }
}

type Session = (BufReader<OwnedReadHalf>, OwnedWriteHalf);

async fn open_session(options: &StompOptions) -> Result<Session, BusError> {
    let addr = options.addr();
    let handshake = async {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| BusError::connect(&addr, err))?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(&options.connect_frame().encode())
            .await
            .map_err(|err| BusError::connect(&addr, err))?;

        match read_frame(&mut reader).await {
            Ok(Some(frame)) if frame.command == "CONNECTED" => Ok((reader, write)),
            Ok(Some(frame)) if frame.command == "ERROR" => {
                Err(BusError::connect(&addr, frame.error_message()))
            }
            Ok(Some(frame)) => Err(BusError::connect(
                &addr,
                format!("unexpected `{}` frame during handshake", frame.command),
            )),
            Ok(None) => Err(BusError::connect(&addr, "connection closed during handshake")),
            Err(err) => Err(BusError::connect(&addr, err)),
        }
    };

    match timeout(options.connect_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(BusError::Timeout {
            op: "connect",
            timeout_ms: options.connect_timeout.as_millis(),
        }),
    }
}

/// Publishing side of a STOMP session.
///
/// Writes are serialized through an async mutex. A background task drains
/// broker frames and marks the session closed on ERROR or end of stream.
pub struct StompTransport {
    writer: Mutex<OwnedWriteHalf>,
    open: Arc<AtomicBool>,
    drain: JoinHandle<()>,
}

impl StompTransport {
    pub async fn connect(options: &StompOptions) -> Result<Self, BusError> {
        let (mut reader, writer) = open_session(options).await?;
        let open = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&open);
        let addr = options.addr();
        let drain = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) if frame.command == "ERROR" => {
                        warn!(
                            target = "quire::invalidation::stomp",
                            addr = %addr,
                            message = %frame.error_message(),
                            "broker reported an error"
                        );
                        break;
                    }
                    Ok(Some(frame)) => {
                        debug!(command = %frame.command, "ignoring broker frame");
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(error = %err, "broker stream ended");
                        break;
                    }
                }
            }
            flag.store(false, Ordering::Release);
        });

        Ok(Self {
            writer: Mutex::new(writer),
            open,
            drain,
        })
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), BusError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame.encode())
            .await
            .map_err(BusError::send)?;
        writer.flush().await.map_err(BusError::send)
    }
}

pub fn send_frame(destination: &str, message: &InvalidationMessage) -> Frame {
    let mut frame = Frame::new("SEND")
        .header("destination", destination)
        .header("content-length", message.payload.len().to_string());
    for (name, value) in message.headers() {
        frame = frame.header(name, value);
    }
    frame.body(message.payload.clone())
}

#[async_trait]
impl BusTransport for StompTransport {
    async fn send(&self, destination: &str, message: &InvalidationMessage) -> Result<(), BusError> {
        if !self.is_open() {
            return Err(BusError::Closed);
        }
        self.write_frame(&send_frame(destination, message)).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BusError> {
        self.open.store(false, Ordering::Release);
        let result = self.write_frame(&Frame::new("DISCONNECT")).await;
        let _ = self.writer.lock().await.shutdown().await;
        self.drain.abort();
        result
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

/// Receiving side of a STOMP session subscribed to one destination.
pub struct StompSubscription {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    destination: String,
}

impl StompSubscription {
    pub async fn subscribe(options: &StompOptions, destination: &str) -> Result<Self, BusError> {
        let (reader, mut writer) = open_session(options).await?;
        let frame = Frame::new("SUBSCRIBE")
            .header("id", SUBSCRIPTION_ID)
            .header("destination", destination)
            .header("ack", "auto");
        writer
            .write_all(&frame.encode())
            .await
            .map_err(BusError::send)?;
        Ok(Self {
            reader,
            writer,
            destination: destination.to_string(),
        })
    }
}

#[async_trait]
impl MessageSource for StompSubscription {
    async fn next_message(&mut self) -> Result<Option<InvalidationMessage>, BusError> {
        loop {
            let Some(frame) = read_frame(&mut self.reader).await? else {
                return Ok(None);
            };
            match frame.command.as_str() {
                "MESSAGE" => {
                    let headers = frame
                        .headers
                        .iter()
                        .map(|(name, value)| (name.as_str(), value.as_str()));
                    match InvalidationMessage::from_headers(headers, frame.body.clone()) {
                        Ok(message) => return Ok(Some(message)),
                        Err(err) => {
                            warn!(
                                destination = %self.destination,
                                error = %err,
                                "skipping message without a valid type"
                            );
                        }
                    }
                }
                "ERROR" => return Err(BusError::protocol(frame.error_message())),
                other => debug!(command = other, "ignoring broker frame"),
            }
        }
    }

    async fn close(&mut self) -> Result<(), BusError> {
        let unsubscribe = Frame::new("UNSUBSCRIBE").header("id", SUBSCRIPTION_ID);
        let mut bytes = unsubscribe.encode();
        bytes.extend_from_slice(&Frame::new("DISCONNECT").encode());
        self.writer.write_all(&bytes).await.map_err(BusError::send)?;
        self.writer.shutdown().await.map_err(BusError::send)
    }
}

/// Opens STOMP sessions against one configured broker.
#[derive(Debug, Clone)]
pub struct StompConnector {
    options: StompOptions,
}

impl StompConnector {
    pub fn new(options: StompOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BusConnector for StompConnector {
    fn describe(&self) -> String {
        self.options.addr()
    }

    async fn open(&self) -> Result<Arc<dyn BusTransport>, BusError> {
        Ok(Arc::new(StompTransport::connect(&self.options).await?))
    }

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn MessageSource>, BusError> {
        Ok(Box::new(
            StompSubscription::subscribe(&self.options, destination).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::invalidation::message::MessageType;

    async fn decode(raw: &[u8]) -> Result<Option<Frame>, BusError> {
        let mut reader = raw;
        read_frame(&mut reader).await
    }

    fn options(port: u16) -> StompOptions {
        StompOptions {
            host: "127.0.0.1".to_string(),
            port,
            login: Some("guest".to_string()),
            passcode: Some("secret".to_string()),
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn header_escaping_covers_reserved_characters() {
        let raw = "a:b\\c\nd\re";
        let escaped = escape(raw);
        assert_eq!(escaped, "a\\cb\\\\c\\nd\\re");
        assert_eq!(unescape(&escaped).expect("unescape"), raw);
    }

    #[test]
    fn undefined_escape_is_rejected() {
        assert!(unescape("bad\\t").is_err());
        assert!(unescape("bad\\").is_err());
    }

    #[test]
    fn connect_frame_is_not_escaped() {
        let frame = Frame::new("CONNECT").header("passcode", "a:b");
        let encoded = String::from_utf8(frame.encode()).expect("utf8");
        assert!(encoded.contains("passcode:a:b\n"));
    }

    #[test]
    fn send_frame_carries_message_headers() {
        let message = InvalidationMessage::new(MessageType::Dep, Bytes::new())
            .with_key("quire:GET:/:abc")
            .with_model("article:1");
        let frame = send_frame("/topic/ella", &message);

        assert_eq!(frame.command, "SEND");
        assert_eq!(frame.get("destination"), Some("/topic/ella"));
        assert_eq!(frame.get("content-length"), Some("0"));
        assert_eq!(frame.get("Type"), Some("dep"));
        assert_eq!(frame.get("Key"), Some("quire:GET:/:abc"));
        assert_eq!(frame.get("Model"), Some("article:1"));
    }

    #[tokio::test]
    async fn frame_survives_encoding_with_binary_body() {
        let frame = Frame::new("MESSAGE")
            .header("Key", "quire:GET:/articles/1/:ff")
            .header("content-length", "3")
            .body(Bytes::from_static(&[1, 0, 2]));

        let decoded = decode(&frame.encode()).await.expect("decode").expect("frame");
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn heartbeats_between_frames_are_skipped() {
        let decoded = decode(b"\n\r\nRECEIPT\nreceipt-id:7\n\n\0")
            .await
            .expect("decode")
            .expect("frame");
        assert_eq!(decoded.command, "RECEIPT");
        assert_eq!(decoded.get("receipt-id"), Some("7"));
        assert!(decoded.body.is_empty());
    }

    #[tokio::test]
    async fn oversized_content_length_is_refused_before_allocating() {
        let result = decode(b"MESSAGE\ncontent-length:18446744073709551615\n\n").await;
        assert!(matches!(
            result,
            Err(BusError::FrameTooLarge { part: "body", .. })
        ));
    }

    #[tokio::test]
    async fn unterminated_body_beyond_limit_is_refused() {
        let mut raw = b"MESSAGE\n\n".to_vec();
        raw.resize(raw.len() + MAX_FRAME_BYTES + 16, b'x');
        assert!(matches!(
            decode(&raw).await,
            Err(BusError::FrameTooLarge { part: "body", .. })
        ));
    }

    #[tokio::test]
    async fn overlong_lines_and_header_floods_are_refused() {
        let mut long_line = b"MESSAGE\nKey:".to_vec();
        long_line.resize(long_line.len() + MAX_LINE_BYTES, b'k');
        long_line.extend_from_slice(b"\n\n\0");
        assert!(matches!(
            decode(&long_line).await,
            Err(BusError::FrameTooLarge { part: "line", .. })
        ));

        let mut flood = b"MESSAGE\n".to_vec();
        for n in 0..=MAX_HEADERS {
            flood.extend_from_slice(format!("h{n}:v\n").as_bytes());
        }
        flood.extend_from_slice(b"\n\0");
        assert!(matches!(
            decode(&flood).await,
            Err(BusError::FrameTooLarge { part: "headers", .. })
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        assert!(decode(b"MESSAGE\nType:del\n").await.is_err());
        assert!(decode(b"MESSAGE\ncontent-length:10\n\nabc").await.is_err());
        assert!(decode(b"").await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn transport_handshakes_and_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            let connect = read_frame(&mut reader).await.expect("read").expect("frame");
            write
                .write_all(&Frame::new("CONNECTED").header("version", "1.2").encode())
                .await
                .expect("write");
            let send = read_frame(&mut reader).await.expect("read").expect("frame");
            let disconnect = read_frame(&mut reader).await.expect("read").expect("frame");
            (connect, send, disconnect)
        });

        let transport = StompTransport::connect(&options(port)).await.expect("connect");
        let message = InvalidationMessage::new(MessageType::Del, Bytes::from_static(b"{}"))
            .with_key("article:1")
            .with_model("article");
        transport.send("/topic/ella", &message).await.expect("send");
        transport.close().await.expect("close");

        let (connect, send, disconnect) = broker.await.expect("broker");
        assert_eq!(connect.command, "CONNECT");
        assert_eq!(connect.get("login"), Some("guest"));
        assert_eq!(send.get("destination"), Some("/topic/ella"));
        assert_eq!(send.get("Type"), Some("del"));
        assert_eq!(send.body, Bytes::from_static(b"{}"));
        assert_eq!(disconnect.command, "DISCONNECT");
    }

    #[tokio::test]
    async fn rejected_handshake_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let _ = read_frame(&mut reader).await;
            let _ = write
                .write_all(
                    &Frame::new("ERROR")
                        .header("message", "bad credentials")
                        .encode(),
                )
                .await;
        });

        let err = StompTransport::connect(&options(port))
            .await
            .err()
            .expect("handshake must fail");
        assert!(matches!(err, BusError::Connect { .. }));
        assert!(err.to_string().contains("bad credentials"));
    }

    #[tokio::test]
    async fn subscription_yields_typed_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let _ = read_frame(&mut reader).await;
            write
                .write_all(&Frame::new("CONNECTED").encode())
                .await
                .expect("write");
            let subscribe = read_frame(&mut reader).await.expect("read").expect("frame");
            assert_eq!(subscribe.command, "SUBSCRIBE");

            let mut out = Frame::new("MESSAGE").header("destination", "/topic/ella").encode();
            out.extend(
                Frame::new("MESSAGE")
                    .header("destination", "/topic/ella")
                    .header("Type", "dep")
                    .header("Key", "quire:GET:/:ab\\cc")
                    .header("Model", "article:1")
                    .encode(),
            );
            write.write_all(&out).await.expect("write");
        });

        let mut subscription = StompSubscription::subscribe(&options(port), "/topic/ella")
            .await
            .expect("subscribe");
        let message = subscription
            .next_message()
            .await
            .expect("read")
            .expect("message");

        assert_eq!(message.kind, MessageType::Dep);
        assert_eq!(message.key.as_deref(), Some("quire:GET:/:ab\\cc"));
        assert_eq!(message.model.as_deref(), Some("article:1"));
    }
}
