//! In-process test doubles: a recording [`EngineClient`] and a mock server
//! that speaks just enough HTTP and websocket for the engine under test.
//! Every long poll parks until the test queues a reply, which gives the
//! tests full control over the interleaving.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use rust_engineio_v3::EngineClient;

const WAIT: Duration = Duration::from_secs(10);

// recording client

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message(String),
    Binary(Bytes),
    Open(String),
    Close(String),
    Error(String),
}

pub struct RecordingClient {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

pub fn recording_client() -> (Arc<RecordingClient>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingClient { tx }), rx)
}

#[async_trait]
impl EngineClient for RecordingClient {
    async fn parse_engine_message(&self, msg: String) {
        let _ = self.tx.send(ClientEvent::Message(msg));
    }

    async fn parse_engine_binary_data(&self, data: Bytes) {
        let _ = self.tx.send(ClientEvent::Binary(data));
    }

    async fn engine_did_open(&self, reason: String) {
        let _ = self.tx.send(ClientEvent::Open(reason));
    }

    async fn engine_did_close(&self, reason: String) {
        let _ = self.tx.send(ClientEvent::Close(reason));
    }

    async fn engine_did_error(&self, reason: String) {
        let _ = self.tx.send(ClientEvent::Error(reason));
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("client channel closed")
}

/// Wraps one frame in the polling payload framing: char count, colon, frame.
pub fn frame(frame: &str) -> String {
    format!("{}:{}", frame.chars().count(), frame)
}

// mock server

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsRecord {
    Connected,
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

#[derive(Debug)]
enum WsDirective {
    Text(String),
    Binary(Vec<u8>),
    Drop,
}

/// A server end that answers polling GETs from a scripted reply queue,
/// records every POST body, and accepts websocket upgrades on the same
/// port, recording frames and sending scripted ones back.
pub struct MockServer {
    addr: SocketAddr,
    posts: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<String>,
    ws_records: mpsc::UnboundedReceiver<WsRecord>,
    ws_directives: mpsc::UnboundedSender<WsDirective>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (posts_tx, posts_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (directives_tx, directives_rx) = mpsc::unbounded_channel();

        let replies_rx = Arc::new(Mutex::new(replies_rx));
        let directives_rx = Arc::new(Mutex::new(directives_rx));

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    stream,
                    posts_tx.clone(),
                    Arc::clone(&replies_rx),
                    records_tx.clone(),
                    Arc::clone(&directives_rx),
                ));
            }
        });

        MockServer {
            addr,
            posts: posts_rx,
            replies: replies_tx,
            ws_records: records_rx,
            ws_directives: directives_tx,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    /// Queues the body for the next GET; an already parked poll completes.
    pub fn reply(&self, body: &str) {
        self.replies.send(body.to_owned()).unwrap();
    }

    /// Queues an OPEN packet built from the handshake json.
    pub fn reply_open(&self, json: &str) {
        self.reply(&frame(&format!("0{json}")));
    }

    pub async fn next_post(&mut self) -> String {
        tokio::time::timeout(WAIT, self.posts.recv())
            .await
            .expect("timed out waiting for a POST")
            .expect("server is gone")
    }

    pub async fn next_ws(&mut self) -> WsRecord {
        tokio::time::timeout(WAIT, self.ws_records.recv())
            .await
            .expect("timed out waiting for a websocket record")
            .expect("server is gone")
    }

    /// The next websocket text frame, skipping heartbeat pings.
    pub async fn next_ws_text(&mut self) -> String {
        loop {
            match self.next_ws().await {
                WsRecord::Text(text) if text == "2" => continue,
                WsRecord::Text(text) => return text,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    pub fn ws_send(&self, text: &str) {
        self.ws_directives
            .send(WsDirective::Text(text.to_owned()))
            .unwrap();
    }

    pub fn ws_send_binary(&self, data: Vec<u8>) {
        self.ws_directives.send(WsDirective::Binary(data)).unwrap();
    }

    /// Tears the websocket connection down without a closing handshake.
    pub fn ws_drop(&self) {
        self.ws_directives.send(WsDirective::Drop).unwrap();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    posts: mpsc::UnboundedSender<String>,
    replies: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    records: mpsc::UnboundedSender<WsRecord>,
    directives: Arc<Mutex<mpsc::UnboundedReceiver<WsDirective>>>,
) {
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let header_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos;
            }
            let mut chunk = [0u8; 1024];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();

        if head.to_ascii_lowercase().contains("sec-websocket-key") {
            let rewound = Rewind {
                prefix: buf,
                offset: 0,
                inner: stream,
            };
            let Ok(websocket) = tokio_tungstenite::accept_async(rewound).await else {
                return;
            };
            serve_websocket(websocket, records, directives).await;
            return;
        }

        let mut content_length = 0usize;
        for line in head.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let body_start = header_end + 4;
        while buf.len() < body_start + content_length {
            let mut chunk = [0u8; 1024];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body = String::from_utf8_lossy(&buf[body_start..body_start + content_length]).to_string();
        buf.drain(..body_start + content_length);

        let reply = if head.starts_with("GET") {
            // park the long poll until the test scripts a reply
            let mut replies = replies.lock().await;
            match replies.recv().await {
                Some(reply) => reply,
                None => return,
            }
        } else {
            let _ = posts.send(body);
            "ok".to_owned()
        };

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\n\r\n{}",
            reply.len(),
            reply
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn serve_websocket(
    mut websocket: tokio_tungstenite::WebSocketStream<Rewind>,
    records: mpsc::UnboundedSender<WsRecord>,
    directives: Arc<Mutex<mpsc::UnboundedReceiver<WsDirective>>>,
) {
    let _ = records.send(WsRecord::Connected);
    let mut directives = directives.lock().await;

    loop {
        tokio::select! {
            message = websocket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = records.send(WsRecord::Text(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = records.send(WsRecord::Binary(data));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    let _ = records.send(WsRecord::Closed);
                    return;
                }
            },
            directive = directives.recv() => match directive {
                Some(WsDirective::Text(text)) => {
                    let _ = websocket.send(Message::Text(text)).await;
                }
                Some(WsDirective::Binary(data)) => {
                    let _ = websocket.send(Message::Binary(data)).await;
                }
                Some(WsDirective::Drop) | None => {
                    let _ = records.send(WsRecord::Closed);
                    return;
                }
            },
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A stream that replays the bytes already consumed while sniffing the
/// request, so the websocket handshake can re-read them.
struct Rewind {
    prefix: Vec<u8>,
    offset: usize,
    inner: TcpStream,
}

impl AsyncRead for Rewind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let n = (this.prefix.len() - this.offset).min(buf.remaining());
            buf.put_slice(&this.prefix[this.offset..this.offset + n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
