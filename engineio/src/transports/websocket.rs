use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::HeaderMap;
use native_tls::TlsConnector;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tungstenite::{client::IntoClientRequest, Message};
use url::Url;

use crate::error::Result;
use crate::packet::PacketId;

pub(crate) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub(crate) type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The sending half of a websocket connection. The receiving half is handed
/// back to the caller, which pumps it from a reader task.
pub struct WebsocketTransport {
    sink: WsSink,
}

impl WebsocketTransport {
    /// Opens a websocket to `url`, carrying `headers` on the upgrade request
    /// and honoring a custom TLS configuration for `wss` endpoints.
    pub(crate) async fn connect(
        url: Url,
        headers: HeaderMap,
        tls: Option<TlsConnector>,
    ) -> Result<(Self, WsStream)> {
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().extend(headers);

        let (stream, _) = match tls {
            Some(tls) => {
                connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)))
                    .await?
            }
            None => connect_async(request).await?,
        };
        let (sink, stream) = stream.split();

        Ok((WebsocketTransport { sink }, stream))
    }

    /// Sends one text frame, which is one packet on this transport.
    pub(crate) async fn send_text(&mut self, frame: String) -> Result<()> {
        self.sink.send(Message::Text(frame)).await?;
        Ok(())
    }

    /// Sends one binary attachment, prefixed with its framing byte.
    pub(crate) async fn send_binary(&mut self, data: Bytes) -> Result<()> {
        // raw type byte, not the ascii digit used on the text path
        let mut framed = BytesMut::with_capacity(data.len() + 1);
        framed.put_u8(PacketId::Message as u8);
        framed.put(data);
        self.sink.send(Message::Binary(framed.to_vec())).await?;
        Ok(())
    }

    /// Performs the closing handshake on the sending half.
    pub(crate) async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for WebsocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WebsocketTransport")
    }
}
