use async_trait::async_trait;
use bytes::Bytes;

/// The contract between an engine and the layer above it, usually the
/// `socket.io` client that multiplexes namespaces over the connection.
///
/// The engine holds an `Arc<dyn EngineClient>` and never the other way
/// around; the manager that owns the engine also owns the client, so there
/// is no ownership cycle to break.
///
/// All callbacks are delivered from the engine's serial handler context, in
/// the order the triggering events arrived from the network.
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    /// One decoded text message, the leading packet type already stripped.
    async fn parse_engine_message(&self, msg: String);

    /// One raw binary payload, the websocket framing byte already stripped.
    async fn parse_engine_binary_data(&self, data: Bytes);

    /// The engine holds a valid session id and is ready for traffic.
    async fn engine_did_open(&self, reason: String);

    /// The engine is gone for good. A new engine is needed to reconnect.
    async fn engine_did_close(&self, reason: String);

    /// Something went wrong that a reconnect may fix.
    async fn engine_did_error(&self, reason: String);
}
