//! The two wire transports an engine can drive: HTTP long-polling and
//! websockets. Both are thin I/O shells; queueing, framing and the upgrade
//! dance live in the engine itself.
pub mod polling;
pub mod websocket;

pub use polling::PollingTransport;
pub use websocket::WebsocketTransport;
