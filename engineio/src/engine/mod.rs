mod worker;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use bytes::Bytes;
use native_tls::TlsConnector;
use tokio::sync::mpsc;
use url::Url;

use crate::client::EngineClient;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::header::HeaderMap;
use crate::packet::PacketId;

use worker::Worker;

/// The instructions an [`Engine`] handle forwards to its worker. Posting a
/// command is the only way to touch the write queues, which is what makes
/// write ordering trivial to reason about.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect(String),
    Write {
        msg: String,
        kind: PacketId,
        binaries: Vec<Bytes>,
    },
}

/// Connection state shared between the engine handle and its worker. The
/// worker is the only writer; handles on other tasks observe the flags with
/// acquire loads.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    connected: AtomicBool,
    closed: AtomicBool,
    invalidated: AtomicBool,
    polling: AtomicBool,
    websocket: AtomicBool,
    probing: AtomicBool,
    sid: RwLock<String>,
}

macro_rules! state_flag {
    ($get:ident, $set:ident, $field:ident) => {
        pub(crate) fn $get(&self) -> bool {
            self.$field.load(Ordering::Acquire)
        }

        pub(crate) fn $set(&self, value: bool) {
            self.$field.store(value, Ordering::Release);
        }
    };
}

impl EngineState {
    state_flag!(connected, set_connected, connected);
    state_flag!(closed, set_closed, closed);
    state_flag!(invalidated, set_invalidated, invalidated);
    state_flag!(polling, set_polling, polling);
    state_flag!(websocket, set_websocket, websocket);
    state_flag!(probing, set_probing, probing);

    pub(crate) fn sid(&self) -> String {
        self.sid.read().map(|sid| sid.clone()).unwrap_or_default()
    }

    pub(crate) fn set_sid(&self, sid: String) {
        if let Ok(mut guard) = self.sid.write() {
            *guard = sid;
        }
    }
}

/// An `engine.io` connection to one server: a single logical packet stream
/// multiplexed over HTTP long-polling and websockets.
///
/// The handle is cheap to clone; all clones drive the same connection. The
/// actual work happens on a dedicated worker task which processes commands
/// and network events strictly in order. When the last handle is dropped the
/// worker disconnects and exits.
#[derive(Clone, Debug)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<EngineState>,
}

impl Engine {
    /// Opens the connection. When the engine is already connected this tears
    /// the old session down first and starts over.
    pub fn connect(&self) -> Result<()> {
        self.send_command(Command::Connect)
    }

    /// Closes the connection, notifying the server on the way out. The
    /// engine is terminal afterwards.
    pub fn disconnect(&self, reason: &str) -> Result<()> {
        self.send_command(Command::Disconnect(reason.to_owned()))
    }

    /// Sends one message packet, followed by its binary attachments.
    pub fn send(&self, msg: String, binaries: Vec<Bytes>) -> Result<()> {
        self.write(msg, PacketId::Message, binaries)
    }

    /// Sends one packet of an arbitrary kind. Writes submitted in order are
    /// transmitted in that order, even across a transport upgrade.
    pub fn write(&self, msg: String, kind: PacketId, binaries: Vec<Bytes>) -> Result<()> {
        self.send_command(Command::Write {
            msg,
            kind,
            binaries,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed()
    }

    /// True while HTTP long-polling carries the traffic.
    pub fn is_polling(&self) -> bool {
        self.state.polling()
    }

    /// True once the websocket is the authoritative transport.
    pub fn is_websocket(&self) -> bool {
        self.state.websocket()
    }

    /// The session id assigned by the server, empty before the handshake.
    pub fn sid(&self) -> String {
        self.state.sid()
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::FailedToEmit("the engine worker is gone".to_owned()))
    }
}

/// Builder for [`Engine`] instances carrying the recognized option set.
///
/// ```no_run
/// use std::sync::Arc;
/// use rust_engineio_v3::{Engine, EngineBuilder};
/// use url::Url;
///
/// # fn client() -> Arc<dyn rust_engineio_v3::EngineClient> { unimplemented!() }
/// # async fn run() {
/// let engine: Engine = EngineBuilder::new(Url::parse("http://localhost:4201").unwrap())
///     .connect_param("token", "secret")
///     .build(client());
/// engine.connect().unwrap();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(url: Url) -> Self {
        EngineBuilder {
            config: EngineConfig::new(url),
        }
    }

    /// Overrides the request path, `/engine.io/` by default.
    pub fn path<T: Into<String>>(mut self, path: T) -> Self {
        self.config.path = path.into();
        self
    }

    /// Appends one key/value pair to the query string of both transports.
    pub fn connect_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.connect_params.push((key.into(), value.into()));
        self
    }

    /// Adds a cookie in `name=value` form.
    pub fn cookie<T: Into<String>>(mut self, cookie: T) -> Self {
        self.config.cookies.push(cookie.into());
        self
    }

    /// Extra headers for polling requests and the websocket upgrade.
    pub fn extra_headers(mut self, headers: HeaderMap) -> Self {
        self.config.extra_headers = headers;
        self
    }

    /// Toggles the Latin-1-of-UTF-8 double encoding, on by default.
    pub fn double_encode_utf8(mut self, enabled: bool) -> Self {
        self.config.double_encode_utf8 = enabled;
        self
    }

    /// Never upgrade away from long-polling.
    pub fn force_polling(mut self) -> Self {
        self.config.force_polling = true;
        self
    }

    /// Skip polling entirely and connect via websocket from the start.
    pub fn force_websockets(mut self) -> Self {
        self.config.force_websockets = true;
        self
    }

    /// Force `https`/`wss` regardless of the base URL scheme.
    pub fn secure(mut self, secure: bool) -> Self {
        self.config.secure = secure;
        self
    }

    /// Custom TLS configuration, e.g. with a pinned certificate.
    pub fn tls_config(mut self, tls_config: TlsConnector) -> Self {
        self.config.tls_config = Some(tls_config);
        self
    }

    /// Accept self-signed server certificates.
    pub fn self_signed(mut self, self_signed: bool) -> Self {
        self.config.self_signed = self_signed;
        self
    }

    /// Runs the polling session on a preconfigured http client instead of
    /// building one from the other options.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.config.http_client = Some(client);
        self
    }

    /// Spawns the engine worker and returns the handle. Must be called from
    /// within a tokio runtime.
    pub fn build(self, client: Arc<dyn EngineClient>) -> Engine {
        let state = Arc::new(EngineState::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = Worker::new(self.config, client, Arc::clone(&state), command_rx);
        tokio::spawn(worker.run());

        Engine {
            commands: command_tx,
            state,
        }
    }
}
