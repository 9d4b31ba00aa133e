use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tungstenite::Message;

use crate::client::EngineClient;
use crate::config::EngineConfig;
use crate::packet::{
    self, OpenPacket, Packet, PacketData, PacketId, ServerErrorPacket,
};
use crate::transports::polling::PollingTransport;
use crate::transports::websocket::{WebsocketTransport, WsStream};

use super::{Command, EngineState};

/// Fallback when the server hands out a zero interval, mirroring the default
/// of the reference server.
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;

/// What the I/O tasks report back into the serial loop. Every event is
/// stamped with the session generation it belongs to, so completions of a
/// session that has since been reset fall on the floor.
#[derive(Debug)]
struct Event {
    generation: u64,
    kind: EventKind,
}

#[derive(Debug)]
enum EventKind {
    /// A long poll finished; on success the body is already split into frames.
    PollDone(Result<Vec<String>, crate::Error>),
    PostDone(Result<(), crate::Error>),
    WsOpen(Box<WebsocketTransport>),
    WsConnectFailed(String),
    WsText(String),
    WsBinary(Bytes),
    WsClosed { error: Option<String> },
    PingTick,
}

/// A user write deferred while the websocket probe is in flight.
#[derive(Debug)]
struct WriteRequest {
    msg: String,
    kind: PacketId,
    binaries: Vec<Bytes>,
}

/// The single consumer behind an [`super::Engine`] handle. Commands and
/// network events funnel through one `select!` loop, which serializes every
/// mutation of the queues and flags. The loop runs until the last handle is
/// dropped.
pub(crate) struct Worker {
    config: EngineConfig,
    client: Arc<dyn EngineClient>,
    state: Arc<EngineState>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    /// Bumped on every reset; stale events carry an older stamp.
    generation: u64,
    http: Option<PollingTransport>,
    ws: Option<WebsocketTransport>,

    /// Wire-encoded frames waiting for the next POST.
    post_wait: VecDeque<String>,
    /// User writes buffered during the probe window.
    probe_wait: VecDeque<WriteRequest>,
    waiting_for_poll: bool,
    waiting_for_post: bool,
    fast_upgrade: bool,

    ping_interval: Duration,
    pongs_missed: u64,
    pongs_missed_max: u64,
    ping_task: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(
        config: EngineConfig,
        client: Arc<dyn EngineClient>,
        state: Arc<EngineState>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Worker {
            config,
            client,
            state,
            commands,
            events_tx,
            events_rx,
            generation: 0,
            http: None,
            ws: None,
            post_wait: VecDeque::new(),
            probe_wait: VecDeque::new(),
            waiting_for_poll: false,
            waiting_for_post: false,
            fast_upgrade: false,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            pongs_missed: 0,
            pongs_missed_max: 0,
            ping_task: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => self.connect().await,
                    Some(Command::Disconnect(reason)) => self.disconnect(&reason).await,
                    Some(Command::Write { msg, kind, binaries }) => {
                        self.handle_write(msg, kind, binaries).await;
                    }
                    None => {
                        // last handle dropped
                        if self.state.connected() && !self.state.closed() {
                            self.disconnect("Disconnect").await;
                        }
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        if let Some(handle) = self.ping_task.take() {
            handle.abort();
        }
    }

    async fn handle_event(&mut self, event: Event) {
        if event.generation != self.generation {
            return;
        }
        // after close-out only the websocket teardown is still of interest
        if self.state.invalidated() && !matches!(event.kind, EventKind::WsClosed { .. }) {
            return;
        }

        match event.kind {
            EventKind::PollDone(result) => self.handle_poll_done(result).await,
            EventKind::PostDone(result) => self.handle_post_done(result).await,
            EventKind::WsOpen(transport) => self.websocket_did_connect(*transport).await,
            EventKind::WsConnectFailed(reason) => self.websocket_connect_failed(&reason).await,
            EventKind::WsText(text) => self.dispatch_frame(&text, false).await,
            EventKind::WsBinary(data) => self.handle_ws_binary(data).await,
            EventKind::WsClosed { error } => self.websocket_did_disconnect(error).await,
            EventKind::PingTick => self.send_ping().await,
        }
    }

    // lifecycle

    async fn connect(&mut self) {
        if self.state.connected() {
            self.disconnect("reconnect").await;
        }

        if let Err(err) = self.reset_engine() {
            error!("could not set up the http session: {err}");
            self.client.engine_did_error(err.to_string()).await;
            return;
        }

        if self.config.force_websockets {
            self.state.set_polling(false);
            self.open_websocket();
        } else {
            debug!("starting the polling handshake");
            self.waiting_for_poll = true;
            self.start_poll_request();
        }
    }

    fn reset_engine(&mut self) -> Result<(), crate::Error> {
        self.generation += 1;
        self.state.set_closed(false);
        self.state.set_connected(false);
        self.state.set_invalidated(false);
        self.state.set_polling(true);
        self.state.set_probing(false);
        self.state.set_websocket(false);
        self.state.set_sid(String::new());
        self.fast_upgrade = false;
        self.waiting_for_poll = false;
        self.waiting_for_post = false;
        self.pongs_missed = 0;
        self.http = Some(PollingTransport::new(&self.config)?);
        Ok(())
    }

    fn close_out_engine(&mut self) {
        self.state.set_sid(String::new());
        self.state.set_closed(true);
        self.state.set_invalidated(true);
        self.state.set_connected(false);
        self.state.set_polling(false);
        self.state.set_websocket(false);

        if let Some(handle) = self.ping_task.take() {
            handle.abort();
        }
        if let Some(mut ws) = self.ws.take() {
            tokio::spawn(async move {
                let _ = ws.close().await;
            });
        }
        // requests already in flight keep their own client handle and
        // complete as no-ops; nothing new can start
        self.http = None;
    }

    async fn disconnect(&mut self, reason: &str) {
        debug!("engine is being closed: {reason}");

        if !self.state.connected() {
            self.close_out_engine();
            return;
        }
        if self.state.closed() {
            self.close_out_engine();
            self.client.engine_did_close(reason.to_owned()).await;
            return;
        }

        if self.state.websocket() {
            debug!("sending close frame over websocket");
            self.send_ws_text(String::from(PacketId::Close.digit())).await;
            // the close notification follows from the websocket teardown
            self.close_out_engine();
        } else {
            debug!("flushing close packet over polling");
            self.post_wait.push_back(packet::encode_text_frame(
                PacketId::Close,
                "",
                self.config.double_encode_utf8,
            ));
            let body = packet::encode_payload(self.post_wait.drain(..));
            self.spawn_post(body);
            self.close_out_engine();
            self.client.engine_did_close(reason.to_owned()).await;
        }
    }

    async fn did_error(&mut self, reason: &str) {
        error!("engine error: {reason}");
        self.client.engine_did_error(reason.to_owned()).await;
        self.disconnect(reason).await;
    }

    // writes

    async fn handle_write(&mut self, msg: String, kind: PacketId, binaries: Vec<Bytes>) {
        if !self.state.connected() || self.state.closed() {
            warn!("dropping a write on an unconnected engine");
            return;
        }
        self.write_message(msg, kind, binaries).await;
    }

    /// The transport decision for one write: the authoritative websocket if
    /// there is one, polling while no probe runs, the probe buffer otherwise.
    async fn write_message(&mut self, msg: String, kind: PacketId, binaries: Vec<Bytes>) {
        if self.state.websocket() {
            self.send_websocket_message(msg, kind, binaries).await;
        } else if !self.state.probing() {
            self.send_poll_message(msg, kind, binaries).await;
        } else {
            self.probe_wait.push_back(WriteRequest {
                msg,
                kind,
                binaries,
            });
        }
    }

    async fn send_poll_message(&mut self, msg: String, kind: PacketId, binaries: Vec<Bytes>) {
        self.post_wait.push_back(packet::encode_text_frame(
            kind,
            &msg,
            self.config.double_encode_utf8,
        ));
        for data in binaries {
            self.post_wait.push_back(packet::encode_binary_frame(&data));
        }
        if !self.waiting_for_post {
            self.flush_post_wait().await;
        }
    }

    async fn send_websocket_message(&mut self, msg: String, kind: PacketId, binaries: Vec<Bytes>) {
        let mut frame = String::with_capacity(msg.len() + 1);
        frame.push(kind.digit());
        frame.push_str(&msg);
        self.send_ws_text(frame).await;
        for data in binaries {
            self.send_ws_binary(data).await;
        }
    }

    // polling

    /// Arms the next long poll unless one is running or the websocket has
    /// taken over.
    fn do_poll(&mut self) {
        if self.state.websocket()
            || self.waiting_for_poll
            || !self.state.connected()
            || self.state.closed()
        {
            return;
        }
        self.waiting_for_poll = true;
        self.start_poll_request();
    }

    fn start_poll_request(&mut self) {
        let Some(http) = self.http.clone() else {
            return;
        };
        let url = match self.config.url_polling(&self.state.sid()) {
            Ok(url) => url,
            Err(err) => {
                error!("could not build the polling url: {err}");
                return;
            }
        };

        let events = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            // split into frames here so the serial loop gets ready packets
            let result = http.poll(url).await.map(|body| {
                match packet::decode_payload(&body) {
                    Ok(frames) => frames,
                    // not length-prefixed at all, let the dispatcher decide
                    Err(_) => vec![body],
                }
            });
            let _ = events.send(Event {
                generation,
                kind: EventKind::PollDone(result),
            });
        });
    }

    async fn handle_poll_done(&mut self, result: Result<Vec<String>, crate::Error>) {
        self.waiting_for_poll = false;
        match result {
            Ok(frames) => {
                let double_decode = self.config.double_encode_utf8;
                for frame in frames {
                    self.dispatch_frame(&frame, double_decode).await;
                    if self.state.closed() || self.state.invalidated() {
                        return;
                    }
                }
                if self.fast_upgrade {
                    self.do_fast_upgrade().await;
                } else {
                    self.do_poll();
                }
            }
            Err(err) => self.handle_polling_failed(&err.to_string()).await,
        }
    }

    async fn handle_polling_failed(&mut self, reason: &str) {
        if self.state.polling() && !self.state.closed() && !self.state.invalidated() {
            self.did_error(reason).await;
        }
    }

    async fn flush_post_wait(&mut self) {
        if !self.state.connected() || self.post_wait.is_empty() {
            return;
        }
        if self.state.websocket() {
            self.flush_post_wait_to_websocket().await;
            return;
        }
        if self.waiting_for_post {
            return;
        }

        let body = packet::encode_payload(self.post_wait.drain(..));
        self.waiting_for_post = true;
        self.spawn_post(body);
    }

    /// After the upgrade the leftover polling frames go out over the
    /// websocket as raw strings, in their queued order.
    async fn flush_post_wait_to_websocket(&mut self) {
        let frames: Vec<String> = self.post_wait.drain(..).collect();
        for frame in frames {
            self.send_ws_text(frame).await;
        }
    }

    fn spawn_post(&mut self, body: String) {
        let Some(http) = self.http.clone() else {
            return;
        };
        let url = match self.config.url_polling(&self.state.sid()) {
            Ok(url) => url,
            Err(err) => {
                error!("could not build the polling url: {err}");
                return;
            }
        };

        let events = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = http.post(url, body).await;
            let _ = events.send(Event {
                generation,
                kind: EventKind::PostDone(result),
            });
        });
    }

    async fn handle_post_done(&mut self, result: Result<(), crate::Error>) {
        self.waiting_for_post = false;
        match result {
            Ok(()) => {
                if !self.post_wait.is_empty() {
                    self.flush_post_wait().await;
                }
                self.do_poll();
            }
            Err(err) => self.handle_polling_failed(&err.to_string()).await,
        }
    }

    // websocket

    fn open_websocket(&mut self) {
        let url = match self.config.url_websocket(&self.state.sid()) {
            Ok(url) => url,
            Err(err) => {
                error!("could not build the websocket url: {err}");
                return;
            }
        };
        let headers = match self.config.request_headers() {
            Ok(headers) => headers,
            Err(err) => {
                error!("could not build the websocket headers: {err}");
                return;
            }
        };
        let tls = match self.config.tls_connector() {
            Ok(tls) => tls,
            Err(err) => {
                error!("could not build the tls connector: {err}");
                return;
            }
        };

        debug!("opening websocket to {url}");
        let events = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            match WebsocketTransport::connect(url, headers, tls).await {
                Ok((transport, stream)) => {
                    tokio::spawn(run_websocket_reader(stream, events.clone(), generation));
                    let _ = events.send(Event {
                        generation,
                        kind: EventKind::WsOpen(Box::new(transport)),
                    });
                }
                Err(err) => {
                    let _ = events.send(Event {
                        generation,
                        kind: EventKind::WsConnectFailed(err.to_string()),
                    });
                }
            }
        });
    }

    async fn websocket_did_connect(&mut self, transport: WebsocketTransport) {
        self.ws = Some(transport);

        if self.config.force_websockets {
            self.state.set_connected(true);
            self.state.set_probing(false);
            self.state.set_polling(false);
            self.state.set_websocket(true);
        } else {
            debug!("probing websocket");
            self.state.set_probing(true);
            let mut frame = String::from(PacketId::Ping.digit());
            frame.push_str("probe");
            self.send_ws_text(frame).await;
        }
    }

    async fn websocket_connect_failed(&mut self, reason: &str) {
        if self.config.force_websockets {
            self.did_error(reason).await;
        } else {
            // the probe never got off the ground, polling carries on
            debug!("websocket probe failed to connect: {reason}");
        }
    }

    async fn websocket_did_disconnect(&mut self, error: Option<String>) {
        self.state.set_probing(false);
        self.ws = None;

        if self.state.closed() {
            self.client.engine_did_close("Disconnect".to_owned()).await;
            return;
        }

        if self.state.websocket() {
            self.state.set_connected(false);
            self.state.set_websocket(false);
            match error {
                Some(reason) => self.did_error(&reason).await,
                None => self.client.engine_did_close("Disconnect".to_owned()).await,
            }
        } else {
            // the probe died, replay what was held back onto polling
            self.flush_probe_wait().await;
        }
    }

    async fn handle_ws_binary(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        // one leading byte of framing
        self.dispatch_packet(Packet::binary(PacketId::Message, data.slice(1..)))
            .await;
    }

    async fn send_ws_text(&mut self, frame: String) {
        if let Some(ws) = self.ws.as_mut() {
            if let Err(err) = ws.send_text(frame).await {
                // the reader will surface the disconnect
                warn!("websocket send failed: {err}");
            }
        }
    }

    async fn send_ws_binary(&mut self, data: Bytes) {
        if let Some(ws) = self.ws.as_mut() {
            if let Err(err) = ws.send_binary(data).await {
                warn!("websocket send failed: {err}");
            }
        }
    }

    // upgrade

    /// The probe came back. Ask the server to finish the outstanding poll
    /// with a NOOP; the completion of that poll performs the fast upgrade.
    async fn upgrade_transport(&mut self) {
        if !self.state.probing() || self.ws.is_none() {
            return;
        }
        debug!("upgrading transport to websocket");
        self.fast_upgrade = true;
        self.post_wait.push_back(packet::encode_text_frame(
            PacketId::Noop,
            "",
            self.config.double_encode_utf8,
        ));
        if !self.waiting_for_post {
            self.flush_post_wait().await;
        }
    }

    async fn do_fast_upgrade(&mut self) {
        if self.waiting_for_poll {
            warn!("a poll is still in flight during the fast upgrade");
        }
        debug!("switching to websocket");
        self.send_ws_text(String::from(PacketId::Upgrade.digit()))
            .await;
        self.fast_upgrade = false;
        self.state.set_websocket(true);
        self.state.set_polling(false);
        self.state.set_probing(false);
        self.flush_probe_wait().await;
    }

    /// Replays the writes deferred during the probe through whichever
    /// transport is authoritative now, then drains the polling queue.
    async fn flush_probe_wait(&mut self) {
        debug!("flushing probe wait");
        while let Some(request) = self.probe_wait.pop_front() {
            self.write_message(request.msg, request.kind, request.binaries)
                .await;
        }
        if !self.post_wait.is_empty() {
            if self.state.websocket() {
                self.flush_post_wait_to_websocket().await;
            } else {
                self.flush_post_wait().await;
            }
        }
    }

    // heartbeat

    async fn send_ping(&mut self) {
        if !self.state.connected() {
            return;
        }
        if self.pongs_missed > self.pongs_missed_max {
            warn!("ping timeout, closing the engine");
            self.client.engine_did_close("Ping timeout".to_owned()).await;
            self.close_out_engine();
            return;
        }
        self.pongs_missed += 1;
        self.write_message(String::new(), PacketId::Ping, Vec::new())
            .await;
    }

    async fn handle_pong(&mut self, body: &str) {
        if body == "probe" {
            self.upgrade_transport().await;
        } else {
            self.pongs_missed = 0;
        }
    }

    fn start_ping_timer(&mut self) {
        if let Some(handle) = self.ping_task.take() {
            handle.abort();
        }
        let events = self.events_tx.clone();
        let generation = self.generation;
        let interval = self.ping_interval;
        self.ping_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let tick = Event {
                    generation,
                    kind: EventKind::PingTick,
                };
                if events.send(tick).is_err() {
                    break;
                }
            }
        }));
    }

    // dispatch

    async fn dispatch_frame(&mut self, frame: &str, double_decode: bool) {
        match packet::decode_frame(frame, double_decode) {
            Ok(packet) => self.dispatch_packet(packet).await,
            Err(_) => {
                if let Ok(err) = serde_json::from_str::<ServerErrorPacket>(frame) {
                    self.did_error(&err.message).await;
                } else {
                    warn!("discarding an unparseable frame: {frame:?}");
                }
            }
        }
    }

    async fn dispatch_packet(&mut self, packet: Packet) {
        match packet.id {
            PacketId::Message => match packet.data {
                PacketData::Text(text) => self.client.parse_engine_message(text).await,
                PacketData::Binary(data) => self.client.parse_engine_binary_data(data).await,
            },
            PacketId::Noop => self.do_poll(),
            PacketId::Pong => {
                if let PacketData::Text(body) = &packet.data {
                    let body = body.clone();
                    self.handle_pong(&body).await;
                }
            }
            PacketId::Open => {
                if let PacketData::Text(body) = &packet.data {
                    let body = body.clone();
                    self.handle_open(&body).await;
                }
            }
            PacketId::Close => {
                debug!("server closed the connection");
                self.client.engine_did_close("Disconnect".to_owned()).await;
            }
            PacketId::Ping | PacketId::Upgrade => {
                // revision 3 servers never send these downstream
                debug!("ignoring a server packet of kind {:?}", packet.id);
            }
        }
    }

    async fn handle_open(&mut self, body: &str) {
        let open: OpenPacket = match serde_json::from_str(body) {
            Ok(open) => open,
            Err(err) => {
                self.did_error(&format!("invalid handshake: {err}")).await;
                return;
            }
        };
        debug!("engine open, sid {}", open.sid);

        let interval = if open.ping_interval == 0 {
            DEFAULT_PING_INTERVAL_MS
        } else {
            open.ping_interval
        };
        self.ping_interval = Duration::from_millis(interval);
        self.pongs_missed_max = pongs_missed_max(interval, open.ping_timeout);
        self.pongs_missed = 0;

        self.state.set_sid(open.sid);
        self.state.set_connected(true);

        let can_upgrade = open
            .upgrades
            .iter()
            .any(|upgrade| upgrade.eq_ignore_ascii_case("websocket"));

        self.client.engine_did_open("Connect".to_owned()).await;
        self.start_ping_timer();

        if can_upgrade
            && !self.config.force_polling
            && !self.config.force_websockets
            && !self.state.websocket()
        {
            self.open_websocket();
        }
        if !self.config.force_websockets {
            self.do_poll();
        }
    }
}

/// How many pings may go unanswered before the connection counts as dead.
fn pongs_missed_max(ping_interval: u64, ping_timeout: u64) -> u64 {
    ping_timeout / ping_interval.max(1)
}

/// Pumps a websocket receiver into the worker loop. Sends exactly one
/// `WsClosed` when the stream ends, carrying the error when there was one.
async fn run_websocket_reader(
    mut stream: WsStream,
    events: mpsc::UnboundedSender<Event>,
    generation: u64,
) {
    let mut error: Option<String> = None;

    while let Some(message) = stream.next().await {
        let kind = match message {
            Ok(Message::Text(text)) => EventKind::WsText(text),
            Ok(Message::Binary(data)) => EventKind::WsBinary(Bytes::from(data)),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                error = Some(err.to_string());
                break;
            }
        };
        if events.send(Event { generation, kind }).is_err() {
            return;
        }
    }

    let _ = events.send(Event {
        generation,
        kind: EventKind::WsClosed { error },
    });
}
