use std::convert::TryFrom;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Enumeration of the `engine.io` packet types.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketId {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl PacketId {
    /// The single ascii digit that leads every frame on the wire.
    pub fn digit(self) -> char {
        (b'0' + self as u8) as char
    }
}

impl TryFrom<char> for PacketId {
    type Error = Error;
    fn try_from(c: char) -> Result<Self> {
        match c {
            '0' => Ok(PacketId::Open),
            '1' => Ok(PacketId::Close),
            '2' => Ok(PacketId::Ping),
            '3' => Ok(PacketId::Pong),
            '4' => Ok(PacketId::Message),
            '5' => Ok(PacketId::Upgrade),
            '6' => Ok(PacketId::Noop),
            _ => Err(Error::InvalidPacketId(c)),
        }
    }
}

/// The body of a packet. Revision 3 of the protocol distinguishes plain
/// UTF-8 text from raw binary attachments.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PacketData {
    Text(String),
    Binary(Bytes),
}

/// A packet sent or received in the `engine.io` protocol.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub id: PacketId,
    pub data: PacketData,
}

impl Packet {
    pub fn text<T: Into<String>>(id: PacketId, data: T) -> Self {
        Packet {
            id,
            data: PacketData::Text(data.into()),
        }
    }

    pub fn binary<T: Into<Bytes>>(id: PacketId, data: T) -> Self {
        Packet {
            id,
            data: PacketData::Binary(data.into()),
        }
    }
}

/// Data which gets exchanged in the OPEN handshake as defined by the server.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

/// An error object some servers send in place of a packet.
#[derive(Deserialize, Debug)]
pub(crate) struct ServerErrorPacket {
    pub message: String,
}

/// Re-encodes text as if its UTF-8 bytes were Latin-1 characters. Matches a
/// quirk of older servers that decode polling bodies twice.
pub fn double_encode(text: &str) -> String {
    text.bytes().map(char::from).collect()
}

/// Inverse of [`double_encode`]. Returns the input untouched when it does not
/// look double-encoded.
pub fn double_decode(text: &str) -> String {
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match u8::try_from(u32::from(ch)) {
            Ok(byte) => bytes.push(byte),
            Err(_) => return text.to_owned(),
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_owned())
}

/// Encodes a text packet into its wire frame `<type digit><payload>`.
pub fn encode_text_frame(id: PacketId, body: &str, double_encode_utf8: bool) -> String {
    let mut frame = String::with_capacity(body.len() + 1);
    frame.push(id.digit());
    if double_encode_utf8 {
        frame.push_str(&double_encode(body));
    } else {
        frame.push_str(body);
    }
    frame
}

/// Encodes a binary attachment for the polling transport: base64 behind the
/// `b4` marker. The toggle for double encoding never applies here.
pub fn encode_binary_frame(data: &[u8]) -> String {
    format!(
        "b{}{}",
        PacketId::Message.digit(),
        general_purpose::STANDARD.encode(data)
    )
}

/// Encodes a batch of frames into one polling request body. The length prefix
/// counts **characters** of the frame, not bytes.
pub fn encode_payload<I: IntoIterator<Item = String>>(frames: I) -> String {
    let mut payload = String::new();
    for frame in frames {
        payload.push_str(&frame.chars().count().to_string());
        payload.push(':');
        payload.push_str(&frame);
    }
    payload
}

/// Splits a polling response body into its frames. The length prefixes count
/// characters, so the body is walked char by char.
pub fn decode_payload(body: &str) -> Result<Vec<String>> {
    let mut frames = Vec::new();
    let mut chars = body.chars();

    loop {
        let mut len: Option<usize> = None;
        loop {
            match chars.next() {
                Some(c) if c.is_ascii_digit() => {
                    let digit = (c as u8 - b'0') as usize;
                    len = Some(len.unwrap_or(0) * 10 + digit);
                }
                Some(':') if len.is_some() => break,
                None if len.is_none() => return Ok(frames),
                _ => return Err(Error::IncompletePacket()),
            }
        }

        // SAFETY: loop above only breaks once a length was parsed
        let len = len.unwrap();
        let mut frame = String::new();
        for _ in 0..len {
            frame.push(chars.next().ok_or(Error::IncompletePacket())?);
        }
        frames.push(frame);
    }
}

/// Decodes a single frame into a [`Packet`]. Handles the `b4` binary marker;
/// `double_decode_utf8` is only honored for non-NOOP text frames and should
/// be false for websocket traffic.
pub fn decode_frame(frame: &str, double_decode_utf8: bool) -> Result<Packet> {
    if let Some(encoded) = frame.strip_prefix("b4") {
        let decoded = general_purpose::STANDARD.decode(encoded)?;
        return Ok(Packet::binary(PacketId::Message, decoded));
    }

    let mut chars = frame.chars();
    let id = PacketId::try_from(chars.next().ok_or(Error::IncompletePacket())?)?;
    let body = chars.as_str();

    let text = if double_decode_utf8 && id != PacketId::Noop {
        double_decode(body)
    } else {
        body.to_owned()
    };

    Ok(Packet::text(id, text))
}
