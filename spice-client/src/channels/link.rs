//! Link phase: version and capability exchange followed by ticket
//! authentication. Runs on the whole transport before it is split.

use crate::channels::ChannelKey;
use crate::error::{LinkFailure, Result, SpiceError};
use crate::protocol::*;
use crate::transport::Transport;
use crate::wire_format::{from_wire, to_wire, ReadWire, WriteWire};
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use tracing::{debug, info};

/// Upper bound on a link reply body; real replies are a few hundred bytes.
const MAX_LINK_REPLY_SIZE: u32 = 64 * 1024;

/// The password-equivalent presented on every channel link. Zeroed on drop
/// and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket(Vec<u8>);

impl Ticket {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Refuse tickets that may not be sent.
    pub fn validate(&self) -> Result<()> {
        if self.0.len() > SPICE_MAX_TICKET_BYTES {
            return Err(SpiceError::LinkFailed(LinkFailure::TicketTooLong(self.0.len())));
        }
        Ok(())
    }

    fn plaintext(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(&self.0);
        bytes.push(0);
        bytes
    }
}

impl From<&str> for Ticket {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for Ticket {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Ticket(<redacted>)")
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

/// A capability bit vector as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    words: Vec<u32>,
}

impl Capabilities {
    pub fn from_bits(bits: &[u32]) -> Self {
        let mut caps = Self::default();
        for &bit in bits {
            caps.set(bit);
        }
        caps
    }

    pub fn from_words(words: Vec<u32>) -> Self {
        Self { words }
    }

    pub fn set(&mut self, bit: u32) {
        let word = (bit / 32) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 32);
    }

    pub fn has(&self, bit: u32) -> bool {
        self.words
            .get((bit / 32) as usize)
            .map(|w| w & (1 << (bit % 32)) != 0)
            .unwrap_or(false)
    }

    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        let words = self
            .words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| a & b)
            .collect();
        Capabilities { words }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// Capabilities this client advertises for a channel kind.
pub fn client_capabilities(kind: ChannelKind, video_codecs: &[u8]) -> (Capabilities, Capabilities) {
    let common = Capabilities::from_bits(&[
        SPICE_COMMON_CAP_PROTOCOL_AUTH_SELECTION,
        SPICE_COMMON_CAP_AUTH_SPICE,
    ]);

    let channel = match kind {
        ChannelKind::Main => Capabilities::from_bits(&[SPICE_MAIN_CAP_NAME_AND_UUID]),
        ChannelKind::Display => {
            let mut caps = Capabilities::from_bits(&[
                SPICE_DISPLAY_CAP_SIZED_STREAM,
                SPICE_DISPLAY_CAP_MONITORS_CONFIG,
                SPICE_DISPLAY_CAP_A8_SURFACE,
                SPICE_DISPLAY_CAP_STREAM_REPORT,
                SPICE_DISPLAY_CAP_MULTI_CODEC,
            ]);
            for codec in video_codecs {
                match *codec {
                    SPICE_VIDEO_CODEC_TYPE_MJPEG => caps.set(SPICE_DISPLAY_CAP_CODEC_MJPEG),
                    SPICE_VIDEO_CODEC_TYPE_VP8 => caps.set(SPICE_DISPLAY_CAP_CODEC_VP8),
                    SPICE_VIDEO_CODEC_TYPE_H264 => caps.set(SPICE_DISPLAY_CAP_CODEC_H264),
                    SPICE_VIDEO_CODEC_TYPE_VP9 => caps.set(SPICE_DISPLAY_CAP_CODEC_VP9),
                    _ => {}
                }
            }
            caps
        }
        _ => Capabilities::default(),
    };

    (common, channel)
}

/// What the server answered during the link phase.
#[derive(Debug, Clone)]
pub struct LinkReply {
    pub minor_version: u32,
    pub pub_key: [u8; SPICE_TICKET_PUBKEY_BYTES],
    pub server_common: Capabilities,
    pub server_channel: Capabilities,
    /// Intersection of both sides' common capabilities.
    pub common: Capabilities,
    /// Intersection of both sides' channel capabilities.
    pub channel: Capabilities,
}

/// Send `SpiceLinkMess` and wait for the server's reply.
pub async fn exchange_link(
    transport: &mut Transport,
    key: ChannelKey,
    connection_id: u32,
    video_codecs: &[u8],
) -> Result<LinkReply> {
    let (common, channel) = client_capabilities(key.kind, video_codecs);
    let caps_len = (common.words().len() + channel.words().len()) * 4;

    let header = SpiceLinkHeader {
        magic: SPICE_MAGIC,
        major_version: SPICE_VERSION_MAJOR,
        minor_version: SPICE_VERSION_MINOR,
        size: (SPICE_LINK_MESS_SIZE + caps_len) as u32,
    };
    let mess = SpiceLinkMess {
        connection_id,
        channel_type: key.kind.wire_type(),
        channel_id: key.id,
        num_common_caps: common.words().len() as u32,
        num_channel_caps: channel.words().len() as u32,
        caps_offset: SPICE_LINK_MESS_SIZE as u32,
    };

    let mut out = to_wire(&header)?;
    out.extend_from_slice(&to_wire(&mess)?);
    for word in common.words().iter().chain(channel.words()) {
        out.write_u32_le(*word);
    }

    debug!(channel = ?key, connection_id, "sending link message ({} bytes)", out.len());
    transport.write(&out).await?;

    let raw_header = transport.read(SPICE_LINK_HEADER_SIZE).await?;
    let reply_header: SpiceLinkHeader = from_wire(&raw_header)?;

    if reply_header.magic != SPICE_MAGIC {
        return Err(SpiceError::LinkFailed(LinkFailure::InvalidMagic(reply_header.magic)));
    }
    if reply_header.major_version != SPICE_VERSION_MAJOR {
        return Err(SpiceError::LinkFailed(LinkFailure::VersionMismatch {
            expected: SPICE_VERSION_MAJOR,
            actual: reply_header.major_version,
        }));
    }
    // The error code is the first field; a refusal may come with a short body
    if reply_header.size < 4 || reply_header.size > MAX_LINK_REPLY_SIZE {
        return Err(SpiceError::LinkFailed(LinkFailure::Malformed(format!(
            "reply size {}",
            reply_header.size
        ))));
    }

    let body = transport.read(reply_header.size as usize).await?;
    let code = body.read_u32_le(0)?;
    match LinkError::from_code(code) {
        LinkError::Ok => {}
        LinkError::NeedSecured => return Err(SpiceError::LinkFailed(LinkFailure::NeedSecured)),
        other => return Err(SpiceError::LinkFailed(LinkFailure::Server(other))),
    }

    if body.len() < SPICE_LINK_REPLY_SIZE {
        return Err(SpiceError::LinkFailed(LinkFailure::Malformed(format!(
            "reply body is {} bytes",
            body.len()
        ))));
    }
    let reply: SpiceLinkReplyData = from_wire(&body)?;

    let caps_start = reply.caps_offset as usize;
    let num_words = reply.num_common_caps as usize + reply.num_channel_caps as usize;
    let caps_bytes = body
        .read_bytes(caps_start, num_words * 4)
        .map_err(|_| SpiceError::LinkFailed(LinkFailure::Malformed("capabilities out of range".into())))?;
    let words: Vec<u32> = caps_bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let (server_common, server_channel) = words.split_at(reply.num_common_caps as usize);
    let server_common = Capabilities::from_words(server_common.to_vec());
    let server_channel = Capabilities::from_words(server_channel.to_vec());

    let minor_version = reply_header.minor_version.min(SPICE_VERSION_MINOR);
    info!(
        channel = ?key,
        minor_version,
        "link reply accepted"
    );

    Ok(LinkReply {
        minor_version,
        pub_key: reply.pub_key,
        common: common.intersect(&server_common),
        channel: channel.intersect(&server_channel),
        server_common,
        server_channel,
    })
}

/// Encrypt the ticket with the server's public key using RSA-OAEP/SHA-1.
pub fn encrypt_ticket(ticket: &Ticket, pub_key_der: &[u8]) -> Result<Vec<u8>> {
    ticket.validate()?;
    let public_key = RsaPublicKey::from_public_key_der(pub_key_der)
        .map_err(|e| SpiceError::LinkFailed(LinkFailure::Encryption(format!("bad public key: {e}"))))?;
    let plaintext = ticket.plaintext();
    let encrypted = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &plaintext)
        .map_err(|e| SpiceError::LinkFailed(LinkFailure::Encryption(e.to_string())))?;
    if encrypted.len() != SPICE_TICKET_ENCRYPTED_BYTES {
        return Err(SpiceError::LinkFailed(LinkFailure::Encryption(format!(
            "expected {} encrypted bytes, got {}",
            SPICE_TICKET_ENCRYPTED_BYTES,
            encrypted.len()
        ))));
    }
    Ok(encrypted)
}

/// Authenticate with the ticket and wait for the server's verdict.
pub async fn authenticate(transport: &mut Transport, reply: &LinkReply, ticket: &Ticket) -> Result<()> {
    ticket.validate()?;

    let server_selects = reply.server_common.has(SPICE_COMMON_CAP_PROTOCOL_AUTH_SELECTION);
    if server_selects && !reply.common.has(SPICE_COMMON_CAP_AUTH_SPICE) {
        return Err(SpiceError::LinkFailed(LinkFailure::MissingCapability("AUTH_SPICE")));
    }

    let encrypted = encrypt_ticket(ticket, &reply.pub_key)?;

    let mut out = Vec::with_capacity(4 + encrypted.len());
    if server_selects {
        out.extend_from_slice(&to_wire(&SpiceLinkAuthMechanism {
            auth_mechanism: SPICE_COMMON_CAP_AUTH_SPICE,
        })?);
    }
    out.write_bytes(&encrypted);
    transport.write(&out).await?;

    let status = transport.read(4).await?;
    let status = status.read_u32_le(0)?;
    if status != LinkError::Ok as u32 {
        return Err(SpiceError::AuthFailed(status));
    }
    Ok(())
}
