use binrw::binrw;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

pub const SPICE_MAGIC: u32 = 0x51444552; // "REDQ"
pub const SPICE_VERSION_MAJOR: u32 = 2;
pub const SPICE_VERSION_MINOR: u32 = 2;

/// Size of the in-session data header on the wire.
pub const SPICE_DATA_HEADER_SIZE: usize = 18;
/// Size of `SpiceLinkHeader` on the wire.
pub const SPICE_LINK_HEADER_SIZE: usize = 16;
/// Size of `SpiceLinkMess` on the wire; capabilities follow immediately.
pub const SPICE_LINK_MESS_SIZE: usize = 18;
/// Size of `SpiceLinkReplyData` on the wire.
pub const SPICE_LINK_REPLY_SIZE: usize = 178;
/// RSA 1024 SubjectPublicKeyInfo, DER encoded.
pub const SPICE_TICKET_PUBKEY_BYTES: usize = 162;
/// Size of the encrypted ticket sent during authentication.
pub const SPICE_TICKET_ENCRYPTED_BYTES: usize = 128;
/// Longest ticket accepted before encryption.
pub const SPICE_MAX_TICKET_BYTES: usize = 128;

// Link error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum LinkError {
    Ok = 0,
    Error = 1,
    InvalidMagic = 2,
    InvalidData = 3,
    VersionMismatch = 4,
    NeedSecured = 5,
    NeedUnsecured = 6,
    PermissionDenied = 7,
    BadConnectionId = 8,
    ChannelNotAvailable = 9,
}

impl LinkError {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => LinkError::Ok,
            2 => LinkError::InvalidMagic,
            3 => LinkError::InvalidData,
            4 => LinkError::VersionMismatch,
            5 => LinkError::NeedSecured,
            6 => LinkError::NeedUnsecured,
            7 => LinkError::PermissionDenied,
            8 => LinkError::BadConnectionId,
            9 => LinkError::ChannelNotAvailable,
            _ => LinkError::Error,
        }
    }
}

// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NotifySeverity {
    Info = 0,
    Warn = 1,
    Error = 2,
}

impl From<u32> for NotifySeverity {
    fn from(value: u32) -> Self {
        match value {
            0 => NotifySeverity::Info,
            1 => NotifySeverity::Warn,
            _ => NotifySeverity::Error,
        }
    }
}

/// Channel kinds. Unknown kinds survive decoding so they can be skipped
/// rather than misrouted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    Main,
    Display,
    Inputs,
    Cursor,
    Playback,
    Record,
    Tunnel,
    SmartCard,
    UsbRedir,
    Port,
    WebDav,
    Unknown(u8),
}

impl ChannelKind {
    pub fn wire_type(self) -> u8 {
        match self {
            ChannelKind::Main => 1,
            ChannelKind::Display => 2,
            ChannelKind::Inputs => 3,
            ChannelKind::Cursor => 4,
            ChannelKind::Playback => 5,
            ChannelKind::Record => 6,
            ChannelKind::Tunnel => 7,
            ChannelKind::SmartCard => 8,
            ChannelKind::UsbRedir => 9,
            ChannelKind::Port => 10,
            ChannelKind::WebDav => 11,
            ChannelKind::Unknown(t) => t,
        }
    }

    /// Kinds this client interprets; everything else is skipped or drained.
    pub fn is_interpreted(self) -> bool {
        matches!(
            self,
            ChannelKind::Main | ChannelKind::Display | ChannelKind::Inputs | ChannelKind::Cursor
        )
    }
}

impl From<u8> for ChannelKind {
    fn from(value: u8) -> Self {
        match value {
            1 => ChannelKind::Main,
            2 => ChannelKind::Display,
            3 => ChannelKind::Inputs,
            4 => ChannelKind::Cursor,
            5 => ChannelKind::Playback,
            6 => ChannelKind::Record,
            7 => ChannelKind::Tunnel,
            8 => ChannelKind::SmartCard,
            9 => ChannelKind::UsbRedir,
            10 => ChannelKind::Port,
            11 => ChannelKind::WebDav,
            other => ChannelKind::Unknown(other),
        }
    }
}

/// Pointer encoding selected by the main channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseMode {
    /// Absolute coordinates relative to the server framebuffer.
    Server,
    /// Relative deltas; the server draws the cursor.
    Client,
}

impl MouseMode {
    pub fn wire_value(self) -> u16 {
        match self {
            MouseMode::Server => SPICE_MOUSE_MODE_SERVER,
            MouseMode::Client => SPICE_MOUSE_MODE_CLIENT,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            v if v == SPICE_MOUSE_MODE_SERVER as u32 => Some(MouseMode::Server),
            v if v == SPICE_MOUSE_MODE_CLIENT as u32 => Some(MouseMode::Client),
            _ => None,
        }
    }
}

pub const SPICE_MOUSE_MODE_SERVER: u16 = 1;
pub const SPICE_MOUSE_MODE_CLIENT: u16 = 2;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceDataHeader {
    pub serial: u64,
    pub msg_type: u16,
    pub msg_size: u32,
    pub sub_list: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceLinkHeader {
    pub magic: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub size: u32,
}

// Packed on the wire: no padding between channel_id and num_common_caps.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceLinkMess {
    pub connection_id: u32,
    pub channel_type: u8,
    pub channel_id: u8,
    pub num_common_caps: u32,
    pub num_channel_caps: u32,
    pub caps_offset: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct SpiceLinkReplyData {
    pub error: u32,
    pub pub_key: [u8; SPICE_TICKET_PUBKEY_BYTES],
    pub num_common_caps: u32,
    pub num_channel_caps: u32,
    pub caps_offset: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpiceLinkAuthMechanism {
    pub auth_mechanism: u32,
}

// Common channel capabilities
pub const SPICE_COMMON_CAP_PROTOCOL_AUTH_SELECTION: u32 = 0;
pub const SPICE_COMMON_CAP_AUTH_SPICE: u32 = 1;
pub const SPICE_COMMON_CAP_AUTH_SASL: u32 = 2;
pub const SPICE_COMMON_CAP_MINI_HEADER: u32 = 3;

// Display channel capabilities
pub const SPICE_DISPLAY_CAP_SIZED_STREAM: u32 = 0;
pub const SPICE_DISPLAY_CAP_MONITORS_CONFIG: u32 = 1;
pub const SPICE_DISPLAY_CAP_COMPOSITE: u32 = 2;
pub const SPICE_DISPLAY_CAP_A8_SURFACE: u32 = 3;
pub const SPICE_DISPLAY_CAP_STREAM_REPORT: u32 = 4;
pub const SPICE_DISPLAY_CAP_LZ4_COMPRESSION: u32 = 5;
pub const SPICE_DISPLAY_CAP_PREF_COMPRESSION: u32 = 6;
pub const SPICE_DISPLAY_CAP_GL_SCANOUT: u32 = 7;
pub const SPICE_DISPLAY_CAP_MULTI_CODEC: u32 = 8;
pub const SPICE_DISPLAY_CAP_CODEC_MJPEG: u32 = 9;
pub const SPICE_DISPLAY_CAP_CODEC_VP8: u32 = 10;
pub const SPICE_DISPLAY_CAP_CODEC_H264: u32 = 11;
pub const SPICE_DISPLAY_CAP_PREF_VIDEO_CODEC_TYPE: u32 = 12;
pub const SPICE_DISPLAY_CAP_CODEC_VP9: u32 = 13;

// Main channel capabilities
pub const SPICE_MAIN_CAP_SEMI_SEAMLESS_MIGRATE: u32 = 0;
pub const SPICE_MAIN_CAP_NAME_AND_UUID: u32 = 1;
pub const SPICE_MAIN_CAP_AGENT_CONNECTED_TOKENS: u32 = 2;

// Common message type constants (all channels)
pub const SPICE_MSG_MIGRATE: u16 = 1;
pub const SPICE_MSG_MIGRATE_DATA: u16 = 2;
pub const SPICE_MSG_SET_ACK: u16 = 3;
pub const SPICE_MSG_PING: u16 = 4;
pub const SPICE_MSG_WAIT_FOR_CHANNELS: u16 = 5;
pub const SPICE_MSG_DISCONNECTING: u16 = 6;
pub const SPICE_MSG_NOTIFY: u16 = 7;

// Client to server common messages
pub const SPICE_MSGC_ACK_SYNC: u16 = 1;
pub const SPICE_MSGC_ACK: u16 = 2;
pub const SPICE_MSGC_PONG: u16 = 3;
pub const SPICE_MSGC_MIGRATE_FLUSH_MARK: u16 = 4;
pub const SPICE_MSGC_MIGRATE_DATA: u16 = 5;
pub const SPICE_MSGC_DISCONNECTING: u16 = 6;

// Main channel message type constants
pub const SPICE_MSG_MAIN_MIGRATE_BEGIN: u16 = 101;
pub const SPICE_MSG_MAIN_MIGRATE_CANCEL: u16 = 102;
pub const SPICE_MSG_MAIN_INIT: u16 = 103;
pub const SPICE_MSG_MAIN_CHANNELS_LIST: u16 = 104;
pub const SPICE_MSG_MAIN_MOUSE_MODE: u16 = 105;
pub const SPICE_MSG_MAIN_MULTI_MEDIA_TIME: u16 = 106;
pub const SPICE_MSG_MAIN_AGENT_CONNECTED: u16 = 107;
pub const SPICE_MSG_MAIN_AGENT_DISCONNECTED: u16 = 108;
pub const SPICE_MSG_MAIN_AGENT_DATA: u16 = 109;
pub const SPICE_MSG_MAIN_AGENT_TOKEN: u16 = 110;
pub const SPICE_MSG_MAIN_MIGRATE_SWITCH_HOST: u16 = 111;
pub const SPICE_MSG_MAIN_MIGRATE_END: u16 = 112;
pub const SPICE_MSG_MAIN_NAME: u16 = 113;
pub const SPICE_MSG_MAIN_UUID: u16 = 114;
pub const SPICE_MSG_MAIN_AGENT_CONNECTED_TOKENS: u16 = 115;

// Client to server main channel messages
pub const SPICE_MSGC_MAIN_CLIENT_INFO: u16 = 101;
pub const SPICE_MSGC_MAIN_ATTACH_CHANNELS: u16 = 104;
pub const SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST: u16 = 105;

// Display channel message type constants
pub const SPICE_MSG_DISPLAY_MODE: u16 = 101;
pub const SPICE_MSG_DISPLAY_MARK: u16 = 102;
pub const SPICE_MSG_DISPLAY_RESET: u16 = 103;
pub const SPICE_MSG_DISPLAY_COPY_BITS: u16 = 104;
pub const SPICE_MSG_DISPLAY_INVAL_LIST: u16 = 105;
pub const SPICE_MSG_DISPLAY_INVAL_ALL_PIXMAPS: u16 = 106;
pub const SPICE_MSG_DISPLAY_INVAL_PALETTE: u16 = 107;
pub const SPICE_MSG_DISPLAY_INVAL_ALL_PALETTES: u16 = 108;
pub const SPICE_MSG_DISPLAY_STREAM_CREATE: u16 = 122;
pub const SPICE_MSG_DISPLAY_STREAM_DATA: u16 = 123;
pub const SPICE_MSG_DISPLAY_STREAM_CLIP: u16 = 124;
pub const SPICE_MSG_DISPLAY_STREAM_DESTROY: u16 = 125;
pub const SPICE_MSG_DISPLAY_STREAM_DESTROY_ALL: u16 = 126;
pub const SPICE_MSG_DISPLAY_DRAW_FILL: u16 = 302;
pub const SPICE_MSG_DISPLAY_DRAW_OPAQUE: u16 = 303;
pub const SPICE_MSG_DISPLAY_DRAW_COPY: u16 = 304;
pub const SPICE_MSG_DISPLAY_DRAW_BLEND: u16 = 305;
pub const SPICE_MSG_DISPLAY_DRAW_BLACKNESS: u16 = 306;
pub const SPICE_MSG_DISPLAY_DRAW_WHITENESS: u16 = 307;
pub const SPICE_MSG_DISPLAY_DRAW_INVERS: u16 = 308;
pub const SPICE_MSG_DISPLAY_DRAW_ROP3: u16 = 309;
pub const SPICE_MSG_DISPLAY_DRAW_STROKE: u16 = 310;
pub const SPICE_MSG_DISPLAY_DRAW_TEXT: u16 = 311;
pub const SPICE_MSG_DISPLAY_DRAW_TRANSPARENT: u16 = 312;
pub const SPICE_MSG_DISPLAY_DRAW_ALPHA_BLEND: u16 = 313;
pub const SPICE_MSG_DISPLAY_SURFACE_CREATE: u16 = 314;
pub const SPICE_MSG_DISPLAY_SURFACE_DESTROY: u16 = 315;
pub const SPICE_MSG_DISPLAY_STREAM_DATA_SIZED: u16 = 316;
pub const SPICE_MSG_DISPLAY_MONITORS_CONFIG: u16 = 317;
pub const SPICE_MSG_DISPLAY_DRAW_COMPOSITE: u16 = 318;
pub const SPICE_MSG_DISPLAY_STREAM_ACTIVATE_REPORT: u16 = 319;

// Client to server display channel messages
pub const SPICE_MSGC_DISPLAY_INIT: u16 = 101;
pub const SPICE_MSGC_DISPLAY_STREAM_REPORT: u16 = 102;

// Inputs channel messages
pub const SPICE_MSG_INPUTS_INIT: u16 = 101;
pub const SPICE_MSG_INPUTS_KEY_MODIFIERS: u16 = 102;
pub const SPICE_MSG_INPUTS_MOUSE_MOTION_ACK: u16 = 111;

pub const SPICE_MSGC_INPUTS_KEY_DOWN: u16 = 101;
pub const SPICE_MSGC_INPUTS_KEY_UP: u16 = 102;
pub const SPICE_MSGC_INPUTS_KEY_MODIFIERS: u16 = 103;
pub const SPICE_MSGC_INPUTS_MOUSE_MOTION: u16 = 111;
pub const SPICE_MSGC_INPUTS_MOUSE_POSITION: u16 = 112;
pub const SPICE_MSGC_INPUTS_MOUSE_PRESS: u16 = 113;
pub const SPICE_MSGC_INPUTS_MOUSE_RELEASE: u16 = 114;

// Cursor channel messages
pub const SPICE_MSG_CURSOR_INIT: u16 = 101;
pub const SPICE_MSG_CURSOR_RESET: u16 = 102;
pub const SPICE_MSG_CURSOR_SET: u16 = 103;
pub const SPICE_MSG_CURSOR_MOVE: u16 = 104;
pub const SPICE_MSG_CURSOR_HIDE: u16 = 105;
pub const SPICE_MSG_CURSOR_TRAIL: u16 = 106;
pub const SPICE_MSG_CURSOR_INVAL_ONE: u16 = 107;
pub const SPICE_MSG_CURSOR_INVAL_ALL: u16 = 108;

// Mouse buttons and button-state mask bits
pub const SPICE_MOUSE_BUTTON_LEFT: u8 = 1;
pub const SPICE_MOUSE_BUTTON_MIDDLE: u8 = 2;
pub const SPICE_MOUSE_BUTTON_RIGHT: u8 = 3;
pub const SPICE_MOUSE_BUTTON_UP: u8 = 4;
pub const SPICE_MOUSE_BUTTON_DOWN: u8 = 5;

pub const SPICE_MOUSE_BUTTON_MASK_LEFT: u16 = 1 << 0;
pub const SPICE_MOUSE_BUTTON_MASK_MIDDLE: u16 = 1 << 1;
pub const SPICE_MOUSE_BUTTON_MASK_RIGHT: u16 = 1 << 2;

// Keyboard LED modifiers
pub const SPICE_KEYBOARD_MODIFIER_SCROLL_LOCK: u16 = 1 << 0;
pub const SPICE_KEYBOARD_MODIFIER_NUM_LOCK: u16 = 1 << 1;
pub const SPICE_KEYBOARD_MODIFIER_CAPS_LOCK: u16 = 1 << 2;

/// The server acknowledges every this many motion messages.
pub const SPICE_INPUT_MOTION_ACK_BUNCH: u32 = 4;

// Surface formats
pub const SPICE_SURFACE_FMT_1_A: u32 = 1;
pub const SPICE_SURFACE_FMT_8_A: u32 = 8;
pub const SPICE_SURFACE_FMT_16_555: u32 = 16;
pub const SPICE_SURFACE_FMT_32_XRGB: u32 = 32;
pub const SPICE_SURFACE_FMT_16_565: u32 = 80;
pub const SPICE_SURFACE_FMT_32_ARGB: u32 = 96;

pub const SPICE_SURFACE_FLAGS_PRIMARY: u32 = 1 << 0;

// Clip and brush types
pub const SPICE_CLIP_TYPE_NONE: u8 = 0;
pub const SPICE_CLIP_TYPE_RECTS: u8 = 1;

pub const SPICE_BRUSH_TYPE_NONE: u8 = 0;
pub const SPICE_BRUSH_TYPE_SOLID: u8 = 1;
pub const SPICE_BRUSH_TYPE_PATTERN: u8 = 2;

pub const SPICE_MASK_FLAGS_INVERS: u8 = 1 << 0;

pub const SPICE_ALPHA_FLAGS_DEST_HAS_ALPHA: u8 = 1 << 0;
pub const SPICE_ALPHA_FLAGS_SRC_SURFACE_HAS_ALPHA: u8 = 1 << 1;

// Raster operation descriptor bits
pub const SPICE_ROPD_INVERS_SRC: u16 = 1 << 0;
pub const SPICE_ROPD_INVERS_BRUSH: u16 = 1 << 1;
pub const SPICE_ROPD_INVERS_DEST: u16 = 1 << 2;
pub const SPICE_ROPD_OP_PUT: u16 = 1 << 3;
pub const SPICE_ROPD_OP_OR: u16 = 1 << 4;
pub const SPICE_ROPD_OP_AND: u16 = 1 << 5;
pub const SPICE_ROPD_OP_XOR: u16 = 1 << 6;
pub const SPICE_ROPD_OP_BLACKNESS: u16 = 1 << 7;
pub const SPICE_ROPD_OP_WHITENESS: u16 = 1 << 8;
pub const SPICE_ROPD_OP_INVERS: u16 = 1 << 9;
pub const SPICE_ROPD_INVERS_RES: u16 = 1 << 10;

// Image types
pub const SPICE_IMAGE_TYPE_BITMAP: u8 = 0;
pub const SPICE_IMAGE_TYPE_QUIC: u8 = 1;
pub const SPICE_IMAGE_TYPE_LZ_PLT: u8 = 100;
pub const SPICE_IMAGE_TYPE_LZ_RGB: u8 = 101;
pub const SPICE_IMAGE_TYPE_GLZ_RGB: u8 = 102;
pub const SPICE_IMAGE_TYPE_FROM_CACHE: u8 = 103;
pub const SPICE_IMAGE_TYPE_SURFACE: u8 = 104;
pub const SPICE_IMAGE_TYPE_JPEG: u8 = 105;
pub const SPICE_IMAGE_TYPE_FROM_CACHE_LOSSLESS: u8 = 106;
pub const SPICE_IMAGE_TYPE_ZLIB_GLZ_RGB: u8 = 107;
pub const SPICE_IMAGE_TYPE_JPEG_ALPHA: u8 = 108;
pub const SPICE_IMAGE_TYPE_LZ4: u8 = 109;

pub const SPICE_IMAGE_FLAGS_CACHE_ME: u8 = 1 << 0;
pub const SPICE_IMAGE_FLAGS_HIGH_BITS_SET: u8 = 1 << 1;
pub const SPICE_IMAGE_FLAGS_CACHE_REPLACE_ME: u8 = 1 << 2;

// Bitmap formats
pub const SPICE_BITMAP_FMT_1BIT_LE: u8 = 1;
pub const SPICE_BITMAP_FMT_1BIT_BE: u8 = 2;
pub const SPICE_BITMAP_FMT_4BIT_LE: u8 = 3;
pub const SPICE_BITMAP_FMT_4BIT_BE: u8 = 4;
pub const SPICE_BITMAP_FMT_8BIT: u8 = 5;
pub const SPICE_BITMAP_FMT_16BIT: u8 = 6;
pub const SPICE_BITMAP_FMT_24BIT: u8 = 7;
pub const SPICE_BITMAP_FMT_32BIT: u8 = 8;
pub const SPICE_BITMAP_FMT_RGBA: u8 = 9;
pub const SPICE_BITMAP_FMT_8BIT_A: u8 = 10;

pub const SPICE_BITMAP_FLAGS_PAL_CACHE_ME: u8 = 1 << 0;
pub const SPICE_BITMAP_FLAGS_PAL_FROM_CACHE: u8 = 1 << 1;
pub const SPICE_BITMAP_FLAGS_TOP_DOWN: u8 = 1 << 2;

pub const SPICE_RES_TYPE_PIXMAP: u8 = 1;

// Video codecs
pub const SPICE_VIDEO_CODEC_TYPE_MJPEG: u8 = 1;
pub const SPICE_VIDEO_CODEC_TYPE_VP8: u8 = 2;
pub const SPICE_VIDEO_CODEC_TYPE_H264: u8 = 3;
pub const SPICE_VIDEO_CODEC_TYPE_VP9: u8 = 4;

pub const SPICE_STREAM_FLAGS_TOP_DOWN: u8 = 1 << 0;

// Cursor
pub const SPICE_CURSOR_FLAGS_NONE: u16 = 1 << 0;
pub const SPICE_CURSOR_FLAGS_CACHE_ME: u16 = 1 << 1;
pub const SPICE_CURSOR_FLAGS_FROM_CACHE: u16 = 1 << 2;

pub const SPICE_CURSOR_TYPE_ALPHA: u8 = 0;
pub const SPICE_CURSOR_TYPE_MONO: u8 = 1;

// Geometry. Rectangles are (top, left, bottom, right) on the wire.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpiceRect {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpicePoint {
    pub x: i32,
    pub y: i32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpicePoint16 {
    pub x: i16,
    pub y: i16,
}

// Common messages
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgSetAck {
    pub generation: u32,
    pub window: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcAckSync {
    pub generation: u32,
}

/// PING body; servers may append padding which is ignored.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgPing {
    pub id: u32,
    pub timestamp: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcPong {
    pub id: u32,
    pub timestamp: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgDisconnecting {
    pub time_stamp: u64,
    pub reason: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiceMsgNotify {
    pub time_stamp: u64,
    pub severity: u32,
    pub visibility: u32,
    pub what: u32,
    pub message_len: u32,
    #[br(count = message_len)]
    pub message: Vec<u8>,
}

// Main channel structures
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceMsgMainInit {
    pub session_id: u32,
    pub display_channels_hint: u32,
    pub supported_mouse_modes: u32,
    pub current_mouse_mode: u32,
    pub agent_connected: u32,
    pub agent_tokens: u32,
    pub multi_media_time: u32,
    pub ram_hint: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelId {
    pub type_: u8,
    pub id: u8,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiceMsgMainChannelsList {
    pub num_of_channels: u32,
    #[br(count = num_of_channels)]
    pub channels: Vec<ChannelId>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgMainMouseMode {
    pub supported_modes: u16,
    pub current_mode: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcMainMouseModeRequest {
    pub mode: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgMainMultiMediaTime {
    pub time: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiceMsgMainName {
    pub name_len: u32,
    #[br(count = name_len)]
    pub name: Vec<u8>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgMainUuid {
    pub uuid: [u8; 16],
}

// Display channel structures
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceMsgcDisplayInit {
    pub pixmap_cache_id: u8,
    pub pixmap_cache_size: i64,
    pub glz_dictionary_id: u8,
    pub glz_dictionary_window_size: i32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceMsgSurfaceCreate {
    pub surface_id: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub flags: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceMsgSurfaceDestroy {
    pub surface_id: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceMsgDisplayMode {
    pub x_res: u32,
    pub y_res: u32,
    pub bits: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceHead {
    pub id: u32,
    pub surface_id: u32,
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
    pub flags: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceMsgMonitorsConfig {
    pub count: u16,
    pub max_allowed: u16,
    #[br(count = count)]
    pub heads: Vec<SpiceHead>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgStreamActivateReport {
    pub stream_id: u32,
    pub unique_id: u32,
    pub max_window_size: u32,
    pub timeout_ms: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcStreamReport {
    pub stream_id: u32,
    pub unique_id: u32,
    pub start_frame_mm_time: u32,
    pub end_frame_mm_time: u32,
    pub num_frames: u32,
    pub num_drops: u32,
    pub last_frame_delay: i32,
    pub audio_delay: u32,
}

// Inputs channel structures
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgInputsInit {
    pub keyboard_modifiers: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgInputsKeyModifiers {
    pub modifiers: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcKeyDown {
    pub code: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcKeyUp {
    pub code: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcMouseMotion {
    pub dx: i32,
    pub dy: i32,
    pub buttons_state: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcMousePosition {
    pub x: u32,
    pub y: u32,
    pub buttons_state: u16,
    pub display_id: u8,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcMousePress {
    pub button: u8,
    pub buttons_state: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgcMouseRelease {
    pub button: u8,
    pub buttons_state: u16,
}

// Cursor channel structures
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceCursorHeader {
    pub unique: u64,
    pub type_: u8,
    pub width: u16,
    pub height: u16,
    pub hot_spot_x: u16,
    pub hot_spot_y: u16,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiceMsgCursorTrail {
    pub length: u16,
    pub frequency: u16,
}
