//! # spice-client
//!
//! A pure Rust client core for the SPICE remote-desktop protocol.
//!
//! ## Features
//!
//! - **Pure Rust** - No C dependencies, TLS through rustls
//! - **Async/await** - One reader, writer and dispatcher task per channel on Tokio
//! - **Multiple Channels** - Main, Display, Inputs and Cursor are interpreted;
//!   other kinds can be linked passively
//! - **Authentication** - RSA-OAEP (SPICE ticket) authentication
//! - **Software rendering** - Draw commands are composited into premultiplied
//!   RGBA surfaces and delivered to a frame callback
//! - **Pluggable codecs** - JPEG and MJPEG are built in; other image and video
//!   codecs come from a [`display::CodecProvider`]
//!
//! ## Basic Example
//!
//! ```no_run
//! use spice_client::{ClientBuilder, FrameDelivery, SpiceError};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SpiceError> {
//!     let client = ClientBuilder::new("spice://localhost:5900")
//!         .with_password("secret")
//!         .connect()
//!         .await?;
//!
//!     client.set_frame_callback(Some(Arc::new(|delivery: FrameDelivery| {
//!         if let FrameDelivery::Frame(frame) = delivery {
//!             println!("frame {} ({}x{})", frame.seq, frame.width, frame.height);
//!         }
//!     })));
//!
//!     client.send_key(0x1e, true).await?;
//!     client.send_key(0x1e, false).await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`transport`** - TCP and TLS byte streams behind the [`transport::Connector`] trait
//! - **`protocol`** - Wire constants and fixed-layout message structures
//! - **`channels`** - Link handshake and the per-kind channel state machines
//! - **`display`** - Surfaces, caches, image decoding and video streams
//! - **`session`** - Opens channels, routes their events and owns teardown
//! - **`video`** - Frames and the output worker that runs consumer callbacks
//! - **`client`** - The async [`SpiceClient`] handle
//!
//! ## Current Limitations
//!
//! - **No audio, USB redirection or smartcard** - Those channels are skipped
//!   or linked passively
//! - **No migration** - Migration messages are ignored
//! - **No SASL** - Only SPICE ticket authentication

#![warn(rustdoc::missing_crate_level_docs)]

pub mod channels;
pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;
pub mod video;
pub mod wire_format;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::SpiceClient;

pub type Client = SpiceClient;

/// Builder for connecting SPICE clients
pub struct ClientBuilder {
    uri: String,
    password: Option<String>,
    trust: TrustAnchor,
    config: ClientConfig,
    codecs: Option<Arc<dyn CodecProvider>>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    /// Start from a `spice://host:port` or `spice+tls://host:port` URI
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            password: None,
            trust: TrustAnchor::None,
            config: ClientConfig::default(),
            codecs: None,
            connector: None,
        }
    }

    /// Set the password for authentication
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_trust_anchor(mut self, trust: TrustAnchor) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codecs(mut self, codecs: Arc<dyn CodecProvider>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Connect and wait until the main channel is ready
    pub async fn connect(self) -> Result<SpiceClient> {
        let endpoint = Endpoint::parse(&self.uri)?;
        let ticket = Ticket::from(self.password.unwrap_or_default());
        let connector = self.connector.unwrap_or_else(|| Arc::new(TcpConnector));
        let codecs = self.codecs.unwrap_or_else(|| Arc::new(BuiltinCodecs));
        SpiceClient::connect_with(endpoint, ticket, self.trust, self.config, connector, codecs).await
    }
}

use std::sync::Arc;
use transport::tcp::TcpConnector;

pub use channels::{
    ChannelKey, ChannelState, CursorEvent, CursorSprite, InputEvent, KeyModifiers, Notification, PointerButton,
    ScrollAxis, Ticket,
};
pub use config::ClientConfig;
pub use display::{BuiltinCodecs, CodecProvider, ImageDecoder, StreamDecoder};
pub use error::{ErrorKind, LinkFailure, Result, SpiceError};
pub use protocol::{ChannelKind, LinkError, MouseMode};
pub use session::SessionInfo;
pub use transport::{Connector, Endpoint, TrustAnchor};
pub use video::{ConsumerEvent, Frame, FrameDelivery, FrameEvent, SessionNotice};
