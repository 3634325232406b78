use crate::channels::{ChannelKey, ChannelState, InputEvent, KeyModifiers, PointerButton, ScrollAxis, Ticket};
use crate::config::ClientConfig;
use crate::display::{BuiltinCodecs, CodecProvider};
use crate::error::{Result, SpiceError};
use crate::protocol::MouseMode;
use crate::session::{Session, SessionInfo, SessionParams};
use crate::transport::tcp::TcpConnector;
use crate::transport::{Connector, Endpoint, TrustAnchor};
use crate::video::{CursorCallback, FrameCallback, NoticeCallback};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "client_tests.rs"]
mod client_tests;

/// A live SPICE session.
///
/// Created with [`SpiceClient::connect`] or [`crate::ClientBuilder`]. Every
/// method is safe to call from any task; after [`SpiceClient::disconnect`]
/// input calls fail with [`SpiceError::NotConnected`].
pub struct SpiceClient {
    session: Arc<Session>,
}

impl SpiceClient {
    /// Connect over plain TCP or TLS, as the endpoint says, with the built-in
    /// codecs.
    pub async fn connect(
        endpoint: Endpoint,
        ticket: impl Into<Ticket>,
        trust: TrustAnchor,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::connect_with(endpoint, ticket.into(), trust, config, Arc::new(TcpConnector), Arc::new(BuiltinCodecs))
            .await
    }

    /// Connect through a custom byte-stream connector and codec provider.
    pub async fn connect_with(
        endpoint: Endpoint,
        ticket: Ticket,
        trust: TrustAnchor,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        codecs: Arc<dyn CodecProvider>,
    ) -> Result<Self> {
        let session = Session::connect(SessionParams {
            endpoint,
            ticket,
            trust,
            config,
            connector,
            codecs,
        })
        .await?;
        Ok(Self { session })
    }

    /// Tear the session down. Idempotent; returns once every channel task
    /// has been reaped.
    pub async fn disconnect(&self) {
        info!("Disconnecting from SPICE server");
        self.session.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Width of the primary surface of display 0, zero before it exists.
    pub fn width(&self) -> u32 {
        self.session.size().0
    }

    pub fn height(&self) -> u32 {
        self.session.size().1
    }

    pub fn modifiers(&self) -> KeyModifiers {
        self.session.info().modifiers
    }

    pub fn mouse_mode(&self) -> Option<MouseMode> {
        self.session.info().mouse_mode
    }

    pub fn info(&self) -> SessionInfo {
        self.session.info()
    }

    pub fn channel_states(&self) -> Vec<(ChannelKey, ChannelState)> {
        self.session.channel_states()
    }

    /// The error that ended the session, once it has ended with one.
    pub fn failure(&self) -> Option<Arc<SpiceError>> {
        self.session.failure()
    }

    pub async fn send_key(&self, scancode: u32, pressed: bool) -> Result<()> {
        self.session.send_input(InputEvent::Key { scancode, pressed }).await
    }

    /// Deltas in client mouse mode, surface coordinates in server mode.
    pub async fn send_pointer_move(&self, x: i32, y: i32, surface_id: u32) -> Result<()> {
        self.session
            .send_input(InputEvent::PointerMove { x, y, surface_id })
            .await
    }

    pub async fn send_pointer_button(&self, button: PointerButton, pressed: bool) -> Result<()> {
        self.session
            .send_input(InputEvent::PointerButton { button, pressed })
            .await
    }

    pub async fn send_pointer_scroll(&self, axis: ScrollAxis, delta: i32) -> Result<()> {
        self.session
            .send_input(InputEvent::PointerScroll { axis, delta })
            .await
    }

    pub fn request_mouse_mode(&self, mode: MouseMode) -> Result<()> {
        if !self.is_connected() {
            return Err(SpiceError::NotConnected);
        }
        self.session.request_mouse_mode(mode);
        Ok(())
    }

    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        self.session.set_frame_callback(callback);
    }

    pub fn set_cursor_callback(&self, callback: Option<CursorCallback>) {
        self.session.set_cursor_callback(callback);
    }

    pub fn set_notice_callback(&self, callback: Option<NoticeCallback>) {
        self.session.set_notice_callback(callback);
    }
}

impl Drop for SpiceClient {
    fn drop(&mut self) {
        // Best effort: finish teardown on the runtime if one is around
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            handle.spawn(async move { session.disconnect().await });
        } else {
            debug!("SpiceClient dropped outside a runtime; tasks stop on cancellation");
        }
    }
}
