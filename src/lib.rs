//! # spice-bridge
//!
//! Synchronous, handle-based access to [`spice_client`] for hosts that are
//! not async themselves (FFI shims, UI toolkits, scripts).
//!
//! Every function takes an opaque [`Handle`] returned by [`connect`]. Zero is
//! never a valid handle. [`disconnect`] frees the handle's slot for reuse;
//! until [`release`] (or until the slot is freed again) the old handle keeps
//! answering: [`is_connected`] is `false`, a repeated `disconnect` succeeds
//! and everything else fails with [`SpiceError::NotConnected`]. Handles that
//! were never issued or have been released fail with
//! [`SpiceError::BadHandle`].
//!
//! ```no_run
//! use spice_bridge::{connect, disconnect, release, set_frame_callback, FrameDelivery, TrustAnchor};
//! use std::sync::Arc;
//!
//! let handle = connect("spice://localhost:5900", "secret", TrustAnchor::None)?;
//! set_frame_callback(handle, Some(Arc::new(|delivery: FrameDelivery| {
//!     if let FrameDelivery::Frame(frame) = delivery {
//!         println!("{}x{} frame {}", frame.width, frame.height, frame.seq);
//!     }
//! })))?;
//! disconnect(handle)?;
//! release(handle)?;
//! # Ok::<(), spice_bridge::SpiceError>(())
//! ```
//!
//! The library never installs a `tracing` subscriber; hosts that want logs
//! install their own.

mod handles;
mod runtime;

pub use handles::Handle;
pub use spice_client::video::{CursorCallback, FrameCallback, NoticeCallback};
pub use spice_client::{
    ChannelKey, ChannelState, ClientConfig, CursorEvent, ErrorKind, Frame, FrameDelivery, KeyModifiers, MouseMode,
    PointerButton, Result, ScrollAxis, SessionInfo, SessionNotice, SpiceError, TrustAnchor,
};

use handles::{HandleTable, Retired};
use runtime::run;
use spice_client::{ClientBuilder, SpiceClient};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

fn table() -> &'static HandleTable<Arc<SpiceClient>> {
    static TABLE: OnceLock<HandleTable<Arc<SpiceClient>>> = OnceLock::new();
    TABLE.get_or_init(HandleTable::new)
}

fn client(handle: Handle) -> Result<Arc<SpiceClient>> {
    table().get(handle)
}

/// Connect with default settings. Blocks until the main channel is ready or
/// the connect timeout (15 s) expires.
pub fn connect(uri: &str, password: &str, trust: TrustAnchor) -> Result<Handle> {
    connect_with_config(uri, password, trust, ClientConfig::default())
}

pub fn connect_with_config(uri: &str, password: &str, trust: TrustAnchor, config: ClientConfig) -> Result<Handle> {
    let builder = ClientBuilder::new(uri)
        .with_password(password)
        .with_trust_anchor(trust)
        .with_config(config);
    let client = run(builder.connect())??;
    let handle = table().insert(Arc::new(client));
    info!(handle, uri, "bridge session connected");
    Ok(handle)
}

/// End the session and free its slot. Idempotent; blocks until every
/// channel task is reaped.
pub fn disconnect(handle: Handle) -> Result<()> {
    match table().retire(handle)? {
        Retired::Live(client) => {
            run(async move { client.disconnect().await })?;
            debug!(handle, "bridge session disconnected");
        }
        Retired::Already => debug!(handle, "bridge session already disconnected"),
    }
    Ok(())
}

/// Disconnect if needed and forget the handle entirely.
pub fn release(handle: Handle) -> Result<()> {
    if let Some(client) = table().remove(handle)? {
        run(async move { client.disconnect().await })?;
    }
    debug!(handle, "bridge session released");
    Ok(())
}

/// Sessions currently holding a handle.
pub fn session_count() -> usize {
    table().len()
}

pub fn is_connected(handle: Handle) -> Result<bool> {
    match client(handle) {
        Ok(client) => Ok(client.is_connected()),
        Err(SpiceError::NotConnected) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn width(handle: Handle) -> Result<u32> {
    Ok(client(handle)?.width())
}

pub fn height(handle: Handle) -> Result<u32> {
    Ok(client(handle)?.height())
}

/// Lock-key state last reported by the guest.
pub fn modifiers(handle: Handle) -> Result<KeyModifiers> {
    Ok(client(handle)?.modifiers())
}

pub fn mouse_mode(handle: Handle) -> Result<Option<MouseMode>> {
    Ok(client(handle)?.mouse_mode())
}

/// Server identity, mouse modes and monitor layout as announced so far.
pub fn session_info(handle: Handle) -> Result<SessionInfo> {
    Ok(client(handle)?.info())
}

/// The error that ended the session, if it ended with one.
pub fn failure(handle: Handle) -> Result<Option<Arc<SpiceError>>> {
    Ok(client(handle)?.failure())
}

pub fn channel_states(handle: Handle) -> Result<Vec<(ChannelKey, ChannelState)>> {
    Ok(client(handle)?.channel_states())
}

pub fn send_key(handle: Handle, scancode: u32, pressed: bool) -> Result<()> {
    let client = client(handle)?;
    run(async move { client.send_key(scancode, pressed).await })?
}

/// Pointer motion on display 0: deltas in client mouse mode, absolute
/// coordinates in server mode.
pub fn send_pointer_move(handle: Handle, x: i32, y: i32) -> Result<()> {
    let client = client(handle)?;
    run(async move { client.send_pointer_move(x, y, 0).await })?
}

pub fn send_pointer_button(handle: Handle, button: PointerButton, pressed: bool) -> Result<()> {
    let client = client(handle)?;
    run(async move { client.send_pointer_button(button, pressed).await })?
}

pub fn send_pointer_scroll(handle: Handle, axis: ScrollAxis, delta: i32) -> Result<()> {
    let client = client(handle)?;
    run(async move { client.send_pointer_scroll(axis, delta).await })?
}

pub fn request_mouse_mode(handle: Handle, mode: MouseMode) -> Result<()> {
    client(handle)?.request_mouse_mode(mode)
}

/// Frames arrive on a dedicated thread, one call at a time. `None`
/// unregisters.
pub fn set_frame_callback(handle: Handle, callback: Option<FrameCallback>) -> Result<()> {
    client(handle)?.set_frame_callback(callback);
    Ok(())
}

pub fn set_cursor_callback(handle: Handle, callback: Option<CursorCallback>) -> Result<()> {
    client(handle)?.set_cursor_callback(callback);
    Ok(())
}

pub fn set_notice_callback(handle: Handle, callback: Option<NoticeCallback>) -> Result<()> {
    client(handle)?.set_notice_callback(callback);
    Ok(())
}
