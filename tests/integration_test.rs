use spice_bridge::{
    ChannelState, ClientConfig, ErrorKind, FrameDelivery, PointerButton, SpiceError, TrustAnchor,
};
use spice_client::protocol::*;
use spice_client::test_utils::{fill_body, rect, surface_create_body, MockConfig, MockSpiceServer};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

/// The mock server runs on its own runtime so the bridge calls below stay
/// plain blocking calls.
struct Rig {
    server: MockSpiceServer,
    rt: Runtime,
}

impl Rig {
    fn start() -> Self {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockSpiceServer::start(MockConfig::default())).unwrap();
        Self { server, rt }
    }

    fn send(&self, kind: ChannelKind, msg_type: u16, body: Vec<u8>) {
        self.rt.block_on(self.server.send(kind, 0, msg_type, body)).unwrap();
    }

    fn received_of(&self, kind: ChannelKind, msg_type: u16) -> usize {
        self.server.received_of(kind, msg_type).len()
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(5),
        link_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    }
}

fn connect(rig: &Rig) -> u64 {
    spice_bridge::connect_with_config(&rig.server.uri(), "secret", TrustAnchor::None, config()).unwrap()
}

fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn test_handle_lifecycle() {
    let rig = Rig::start();
    let handle = connect(&rig);
    assert_ne!(handle, 0);
    assert!(spice_bridge::is_connected(handle).unwrap());
    let session_id = MockConfig::default().session_id;
    assert!(eventually(Duration::from_secs(2), || {
        spice_bridge::session_info(handle).unwrap().session_id() == Some(session_id)
    }));

    spice_bridge::disconnect(handle).unwrap();
    spice_bridge::disconnect(handle).unwrap();
    assert!(!spice_bridge::is_connected(handle).unwrap());
    assert!(matches!(
        spice_bridge::send_key(handle, 0x1e, true),
        Err(SpiceError::NotConnected)
    ));

    spice_bridge::release(handle).unwrap();
    assert!(matches!(
        spice_bridge::is_connected(handle),
        Err(SpiceError::BadHandle(h)) if h == handle
    ));
    assert!(matches!(spice_bridge::release(handle), Err(SpiceError::BadHandle(_))));
}

#[test]
fn test_disconnected_handle_is_not_reissued() {
    let rig = Rig::start();
    let first = connect(&rig);
    spice_bridge::disconnect(first).unwrap();

    let second = connect(&rig);
    assert_ne!(first, second);
    assert!(spice_bridge::is_connected(second).unwrap());
    assert!(!spice_bridge::is_connected(first).unwrap());
    spice_bridge::disconnect(first).unwrap();
    assert!(spice_bridge::is_connected(second).unwrap());
    assert!(matches!(spice_bridge::width(first), Err(SpiceError::NotConnected)));

    spice_bridge::release(first).unwrap();
    assert!(matches!(spice_bridge::is_connected(first), Err(SpiceError::BadHandle(_))));
    spice_bridge::release(second).unwrap();
}

#[test]
fn test_zero_and_unknown_handles_are_rejected() {
    assert!(matches!(spice_bridge::width(0), Err(SpiceError::BadHandle(0))));
    assert!(matches!(
        spice_bridge::send_pointer_move(0xdead_0000_0001, 1, 1),
        Err(SpiceError::BadHandle(_))
    ));
}

#[test]
fn test_surface_size_and_frames() {
    let rig = Rig::start();
    let handle = connect(&rig);

    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    spice_bridge::set_frame_callback(
        handle,
        Some(Arc::new(move |delivery: FrameDelivery| {
            if let FrameDelivery::Frame(frame) = delivery {
                sink.lock().unwrap().push(frame);
            }
        })),
    )
    .unwrap();

    rig.send(
        ChannelKind::Display,
        SPICE_MSG_DISPLAY_SURFACE_CREATE,
        surface_create_body(0, 1024, 768, SPICE_SURFACE_FMT_32_XRGB, true),
    );
    rig.send(
        ChannelKind::Display,
        SPICE_MSG_DISPLAY_DRAW_FILL,
        fill_body(0, rect(0, 0, 100, 100), 0x0000_ff00),
    );
    rig.send(ChannelKind::Display, SPICE_MSG_DISPLAY_MARK, Vec::new());

    assert!(eventually(Duration::from_secs(2), || spice_bridge::width(handle).unwrap() == 1024));
    assert_eq!(spice_bridge::height(handle).unwrap(), 768);
    assert!(eventually(Duration::from_secs(2), || !frames.lock().unwrap().is_empty()));
    {
        let frames = frames.lock().unwrap();
        assert_eq!(frames[0].pixel(50, 50), Some([0x00, 0xff, 0x00, 0xff]));
        assert_eq!(frames[0].pixels.len(), 1024 * 768 * 4);
    }

    spice_bridge::release(handle).unwrap();
}

#[test]
fn test_input_reaches_server() {
    let rig = Rig::start();
    let handle = connect(&rig);
    assert!(eventually(Duration::from_secs(2), || {
        spice_bridge::channel_states(handle)
            .unwrap()
            .iter()
            .any(|(key, state)| key.kind == ChannelKind::Inputs && *state == ChannelState::Ready)
    }));

    spice_bridge::send_key(handle, 0x1c, true).unwrap();
    spice_bridge::send_key(handle, 0x1c, false).unwrap();
    spice_bridge::send_pointer_button(handle, PointerButton::Left, true).unwrap();
    spice_bridge::send_pointer_button(handle, PointerButton::Left, false).unwrap();

    assert!(eventually(Duration::from_secs(2), || {
        rig.received_of(ChannelKind::Inputs, SPICE_MSGC_INPUTS_KEY_UP) == 1
            && rig.received_of(ChannelKind::Inputs, SPICE_MSGC_INPUTS_MOUSE_RELEASE) == 1
    }));
    assert_eq!(rig.received_of(ChannelKind::Inputs, SPICE_MSGC_INPUTS_KEY_DOWN), 1);
    assert_eq!(rig.received_of(ChannelKind::Inputs, SPICE_MSGC_INPUTS_MOUSE_PRESS), 1);

    spice_bridge::release(handle).unwrap();
}

#[test]
fn test_wrong_password() {
    let rig = Rig::start();
    let result = spice_bridge::connect_with_config(&rig.server.uri(), "nope", TrustAnchor::None, config());
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::AuthFailed));
}

#[test]
fn test_bridge_usable_from_async_context() {
    let rig = Rig::start();
    let uri = rig.server.uri();
    let connected = rig.rt.block_on(async move {
        let handle = spice_bridge::connect_with_config(&uri, "secret", TrustAnchor::None, config()).unwrap();
        let connected = spice_bridge::is_connected(handle).unwrap();
        spice_bridge::release(handle).unwrap();
        connected
    });
    assert!(connected);
}
