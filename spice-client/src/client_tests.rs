#[cfg(test)]
mod tests {
    use crate::channels::ChannelState;
    use crate::client::SpiceClient;
    use crate::config::ClientConfig;
    use crate::error::{ErrorKind, LinkFailure, SpiceError};
    use crate::protocol::*;
    use crate::test_utils::*;
    use crate::video::{FrameDelivery, SessionNotice};
    use crate::wire_format::{from_wire, to_wire};
    use crate::ClientBuilder;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, timeout, Duration, Instant};

    fn test_config() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(5),
            link_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    async fn connect(server: &MockSpiceServer) -> SpiceClient {
        connect_with(server, test_config()).await
    }

    async fn connect_with(server: &MockSpiceServer, config: ClientConfig) -> SpiceClient {
        ClientBuilder::new(&server.uri())
            .with_password("secret")
            .with_config(config)
            .connect()
            .await
            .expect("connect to mock server")
    }

    fn motions(msgs: &[ReceivedMessage]) -> Vec<SpiceMsgcMouseMotion> {
        msgs.iter()
            .filter(|m| m.msg_type == SPICE_MSGC_INPUTS_MOUSE_MOTION && m.channel.kind == ChannelKind::Inputs)
            .map(|m| from_wire(&m.body).unwrap())
            .collect()
    }

    async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    type Deliveries = Arc<Mutex<Vec<FrameDelivery>>>;

    fn capture_frames(client: &SpiceClient) -> Deliveries {
        let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = deliveries.clone();
        client.set_frame_callback(Some(Arc::new(move |delivery: FrameDelivery| {
            sink.lock().unwrap().push(delivery);
        })));
        deliveries
    }

    fn frame_count(deliveries: &Deliveries) -> usize {
        deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| matches!(d, FrameDelivery::Frame(_)))
            .count()
    }

    async fn create_primary(server: &MockSpiceServer, width: u32, height: u32) {
        server
            .send(
                ChannelKind::Display,
                0,
                SPICE_MSG_DISPLAY_SURFACE_CREATE,
                surface_create_body(0, width, height, SPICE_SURFACE_FMT_32_XRGB, true),
            )
            .await
            .unwrap();
    }

    async fn mark(server: &MockSpiceServer) {
        server
            .send(ChannelKind::Display, 0, SPICE_MSG_DISPLAY_MARK, Vec::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_reports_primary_surface_size() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;

        create_primary(&server, 1024, 768).await;
        mark(&server).await;

        assert!(eventually(Duration::from_secs(2), || client.width() == 1024).await);
        assert_eq!(client.height(), 768);
        assert!(client.is_connected());
        assert_eq!(client.info().session_id(), Some(0x1234_5678));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_aux_channels_share_session_id() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;

        assert!(server.wait_for_channel(ChannelKind::Cursor, 0, Duration::from_secs(2)).await);
        assert!(server.wait_for_channel(ChannelKind::Inputs, 0, Duration::from_secs(2)).await);
        assert!(server.wait_for_channel(ChannelKind::Display, 0, Duration::from_secs(2)).await);

        let links = server.links();
        assert_eq!(links.len(), 4);
        for link in links {
            assert!(link.authenticated);
            let expected = if link.channel.kind == ChannelKind::Main { 0 } else { 0x1234_5678 };
            assert_eq!(link.connection_id, expected, "{:?}", link.channel);
        }

        // Display announces its cache before anything else
        assert!(
            server
                .wait_until(Duration::from_secs(2), |msgs| msgs
                    .iter()
                    .any(|m| m.msg_type == SPICE_MSGC_DISPLAY_INIT && m.channel.kind == ChannelKind::Display))
                .await
        );
        let init: SpiceMsgcDisplayInit =
            from_wire(&server.received_of(ChannelKind::Display, SPICE_MSGC_DISPLAY_INIT)[0].body).unwrap();
        assert_eq!(init.pixmap_cache_size as u64, test_config().display_cache_bytes / 4);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_fill_reaches_frame_callback() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;
        let deliveries = capture_frames(&client);

        create_primary(&server, 128, 128).await;
        server
            .send(
                ChannelKind::Display,
                0,
                SPICE_MSG_DISPLAY_DRAW_FILL,
                fill_body(0, rect(0, 0, 100, 100), 0x0000_ff00),
            )
            .await
            .unwrap();
        mark(&server).await;

        assert!(eventually(Duration::from_secs(2), || frame_count(&deliveries) > 0).await);
        let deliveries = deliveries.lock().unwrap();
        let Some(FrameDelivery::Frame(frame)) = deliveries.first() else {
            panic!("expected a frame, got {:?}", deliveries.first());
        };
        assert_eq!((frame.width, frame.height), (128, 128));
        assert_eq!(frame.pixel(50, 50), Some([0x00, 0xff, 0x00, 0xff]));
        drop(deliveries);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_frames_wait_for_mark() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;
        let deliveries = capture_frames(&client);

        create_primary(&server, 16, 16).await;
        server
            .send(
                ChannelKind::Display,
                0,
                SPICE_MSG_DISPLAY_DRAW_FILL,
                fill_body(0, rect(0, 0, 16, 16), 0x00ff_0000),
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(frame_count(&deliveries), 0);

        mark(&server).await;
        assert!(eventually(Duration::from_secs(2), || frame_count(&deliveries) == 1).await);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_key_press_and_release_reach_server_in_order() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;

        client.send_key(0x1e, true).await.unwrap();
        client.send_key(0x1e, false).await.unwrap();

        let key_msgs = |msgs: &[ReceivedMessage]| -> Vec<(u16, u32)> {
            msgs.iter()
                .filter(|m| m.channel.kind == ChannelKind::Inputs)
                .filter(|m| m.msg_type == SPICE_MSGC_INPUTS_KEY_DOWN || m.msg_type == SPICE_MSGC_INPUTS_KEY_UP)
                .map(|m| (m.msg_type, from_wire::<SpiceMsgcKeyDown>(&m.body).unwrap().code))
                .collect()
        };
        assert!(
            server
                .wait_until(Duration::from_secs(2), |msgs| key_msgs(msgs).len() >= 2)
                .await
        );
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            key_msgs(&server.received()),
            vec![
                (SPICE_MSGC_INPUTS_KEY_DOWN, 0x1e),
                (SPICE_MSGC_INPUTS_KEY_UP, 0x9e)
            ]
        );

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_held_key_released_on_disconnect() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;

        client.send_key(0x2a, true).await.unwrap();
        assert!(
            server
                .wait_until(Duration::from_secs(2), |msgs| msgs
                    .iter()
                    .any(|m| m.msg_type == SPICE_MSGC_INPUTS_KEY_DOWN))
                .await
        );

        client.disconnect().await;
        assert!(
            server
                .wait_until(Duration::from_secs(2), |msgs| msgs
                    .iter()
                    .any(|m| m.msg_type == SPICE_MSGC_INPUTS_KEY_UP))
                .await
        );
        let up = &server.received_of(ChannelKind::Inputs, SPICE_MSGC_INPUTS_KEY_UP)[0];
        assert_eq!(from_wire::<SpiceMsgcKeyUp>(&up.body).unwrap().code, 0xaa);
    }

    #[tokio::test]
    async fn test_server_disconnecting_ends_session() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        client.set_notice_callback(Some(Arc::new(move |notice: SessionNotice| sink.lock().unwrap().push(notice))));
        assert!(server.wait_for_channel(ChannelKind::Display, 0, Duration::from_secs(2)).await);

        server
            .send(
                ChannelKind::Main,
                0,
                SPICE_MSG_DISCONNECTING,
                disconnecting_body(LinkError::Error),
            )
            .await
            .unwrap();

        assert!(eventually(Duration::from_secs(2), || !client.is_connected()).await);
        assert!(eventually(Duration::from_secs(2), || client.failure().is_some()).await);
        assert!(client
            .channel_states()
            .iter()
            .all(|(_, state)| state.is_terminal()));
        assert_eq!(
            client.failure().map(|e| e.kind()),
            Some(ErrorKind::ServerDisconnected)
        );
        assert!(notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| matches!(n, SessionNotice::ServerDisconnecting(LinkError::Error))));
        assert!(matches!(
            client.send_key(0x1e, true).await,
            Err(SpiceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_client_mode_motion_is_coalesced_per_frame() {
        let config = MockConfig {
            mouse_mode: MouseMode::Client,
            ..MockConfig::default()
        };
        let server = MockSpiceServer::start(config).await.unwrap();
        // Only frames may release the held motion here
        let client = connect_with(
            &server,
            ClientConfig {
                pointer_flush_interval: Duration::from_secs(30),
                ..test_config()
            },
        )
        .await;
        let deliveries = capture_frames(&client);
        assert!(server.wait_for_channel(ChannelKind::Inputs, 0, Duration::from_secs(2)).await);

        create_primary(&server, 32, 32).await;
        server
            .send(
                ChannelKind::Display,
                0,
                SPICE_MSG_DISPLAY_DRAW_FILL,
                fill_body(0, rect(0, 0, 32, 32), 0),
            )
            .await
            .unwrap();
        mark(&server).await;
        assert!(eventually(Duration::from_secs(2), || frame_count(&deliveries) == 1).await);
        sleep(Duration::from_millis(100)).await;

        for _ in 0..1000 {
            client.send_pointer_move(1, -1, 0).await.unwrap();
        }
        sleep(Duration::from_millis(100)).await;
        server
            .send(
                ChannelKind::Display,
                0,
                SPICE_MSG_DISPLAY_DRAW_FILL,
                fill_body(0, rect(0, 0, 8, 8), 0x00ff_ffff),
            )
            .await
            .unwrap();
        assert!(eventually(Duration::from_secs(2), || frame_count(&deliveries) == 2).await);

        let total = |msgs: &[ReceivedMessage]| motions(msgs).iter().map(|m| m.dx).sum::<i32>();
        assert!(
            server
                .wait_until(Duration::from_secs(2), |msgs| total(msgs) == 1000)
                .await
        );

        let sent = motions(&server.received());
        // One on the initial credit, one after the frame
        assert!(sent.len() <= 2, "{} motion messages", sent.len());
        assert_eq!(sent.iter().map(|m| m.dy).sum::<i32>(), -1000);
        assert!(server.received_of(ChannelKind::Inputs, SPICE_MSGC_INPUTS_MOUSE_POSITION).is_empty());

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_motion_without_frames_is_flushed() {
        let config = MockConfig {
            mouse_mode: MouseMode::Client,
            ..MockConfig::default()
        };
        let server = MockSpiceServer::start(config).await.unwrap();
        let client = connect(&server).await;
        assert!(server.wait_for_channel(ChannelKind::Inputs, 0, Duration::from_secs(2)).await);

        // No display surface, so no frame ever replenishes the credit
        client.send_pointer_move(1, 0, 0).await.unwrap();
        for _ in 0..9 {
            client.send_pointer_move(1, 2, 0).await.unwrap();
        }

        let total = |msgs: &[ReceivedMessage]| motions(msgs).iter().map(|m| m.dx).sum::<i32>();
        assert!(
            server
                .wait_until(Duration::from_secs(2), |msgs| total(msgs) == 10)
                .await
        );
        assert_eq!(motions(&server.received()).iter().map(|m| m.dy).sum::<i32>(), 18);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_serial_gap_fails_session() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;
        assert!(server.wait_for_channel(ChannelKind::Main, 0, Duration::from_secs(2)).await);

        // MAIN_INIT and CHANNELS_LIST took serials 1 and 2
        let header = to_wire(&SpiceDataHeader {
            serial: 4,
            msg_type: SPICE_MSG_MAIN_NAME,
            msg_size: 0,
            sub_list: 0,
        })
        .unwrap();
        server.send_raw(ChannelKind::Main, 0, header).await.unwrap();

        assert!(eventually(Duration::from_secs(2), || client.failure().is_some()).await);
        assert_eq!(client.failure().map(|e| e.kind()), Some(ErrorKind::ProtocolError));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_message_fails_session() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;
        let deliveries = capture_frames(&client);

        let header = to_wire(&SpiceDataHeader {
            serial: 3,
            msg_type: SPICE_MSG_MAIN_NAME,
            msg_size: 0xffff_ffff,
            sub_list: 0,
        })
        .unwrap();
        server.send_raw(ChannelKind::Main, 0, header).await.unwrap();

        assert!(eventually(Duration::from_secs(2), || client.failure().is_some()).await);
        assert_eq!(client.failure().map(|e| e.kind()), Some(ErrorKind::ProtocolError));
        assert!(!client.is_connected());
        assert!(eventually(Duration::from_secs(2), || {
            deliveries
                .lock()
                .unwrap()
                .iter()
                .any(|d| matches!(d, FrameDelivery::Failed(e) if e.kind() == ErrorKind::ProtocolError))
        })
        .await);
        assert!(client
            .channel_states()
            .iter()
            .all(|(_, state)| state.is_terminal()));
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_failure() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let result = ClientBuilder::new(&server.uri())
            .with_password("hunter2")
            .with_config(test_config())
            .connect()
            .await;
        match result {
            Err(SpiceError::AuthFailed(code)) => assert_eq!(code, LinkError::PermissionDenied as u32),
            Err(e) => panic!("expected AuthFailed, got {e:?}"),
            Ok(_) => panic!("expected AuthFailed, got a session"),
        }
    }

    #[tokio::test]
    async fn test_refused_cursor_channel_is_not_fatal() {
        let mut refuse = HashMap::new();
        refuse.insert(ChannelKind::Cursor.wire_type(), LinkError::ChannelNotAvailable);
        let server = MockSpiceServer::start(MockConfig {
            refuse,
            ..MockConfig::default()
        })
        .await
        .unwrap();
        let client = connect(&server).await;

        let cursor_failed = || {
            client
                .channel_states()
                .iter()
                .any(|(key, state)| key.kind == ChannelKind::Cursor && *state == ChannelState::Failed)
        };
        assert!(eventually(Duration::from_secs(2), cursor_failed).await);
        sleep(Duration::from_millis(100)).await;
        assert!(client.is_connected());
        assert!(client.failure().is_none());

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_ticket_too_long_is_refused_before_connecting() {
        let long = "x".repeat(SPICE_MAX_TICKET_BYTES + 1);
        let result = timeout(
            Duration::from_secs(2),
            ClientBuilder::new("spice://127.0.0.1:9")
                .with_password(long)
                .connect(),
        )
        .await
        .expect("refused without network access");
        assert!(matches!(
            result,
            Err(SpiceError::LinkFailed(LinkFailure::TicketTooLong(129)))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let result = timeout(
            Duration::from_secs(5),
            ClientBuilder::new("spice://127.0.0.1:1")
                .with_config(test_config())
                .connect(),
        )
        .await
        .expect("connect gives up");
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::ConnectFailed));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = MockSpiceServer::start(MockConfig::default()).await.unwrap();
        let client = connect(&server).await;

        client.disconnect().await;
        client.disconnect().await;

        assert!(!client.is_connected());
        assert!(client.failure().is_none());
        assert!(matches!(
            client.send_pointer_move(1, 1, 0).await,
            Err(SpiceError::NotConnected)
        ));
    }
}
