#[cfg(test)]
mod tests {
    use crate::protocol::*;
    use crate::wire_format::{from_wire, to_wire};
    use binrw::io::Cursor;
    use binrw::{BinRead, BinWrite};
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    #[test]
    fn test_spice_magic_constants() {
        assert_eq!(SPICE_MAGIC, 0x51444552, "SPICE_MAGIC should be 'REDQ'");
        assert_eq!(&SPICE_MAGIC.to_le_bytes(), b"REDQ");
    }

    #[test]
    fn test_spice_version_constants() {
        assert_eq!(SPICE_VERSION_MAJOR, 2);
        assert_eq!(SPICE_VERSION_MINOR, 2);
    }

    #[test]
    fn test_channel_kind_wire_types() {
        assert_eq!(ChannelKind::Main.wire_type(), 1);
        assert_eq!(ChannelKind::Display.wire_type(), 2);
        assert_eq!(ChannelKind::Inputs.wire_type(), 3);
        assert_eq!(ChannelKind::Cursor.wire_type(), 4);
        assert_eq!(ChannelKind::Playback.wire_type(), 5);
        assert_eq!(ChannelKind::WebDav.wire_type(), 11);

        for value in 0..=u8::MAX {
            assert_eq!(ChannelKind::from(value).wire_type(), value);
        }
        assert_eq!(ChannelKind::from(42), ChannelKind::Unknown(42));
    }

    #[test]
    fn test_only_core_kinds_are_interpreted() {
        assert!(ChannelKind::Main.is_interpreted());
        assert!(ChannelKind::Cursor.is_interpreted());
        assert!(!ChannelKind::Playback.is_interpreted());
        assert!(!ChannelKind::UsbRedir.is_interpreted());
        assert!(!ChannelKind::Unknown(200).is_interpreted());
    }

    #[test]
    fn test_spice_data_header_layout() {
        let header = SpiceDataHeader {
            serial: 0x0123456789ABCDEF,
            msg_type: 0x1234,
            msg_size: 0x56789ABC,
            sub_list: 0xDEF01234,
        };

        let mut cursor = Cursor::new(Vec::new());
        header.write(&mut cursor).unwrap();
        let buffer = cursor.into_inner();

        assert_eq!(buffer.len(), SPICE_DATA_HEADER_SIZE);
        assert_eq!(&buffer[0..8], &0x0123456789ABCDEF_u64.to_le_bytes(), "serial field");
        assert_eq!(&buffer[8..10], &0x1234_u16.to_le_bytes(), "msg_type field");
        assert_eq!(&buffer[10..14], &0x56789ABC_u32.to_le_bytes(), "msg_size field");
        assert_eq!(&buffer[14..18], &0xDEF01234_u32.to_le_bytes(), "sub_list field");

        let mut cursor = Cursor::new(&buffer);
        assert_eq!(SpiceDataHeader::read(&mut cursor).unwrap(), header);
    }

    #[test]
    fn test_spice_link_header_layout() {
        let header = SpiceLinkHeader {
            magic: SPICE_MAGIC,
            major_version: SPICE_VERSION_MAJOR,
            minor_version: SPICE_VERSION_MINOR,
            size: 100,
        };

        let mut cursor = Cursor::new(Vec::new());
        header.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), SPICE_LINK_HEADER_SIZE);
        assert_eq!(&bytes[0..4], b"REDQ");

        let mut cursor = Cursor::new(&bytes);
        assert_eq!(SpiceLinkHeader::read(&mut cursor).unwrap(), header);
    }

    #[test]
    fn test_spice_link_mess_is_packed() {
        let mess = SpiceLinkMess {
            connection_id: 0x12345678,
            channel_type: ChannelKind::Display.wire_type(),
            channel_id: 1,
            num_common_caps: 1,
            num_channel_caps: 1,
            caps_offset: SPICE_LINK_MESS_SIZE as u32,
        };

        let mut cursor = Cursor::new(Vec::new());
        mess.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), SPICE_LINK_MESS_SIZE);
        assert_eq!(&bytes[0..4], &0x12345678_u32.to_le_bytes());
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[5], 1);
        // num_common_caps immediately follows channel_id
        assert_eq!(&bytes[6..10], &1u32.to_le_bytes());
        assert_eq!(&bytes[14..18], &18u32.to_le_bytes());

        let mut cursor = Cursor::new(&bytes);
        assert_eq!(SpiceLinkMess::read(&mut cursor).unwrap(), mess);
    }

    #[test]
    fn test_spice_link_reply_layout() {
        let reply = SpiceLinkReplyData {
            error: LinkError::Ok as u32,
            pub_key: [0xAB; SPICE_TICKET_PUBKEY_BYTES],
            num_common_caps: 1,
            num_channel_caps: 0,
            caps_offset: SPICE_LINK_REPLY_SIZE as u32,
        };

        let mut cursor = Cursor::new(Vec::new());
        reply.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), SPICE_LINK_REPLY_SIZE);
        assert_eq!(&bytes[4..4 + SPICE_TICKET_PUBKEY_BYTES], &[0xAB; SPICE_TICKET_PUBKEY_BYTES][..]);

        let mut cursor = Cursor::new(&bytes);
        let decoded = SpiceLinkReplyData::read(&mut cursor).unwrap();
        assert_eq!(decoded.caps_offset, 178);
        assert_eq!(decoded.num_common_caps, 1);
    }

    #[test]
    fn test_link_error_codes() {
        assert_eq!(LinkError::from_code(0), LinkError::Ok);
        assert_eq!(LinkError::from_code(5), LinkError::NeedSecured);
        assert_eq!(LinkError::from_code(7), LinkError::PermissionDenied);
        assert_eq!(LinkError::from_code(9), LinkError::ChannelNotAvailable);
        // Unknown codes collapse to the generic error
        assert_eq!(LinkError::from_code(1000), LinkError::Error);
        assert_eq!(LinkError::PermissionDenied as u32, 7);
    }

    #[test]
    fn test_mouse_mode_wire_values() {
        assert_eq!(MouseMode::Server.wire_value(), 1);
        assert_eq!(MouseMode::Client.wire_value(), 2);
        assert_eq!(MouseMode::from_wire(2), Some(MouseMode::Client));
        assert_eq!(MouseMode::from_wire(1), Some(MouseMode::Server));
        assert_eq!(MouseMode::from_wire(3), None);
    }

    #[test]
    fn test_notify_severity_from_u32() {
        assert_eq!(NotifySeverity::from(0), NotifySeverity::Info);
        assert_eq!(NotifySeverity::from(1), NotifySeverity::Warn);
        assert_eq!(NotifySeverity::from(17), NotifySeverity::Error);
    }

    #[test]
    fn test_spice_msg_main_init_layout() {
        let init_msg = SpiceMsgMainInit {
            session_id: 0x12345678,
            display_channels_hint: 1,
            supported_mouse_modes: 0x3,
            current_mouse_mode: 0x2,
            agent_connected: 1,
            agent_tokens: 10,
            multi_media_time: 0,
            ram_hint: 0,
        };

        let mut cursor = Cursor::new(Vec::new());
        init_msg.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 32);

        let mut cursor = Cursor::new(&bytes);
        assert_eq!(SpiceMsgMainInit::read(&mut cursor).unwrap(), init_msg);
    }

    #[test]
    fn test_channels_list_decodes_pairs() {
        let bytes = [2u8, 0, 0, 0, 2, 0, 3, 0];
        let mut cursor = Cursor::new(&bytes[..]);
        let list = SpiceMsgMainChannelsList::read(&mut cursor).unwrap();
        assert_eq!(list.channels.len(), 2);
        assert_eq!((list.channels[0].type_, list.channels[0].id), (2, 0));
        assert_eq!((list.channels[1].type_, list.channels[1].id), (3, 0));
    }

    #[test]
    fn test_spice_rect_field_order() {
        let rect = SpiceRect {
            top: -50,
            left: -100,
            bottom: 768,
            right: 1024,
        };

        let mut cursor = Cursor::new(Vec::new());
        rect.write_le(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &(-50i32).to_le_bytes(), "top comes first");
        assert_eq!(&bytes[4..8], &(-100i32).to_le_bytes(), "then left");
        assert_eq!(&bytes[8..12], &768i32.to_le_bytes(), "then bottom");
        assert_eq!(&bytes[12..16], &1024i32.to_le_bytes(), "then right");

        let mut cursor = Cursor::new(&bytes);
        assert_eq!(SpiceRect::read_le(&mut cursor).unwrap(), rect);
    }

    #[test]
    fn test_mouse_motion_layout() {
        let motion = SpiceMsgcMouseMotion {
            dx: -3,
            dy: 1000,
            buttons_state: 0x1,
        };
        let mut cursor = Cursor::new(Vec::new());
        motion.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[0..4], &(-3i32).to_le_bytes());
    }

    #[test]
    fn test_mouse_position_layout() {
        let position = SpiceMsgcMousePosition {
            x: 640,
            y: 480,
            buttons_state: 0,
            display_id: 1,
        };
        let mut cursor = Cursor::new(Vec::new());
        position.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[10], 1);
    }

    #[test]
    fn test_display_init_layout() {
        let init = SpiceMsgcDisplayInit {
            pixmap_cache_id: 1,
            pixmap_cache_size: 1 << 24,
            glz_dictionary_id: 0,
            glz_dictionary_window_size: 0,
        };
        let mut cursor = Cursor::new(Vec::new());
        init.write(&mut cursor).unwrap();
        assert_eq!(cursor.into_inner().len(), 14);
    }
    fn round_trip<T>(value: &T) -> Result<usize, TestCaseError>
    where
        T: for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + PartialEq + std::fmt::Debug,
    {
        let bytes = to_wire(value).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let decoded: T = from_wire(&bytes).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(&decoded, value);
        Ok(bytes.len())
    }

    proptest! {
        #[test]
        fn prop_data_header_round_trip(serial in any::<u64>(), msg_type in any::<u16>(), msg_size in any::<u32>(), sub_list in any::<u32>()) {
            let len = round_trip(&SpiceDataHeader { serial, msg_type, msg_size, sub_list })?;
            prop_assert_eq!(len, SPICE_DATA_HEADER_SIZE);
        }

        #[test]
        fn prop_common_messages_round_trip(a in any::<u32>(), b in any::<u32>(), t in any::<u64>(), text in proptest::collection::vec(any::<u8>(), 0..64)) {
            round_trip(&SpiceMsgSetAck { generation: a, window: b })?;
            round_trip(&SpiceMsgcAckSync { generation: a })?;
            round_trip(&SpiceMsgPing { id: a, timestamp: t })?;
            round_trip(&SpiceMsgcPong { id: a, timestamp: t })?;
            round_trip(&SpiceMsgDisconnecting { time_stamp: t, reason: b })?;
            round_trip(&SpiceMsgNotify {
                time_stamp: t,
                severity: a,
                visibility: b,
                what: a ^ b,
                message_len: text.len() as u32,
                message: text,
            })?;
        }

        #[test]
        fn prop_main_messages_round_trip(words in any::<[u32; 8]>(), modes in any::<(u16, u16)>(), ids in proptest::collection::vec(any::<(u8, u8)>(), 0..16), uuid in any::<[u8; 16]>()) {
            let [session_id, display_channels_hint, supported_mouse_modes, current_mouse_mode, agent_connected, agent_tokens, multi_media_time, ram_hint] = words;
            round_trip(&SpiceMsgMainInit {
                session_id,
                display_channels_hint,
                supported_mouse_modes,
                current_mouse_mode,
                agent_connected,
                agent_tokens,
                multi_media_time,
                ram_hint,
            })?;
            let channels: Vec<ChannelId> = ids.iter().map(|&(type_, id)| ChannelId { type_, id }).collect();
            round_trip(&SpiceMsgMainChannelsList { num_of_channels: channels.len() as u32, channels })?;
            round_trip(&SpiceMsgMainMouseMode { supported_modes: modes.0, current_mode: modes.1 })?;
            round_trip(&SpiceMsgcMainMouseModeRequest { mode: modes.1 })?;
            round_trip(&SpiceMsgMainMultiMediaTime { time: multi_media_time })?;
            let name: Vec<u8> = ids.iter().map(|&(t, _)| t).collect();
            round_trip(&SpiceMsgMainName { name_len: name.len() as u32, name })?;
            round_trip(&SpiceMsgMainUuid { uuid })?;
        }

        #[test]
        fn prop_display_messages_round_trip(words in any::<[u32; 7]>(), cache in any::<(u8, i64, u8, i32)>(), delay in any::<i32>(), heads in 0usize..8) {
            let [a, b, c, d, e, f, g] = words;
            round_trip(&SpiceMsgcDisplayInit {
                pixmap_cache_id: cache.0,
                pixmap_cache_size: cache.1,
                glz_dictionary_id: cache.2,
                glz_dictionary_window_size: cache.3,
            })?;
            round_trip(&SpiceMsgSurfaceCreate { surface_id: a, width: b, height: c, format: d, flags: e })?;
            round_trip(&SpiceMsgSurfaceDestroy { surface_id: a })?;
            round_trip(&SpiceMsgDisplayMode { x_res: b, y_res: c, bits: d })?;
            let head = SpiceHead { id: a, surface_id: b, width: c, height: d, x: e, y: f, flags: g };
            round_trip(&SpiceMsgMonitorsConfig {
                count: heads as u16,
                max_allowed: heads as u16 + 1,
                heads: vec![head; heads],
            })?;
            round_trip(&SpiceMsgStreamActivateReport { stream_id: a, unique_id: b, max_window_size: c, timeout_ms: d })?;
            round_trip(&SpiceMsgcStreamReport {
                stream_id: a,
                unique_id: b,
                start_frame_mm_time: c,
                end_frame_mm_time: d,
                num_frames: e,
                num_drops: f,
                last_frame_delay: delay,
                audio_delay: g,
            })?;
            round_trip(&SpiceRect { top: delay, left: a as i32, bottom: b as i32, right: c as i32 })?;
            round_trip(&SpicePoint { x: delay, y: d as i32 })?;
        }

        #[test]
        fn prop_input_messages_round_trip(code in any::<u32>(), dx in any::<i32>(), dy in any::<i32>(), buttons in any::<u16>(), button in any::<u8>()) {
            round_trip(&SpiceMsgInputsInit { keyboard_modifiers: buttons })?;
            round_trip(&SpiceMsgInputsKeyModifiers { modifiers: buttons })?;
            round_trip(&SpiceMsgcKeyDown { code })?;
            round_trip(&SpiceMsgcKeyUp { code })?;
            round_trip(&SpiceMsgcMouseMotion { dx, dy, buttons_state: buttons })?;
            round_trip(&SpiceMsgcMousePosition { x: dx as u32, y: dy as u32, buttons_state: buttons, display_id: button })?;
            round_trip(&SpiceMsgcMousePress { button, buttons_state: buttons })?;
            round_trip(&SpiceMsgcMouseRelease { button, buttons_state: buttons })?;
        }

        #[test]
        fn prop_cursor_messages_round_trip(unique in any::<u64>(), type_ in any::<u8>(), dims in any::<[u16; 4]>()) {
            round_trip(&SpiceCursorHeader {
                unique,
                type_,
                width: dims[0],
                height: dims[1],
                hot_spot_x: dims[2],
                hot_spot_y: dims[3],
            })?;
            round_trip(&SpiceMsgCursorTrail { length: dims[0], frequency: dims[1] })?;
        }
    }
}
