use crate::channels::{ChannelContext, ChannelControl, ChannelEventKind, ChannelHandler, ChannelKey, ChannelState};
use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::wire_format::{from_wire, InboundMessage};
use tracing::{debug, info, warn};

/// What the server announced in `MAIN_INIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInit {
    pub session_id: u32,
    pub display_channels_hint: u32,
    /// Bit mask of `SPICE_MOUSE_MODE_*`.
    pub supported_mouse_modes: u32,
    pub current_mouse_mode: MouseMode,
    pub agent_connected: bool,
    pub multi_media_time: u32,
    pub ram_hint: u32,
}

/// Session bootstrap and control messages.
pub struct MainChannel {
    preferred_mouse_mode: Option<MouseMode>,
    init: Option<ServerInit>,
}

impl MainChannel {
    pub fn new(preferred_mouse_mode: Option<MouseMode>) -> Self {
        Self {
            preferred_mouse_mode,
            init: None,
        }
    }

    pub fn init(&self) -> Option<&ServerInit> {
        self.init.as_ref()
    }

    fn handle_init(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()> {
        if self.init.is_some() {
            return Err(SpiceError::Protocol("duplicate MAIN_INIT".into()));
        }
        let raw: SpiceMsgMainInit = from_wire(&msg.body)?;
        let current = MouseMode::from_wire(raw.current_mouse_mode).ok_or_else(|| {
            SpiceError::Protocol(format!("unknown mouse mode {}", raw.current_mouse_mode))
        })?;
        let init = ServerInit {
            session_id: raw.session_id,
            display_channels_hint: raw.display_channels_hint,
            supported_mouse_modes: raw.supported_mouse_modes,
            current_mouse_mode: current,
            agent_connected: raw.agent_connected != 0,
            multi_media_time: raw.multi_media_time,
            ram_hint: raw.ram_hint,
        };
        info!(
            "Main channel init: session_id={:#x}, displays={}, mouse_mode={:?}",
            init.session_id, init.display_channels_hint, init.current_mouse_mode
        );

        ctx.send_raw(SPICE_MSGC_MAIN_ATTACH_CHANNELS, Vec::new());

        if let Some(preferred) = self.preferred_mouse_mode {
            let supported = init.supported_mouse_modes & preferred.wire_value() as u32 != 0;
            if supported && preferred != current {
                debug!("Requesting mouse mode {:?}", preferred);
                ctx.send(
                    SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST,
                    &SpiceMsgcMainMouseModeRequest {
                        mode: preferred.wire_value(),
                    },
                )?;
            }
        }

        self.init = Some(init);
        ctx.post(ChannelEventKind::Init(init));
        ctx.mark_ready();
        Ok(())
    }
}

impl ChannelHandler for MainChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Main
    }

    fn state_after_link(&self) -> ChannelState {
        ChannelState::AwaitingInit
    }

    fn handle_message(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()> {
        if msg.msg_type() == SPICE_MSG_MAIN_INIT {
            return self.handle_init(ctx, msg);
        }
        if self.init.is_none() {
            return Err(SpiceError::Protocol(format!(
                "main message {} before MAIN_INIT",
                msg.msg_type()
            )));
        }

        match msg.msg_type() {
            SPICE_MSG_MAIN_CHANNELS_LIST => {
                let list: SpiceMsgMainChannelsList = from_wire(&msg.body)?;
                let keys: Vec<ChannelKey> = list
                    .channels
                    .iter()
                    .map(|c| ChannelKey::new(ChannelKind::from(c.type_), c.id))
                    .collect();
                info!("Server offers {} channels: {:?}", keys.len(), keys);
                ctx.post(ChannelEventKind::ChannelsList(keys));
            }
            SPICE_MSG_MAIN_MOUSE_MODE => {
                let mode: SpiceMsgMainMouseMode = from_wire(&msg.body)?;
                let current = MouseMode::from_wire(mode.current_mode as u32).ok_or_else(|| {
                    SpiceError::Protocol(format!("unknown mouse mode {}", mode.current_mode))
                })?;
                info!("Mouse mode is now {:?}", current);
                ctx.post(ChannelEventKind::MouseMode {
                    supported: mode.supported_modes,
                    current,
                });
            }
            SPICE_MSG_MAIN_MULTI_MEDIA_TIME => {
                let time: SpiceMsgMainMultiMediaTime = from_wire(&msg.body)?;
                ctx.post(ChannelEventKind::MultiMediaTime(time.time));
            }
            SPICE_MSG_MAIN_NAME => {
                let name: SpiceMsgMainName = from_wire(&msg.body)?;
                let name = String::from_utf8_lossy(&name.name)
                    .trim_end_matches('\0')
                    .to_string();
                debug!("Server name: {}", name);
                ctx.post(ChannelEventKind::Name(name));
            }
            SPICE_MSG_MAIN_UUID => {
                let uuid: SpiceMsgMainUuid = from_wire(&msg.body)?;
                ctx.post(ChannelEventKind::Uuid(uuid.uuid));
            }
            SPICE_MSG_MAIN_AGENT_CONNECTED
            | SPICE_MSG_MAIN_AGENT_DISCONNECTED
            | SPICE_MSG_MAIN_AGENT_DATA
            | SPICE_MSG_MAIN_AGENT_TOKEN
            | SPICE_MSG_MAIN_AGENT_CONNECTED_TOKENS => {
                debug!("Ignoring agent message {}", msg.msg_type());
            }
            SPICE_MSG_MAIN_MIGRATE_BEGIN
            | SPICE_MSG_MAIN_MIGRATE_CANCEL
            | SPICE_MSG_MAIN_MIGRATE_SWITCH_HOST
            | SPICE_MSG_MAIN_MIGRATE_END => {
                warn!("Ignoring migration message {}", msg.msg_type());
            }
            other => {
                debug!("Unhandled main message type {}", other);
            }
        }
        Ok(())
    }

    /// A host request for another pointer mode.
    fn on_control(&mut self, ctx: &mut ChannelContext, control: ChannelControl) -> Result<()> {
        let ChannelControl::MouseMode(mode) = control else {
            return Ok(());
        };
        let Some(init) = self.init else {
            self.preferred_mouse_mode = Some(mode);
            return Ok(());
        };
        if init.supported_mouse_modes & mode.wire_value() as u32 == 0 {
            warn!("Server does not support mouse mode {:?}", mode);
            return Ok(());
        }
        ctx.send(
            SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST,
            &SpiceMsgcMainMouseModeRequest {
                mode: mode.wire_value(),
            },
        )
    }
}
