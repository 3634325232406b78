pub mod connection;
pub mod cursor;
pub mod display;
pub mod inputs;
pub mod link;
pub mod main;


use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::video::ConsumerEvent;
use crate::wire_format::{from_wire, to_wire, InboundMessage};
use binrw::BinWrite;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use cursor::{CursorChannel, CursorEvent, CursorSprite};
pub use display::DisplayChannel;
pub use inputs::{InputEvent, InputQueue, InputsChannel, KeyModifiers, PointerButton, ScrollAxis};
pub use link::{Capabilities, Ticket};
pub use main::{MainChannel, ServerInit};

/// Identifies a channel within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub kind: ChannelKind,
    pub id: u8,
}

impl ChannelKey {
    pub const MAIN: ChannelKey = ChannelKey {
        kind: ChannelKind::Main,
        id: 0,
    };

    pub fn new(kind: ChannelKind, id: u8) -> Self {
        Self { kind, id }
    }

    /// Losing this channel ends the session.
    pub fn is_critical(&self) -> bool {
        matches!(
            (self.kind, self.id),
            (ChannelKind::Main, _) | (ChannelKind::Display, 0)
        )
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// Channel lifecycle.
///
/// ```text
/// Unconnected -> Linking -> Authenticating -> [AwaitingInit] -> Ready -> Draining -> Closed
///       \____________\______________\_______________\____________\________-> Failed
/// ```
///
/// `AwaitingInit` is only used by the main channel. Transitions never move
/// backwards and the two terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Unconnected,
    Linking,
    Authenticating,
    AwaitingInit,
    Ready,
    Draining,
    Closed,
    Failed,
}

impl ChannelState {
    fn rank(self) -> u8 {
        match self {
            ChannelState::Unconnected => 0,
            ChannelState::Linking => 1,
            ChannelState::Authenticating => 2,
            ChannelState::AwaitingInit => 3,
            ChannelState::Ready => 4,
            ChannelState::Draining => 5,
            ChannelState::Closed | ChannelState::Failed => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }

    pub fn can_transition_to(self, next: ChannelState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == ChannelState::Failed || next.rank() > self.rank()
    }
}

/// A client message waiting for the writer task. Serials are assigned by
/// the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub msg_type: u16,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(msg_type: u16, body: Vec<u8>) -> Self {
        Self { msg_type, body }
    }

    pub fn encode<T>(msg_type: u16, value: &T) -> Result<Self>
    where
        T: for<'a> BinWrite<Args<'a> = ()>,
    {
        Ok(Self::new(msg_type, to_wire(value)?))
    }
}

/// A server-originated notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: NotifySeverity,
    pub visibility: u32,
    pub what: u32,
    pub message: String,
}

/// What a channel reports to the session coordinator.
#[derive(Debug)]
pub(crate) enum ChannelEventKind {
    Init(ServerInit),
    ChannelsList(Vec<ChannelKey>),
    MouseMode { supported: u16, current: MouseMode },
    MultiMediaTime(u32),
    Name(String),
    Uuid([u8; 16]),
    Notify(Notification),
    Disconnecting(LinkError),
    SurfaceCreated { surface_id: u32, width: u32, height: u32, primary: bool },
    SurfaceDestroyed { surface_id: u32 },
    Monitors(Vec<SpiceHead>),
    FramePresented { surface_id: u32, seq: u64 },
    Modifiers(KeyModifiers),
    Closed,
    Failed(SpiceError),
}

#[derive(Debug)]
pub(crate) struct ChannelEvent {
    pub key: ChannelKey,
    pub kind: ChannelEventKind,
}

/// Session-to-channel notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelControl {
    MouseMode(MouseMode),
    FrameTick,
    Drain { deadline: Instant },
}

/// Side effects collected while a handler runs; the dispatcher performs
/// them once the handler returns.
#[derive(Debug, Default)]
pub(crate) struct ChannelContext {
    pub outbound: Vec<OutboundMessage>,
    pub events: Vec<ChannelEventKind>,
    pub consumer: Vec<ConsumerEvent>,
    pub ready: bool,
    pub draining: bool,
}

impl ChannelContext {
    pub fn send<T>(&mut self, msg_type: u16, value: &T) -> Result<()>
    where
        T: for<'a> BinWrite<Args<'a> = ()>,
    {
        self.outbound.push(OutboundMessage::encode(msg_type, value)?);
        Ok(())
    }

    pub fn send_raw(&mut self, msg_type: u16, body: Vec<u8>) {
        self.outbound.push(OutboundMessage::new(msg_type, body));
    }

    pub fn post(&mut self, event: ChannelEventKind) {
        self.events.push(event);
    }

    pub fn emit(&mut self, event: ConsumerEvent) {
        self.consumer.push(event);
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn start_draining(&mut self) {
        self.draining = true;
    }
}

/// ACK window accounting for one channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckState {
    pub generation: u32,
    pub window: u32,
    pub since_ack: u32,
}

impl AckState {
    fn reset(&mut self, generation: u32, window: u32) {
        self.generation = generation;
        self.window = window;
        self.since_ack = 0;
    }

    fn on_message(&mut self, ctx: &mut ChannelContext) {
        if self.window == 0 {
            return;
        }
        self.since_ack += 1;
        if self.since_ack >= self.window {
            self.since_ack = 0;
            ctx.send_raw(SPICE_MSGC_ACK, Vec::new());
        }
    }
}

/// Messages every channel kind understands. Returns `true` when the message
/// was consumed here.
pub(crate) fn handle_common(
    key: ChannelKey,
    ack: &mut AckState,
    ctx: &mut ChannelContext,
    msg: &InboundMessage,
) -> Result<bool> {
    if msg.msg_type() != SPICE_MSG_SET_ACK {
        ack.on_message(ctx);
    }

    match msg.msg_type() {
        SPICE_MSG_SET_ACK => {
            let set_ack: SpiceMsgSetAck = from_wire(&msg.body)?;
            debug!(channel = %key, generation = set_ack.generation, window = set_ack.window, "set ack");
            ack.reset(set_ack.generation, set_ack.window);
            ctx.send(
                SPICE_MSGC_ACK_SYNC,
                &SpiceMsgcAckSync {
                    generation: set_ack.generation,
                },
            )?;
        }
        SPICE_MSG_PING => {
            let ping: SpiceMsgPing = from_wire(&msg.body)?;
            ctx.send(
                SPICE_MSGC_PONG,
                &SpiceMsgcPong {
                    id: ping.id,
                    timestamp: ping.timestamp,
                },
            )?;
        }
        SPICE_MSG_WAIT_FOR_CHANNELS => {
            debug!(channel = %key, "ignoring WAIT_FOR_CHANNELS");
        }
        SPICE_MSG_DISCONNECTING => {
            let msg: SpiceMsgDisconnecting = from_wire(&msg.body)?;
            let reason = LinkError::from_code(msg.reason);
            info!(channel = %key, ?reason, "server is disconnecting");
            ctx.post(ChannelEventKind::Disconnecting(reason));
            ctx.start_draining();
        }
        SPICE_MSG_NOTIFY => {
            let notify: SpiceMsgNotify = from_wire(&msg.body)?;
            let text = String::from_utf8_lossy(&notify.message)
                .trim_end_matches('\0')
                .to_string();
            ctx.post(ChannelEventKind::Notify(Notification {
                severity: NotifySeverity::from(notify.severity),
                visibility: notify.visibility,
                what: notify.what,
                message: text,
            }));
        }
        SPICE_MSG_MIGRATE | SPICE_MSG_MIGRATE_DATA => {
            warn!(channel = %key, "migration is not supported, ignoring");
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Behaviour shared by every channel kind.
pub(crate) trait ChannelHandler {
    fn kind(&self) -> ChannelKind;

    /// State entered once authentication succeeds.
    fn state_after_link(&self) -> ChannelState {
        ChannelState::Ready
    }

    fn on_linked(&mut self, _ctx: &mut ChannelContext) -> Result<()> {
        Ok(())
    }

    fn handle_message(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()>;

    fn on_control(&mut self, _ctx: &mut ChannelContext, _control: ChannelControl) -> Result<()> {
        Ok(())
    }

    /// The inbound queue ran dry after at least one message.
    fn on_quiescent(&mut self, _ctx: &mut ChannelContext) -> Result<()> {
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(&mut self, _ctx: &mut ChannelContext) -> Result<()> {
        Ok(())
    }

    /// Last chance to queue messages before the writer is closed.
    fn on_shutdown(&mut self, _ctx: &mut ChannelContext) {}
}

/// Tagged channel variant; unknown kinds get `Passive`, which only keeps
/// serial and ACK accounting alive.
pub(crate) enum ChannelRole {
    Main(MainChannel),
    Display(Box<DisplayChannel>),
    Inputs(InputsChannel),
    Cursor(CursorChannel),
    Passive(ChannelKind),
}

impl ChannelRole {
    fn handler(&mut self) -> Option<&mut dyn ChannelHandler> {
        match self {
            ChannelRole::Main(c) => Some(c),
            ChannelRole::Display(c) => Some(c.as_mut()),
            ChannelRole::Inputs(c) => Some(c),
            ChannelRole::Cursor(c) => Some(c),
            ChannelRole::Passive(_) => None,
        }
    }

    fn handler_ref(&self) -> Option<&dyn ChannelHandler> {
        match self {
            ChannelRole::Main(c) => Some(c),
            ChannelRole::Display(c) => Some(c.as_ref()),
            ChannelRole::Inputs(c) => Some(c),
            ChannelRole::Cursor(c) => Some(c),
            ChannelRole::Passive(_) => None,
        }
    }

    pub fn submit_input(&mut self, ctx: &mut ChannelContext, event: InputEvent) -> Result<()> {
        match self {
            ChannelRole::Inputs(inputs) => inputs.submit(ctx, event),
            _ => Ok(()),
        }
    }
}

impl ChannelHandler for ChannelRole {
    fn kind(&self) -> ChannelKind {
        match self {
            ChannelRole::Passive(kind) => *kind,
            other => other.handler_ref().map(|h| h.kind()).unwrap_or(ChannelKind::Unknown(0)),
        }
    }

    fn state_after_link(&self) -> ChannelState {
        self.handler_ref()
            .map(|h| h.state_after_link())
            .unwrap_or(ChannelState::Ready)
    }

    fn on_linked(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        match self.handler() {
            Some(h) => h.on_linked(ctx),
            None => Ok(()),
        }
    }

    fn handle_message(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()> {
        match self.handler() {
            Some(h) => h.handle_message(ctx, msg),
            None => Ok(()),
        }
    }

    fn on_control(&mut self, ctx: &mut ChannelContext, control: ChannelControl) -> Result<()> {
        match self.handler() {
            Some(h) => h.on_control(ctx, control),
            None => Ok(()),
        }
    }

    fn on_quiescent(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        match self.handler() {
            Some(h) => h.on_quiescent(ctx),
            None => Ok(()),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.handler_ref().and_then(|h| h.deadline())
    }

    fn on_deadline(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        match self.handler() {
            Some(h) => h.on_deadline(ctx),
            None => Ok(()),
        }
    }

    fn on_shutdown(&mut self, ctx: &mut ChannelContext) {
        if let Some(h) = self.handler() {
            h.on_shutdown(ctx);
        }
    }
}
