//! Inputs channel: keyboard and pointer events from the host, plus the
//! lock-key LED state reported by the server.

use crate::channels::{ChannelContext, ChannelControl, ChannelEventKind, ChannelHandler};
use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::wire_format::{from_wire, InboundMessage};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerButton {
    Left,
    Middle,
    Right,
    Up,
    Down,
}

impl PointerButton {
    /// Host button numbering: 0 left, 1 right, 2 middle.
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(PointerButton::Left),
            1 => Some(PointerButton::Right),
            2 => Some(PointerButton::Middle),
            _ => None,
        }
    }

    fn wire(self) -> u8 {
        match self {
            PointerButton::Left => SPICE_MOUSE_BUTTON_LEFT,
            PointerButton::Middle => SPICE_MOUSE_BUTTON_MIDDLE,
            PointerButton::Right => SPICE_MOUSE_BUTTON_RIGHT,
            PointerButton::Up => SPICE_MOUSE_BUTTON_UP,
            PointerButton::Down => SPICE_MOUSE_BUTTON_DOWN,
        }
    }

    fn mask(self) -> u16 {
        match self {
            PointerButton::Left => SPICE_MOUSE_BUTTON_MASK_LEFT,
            PointerButton::Middle => SPICE_MOUSE_BUTTON_MASK_MIDDLE,
            PointerButton::Right => SPICE_MOUSE_BUTTON_MASK_RIGHT,
            PointerButton::Up | PointerButton::Down => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrollAxis {
    Vertical,
    Horizontal,
}

/// One host input event.
///
/// `PointerMove` carries deltas in client mouse mode and absolute surface
/// coordinates in server mouse mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key { scancode: u32, pressed: bool },
    PointerMove { x: i32, y: i32, surface_id: u32 },
    PointerButton { button: PointerButton, pressed: bool },
    PointerScroll { axis: ScrollAxis, delta: i32 },
}

impl InputEvent {
    pub fn is_coalescible(&self) -> bool {
        matches!(self, InputEvent::PointerMove { .. })
    }
}

/// Remote lock-key LED state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyModifiers {
    pub scroll_lock: bool,
    pub num_lock: bool,
    pub caps_lock: bool,
}

impl KeyModifiers {
    pub fn from_wire(bits: u16) -> Self {
        Self {
            scroll_lock: bits & SPICE_KEYBOARD_MODIFIER_SCROLL_LOCK != 0,
            num_lock: bits & SPICE_KEYBOARD_MODIFIER_NUM_LOCK != 0,
            caps_lock: bits & SPICE_KEYBOARD_MODIFIER_CAPS_LOCK != 0,
        }
    }

    pub fn to_wire(self) -> u16 {
        let mut bits = 0;
        if self.scroll_lock {
            bits |= SPICE_KEYBOARD_MODIFIER_SCROLL_LOCK;
        }
        if self.num_lock {
            bits |= SPICE_KEYBOARD_MODIFIER_NUM_LOCK;
        }
        if self.caps_lock {
            bits |= SPICE_KEYBOARD_MODIFIER_CAPS_LOCK;
        }
        bits
    }
}

fn is_extended(scancode: u32) -> bool {
    scancode & 0xff00 == 0xe000
}

/// PS/2 make code as sent in `KEY_DOWN`. Extended keys are given as
/// `0xE0xx` and go out as the byte sequence `E0 xx`.
pub fn make_code(scancode: u32) -> u32 {
    if is_extended(scancode) {
        0xe0 | ((scancode & 0x7f) << 8)
    } else {
        scancode & 0x7f
    }
}

/// PS/2 break code as sent in `KEY_UP`.
pub fn break_code(scancode: u32) -> u32 {
    if is_extended(scancode) {
        0xe0 | (((scancode & 0x7f) | 0x80) << 8)
    } else {
        (scancode & 0x7f) | 0x80
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<InputEvent>,
    /// Motion is summed rather than replaced while queued.
    relative: bool,
    closed: bool,
}

impl QueueState {
    /// Fold `event` into a motion at the tail of the queue.
    fn coalesce_tail(&mut self, event: InputEvent) -> bool {
        let relative = self.relative;
        match (self.events.back_mut(), event) {
            (
                Some(InputEvent::PointerMove { x, y, surface_id }),
                InputEvent::PointerMove {
                    x: nx,
                    y: ny,
                    surface_id: ns,
                },
            ) => {
                if relative {
                    *x = x.saturating_add(nx);
                    *y = y.saturating_add(ny);
                } else {
                    *x = nx;
                    *y = ny;
                }
                *surface_id = ns;
                true
            }
            _ => false,
        }
    }
}

/// Bounded queue between the host and the inputs channel. Consecutive
/// pointer motion is merged; when full, the oldest pointer motion is
/// dropped and keys and buttons wait for room.
#[derive(Debug)]
pub struct InputQueue {
    state: Mutex<QueueState>,
    items: Notify,
    space: Notify,
    capacity: usize,
}

enum Push {
    Done,
    Wait,
}

impl InputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            items: Notify::new(),
            space: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_push(&self, event: InputEvent) -> Result<Push> {
        let mut state = self.lock();
        if state.closed {
            return Err(SpiceError::NotConnected);
        }
        if state.coalesce_tail(event) {
            return Ok(Push::Done);
        }
        if state.events.len() < self.capacity {
            state.events.push_back(event);
        } else if let Some(pos) = state.events.iter().position(InputEvent::is_coalescible) {
            state.events.remove(pos);
            state.events.push_back(event);
        } else if event.is_coalescible() {
            // The new motion is the oldest coalescible event
            return Ok(Push::Done);
        } else {
            return Ok(Push::Wait);
        }
        drop(state);
        self.items.notify_one();
        Ok(Push::Done)
    }

    pub async fn push(&self, event: InputEvent) -> Result<()> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            match self.try_push(event)? {
                Push::Done => return Ok(()),
                Push::Wait => space.await,
            }
        }
    }

    pub fn try_pop(&self) -> Option<InputEvent> {
        let event = self.lock().events.pop_front();
        if event.is_some() {
            self.space.notify_one();
        }
        event
    }

    /// Wait for the next event. `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<InputEvent> {
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.lock().closed {
                return None;
            }
            items.await;
        }
    }

    /// Select how queued motion merges: summed deltas in client mode, last
    /// position wins in server mode.
    pub fn set_mouse_mode(&self, mode: MouseMode) {
        self.lock().relative = mode == MouseMode::Client;
    }

    /// Refuse further events and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingPointer {
    Relative { dx: i32, dy: i32 },
    Absolute { x: u32, y: u32, display_id: u8 },
}

/// Encodes host input onto the inputs channel.
pub struct InputsChannel {
    mouse_mode: MouseMode,
    modifiers: KeyModifiers,
    buttons_state: u16,
    pressed_keys: BTreeSet<u32>,
    pressed_buttons: BTreeSet<u8>,
    /// One pointer message may go out per presented frame or motion ack,
    /// or once `flush_interval` has passed without either.
    pointer_credit: bool,
    pending: Option<PendingPointer>,
    flush_interval: Duration,
    credit_restore_at: Option<Instant>,
}

/// Roughly one frame at 30 Hz.
pub const DEFAULT_POINTER_FLUSH_INTERVAL: Duration = Duration::from_millis(33);

impl InputsChannel {
    pub fn new(mouse_mode: MouseMode) -> Self {
        Self {
            mouse_mode,
            modifiers: KeyModifiers::default(),
            buttons_state: 0,
            pressed_keys: BTreeSet::new(),
            pressed_buttons: BTreeSet::new(),
            pointer_credit: true,
            pending: None,
            flush_interval: DEFAULT_POINTER_FLUSH_INTERVAL,
            credit_restore_at: None,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn mouse_mode(&self) -> MouseMode {
        self.mouse_mode
    }

    pub fn modifiers(&self) -> KeyModifiers {
        self.modifiers
    }

    pub fn pressed_keys(&self) -> impl Iterator<Item = &u32> {
        self.pressed_keys.iter()
    }

    pub fn submit(&mut self, ctx: &mut ChannelContext, event: InputEvent) -> Result<()> {
        match event {
            InputEvent::Key { scancode, pressed } => self.send_key(ctx, scancode, pressed),
            InputEvent::PointerMove { x, y, surface_id } => {
                self.queue_motion(x, y, surface_id);
                if self.pointer_credit {
                    self.flush_pointer(ctx)?;
                }
                Ok(())
            }
            InputEvent::PointerButton { button, pressed } => {
                self.flush_pointer(ctx)?;
                self.send_button(ctx, button, pressed)
            }
            InputEvent::PointerScroll { axis, delta } => {
                if axis == ScrollAxis::Horizontal {
                    debug!("Dropping horizontal scroll, no wire encoding");
                    return Ok(());
                }
                self.flush_pointer(ctx)?;
                let button = if delta < 0 { PointerButton::Up } else { PointerButton::Down };
                for _ in 0..delta.unsigned_abs() {
                    self.send_button(ctx, button, true)?;
                    self.send_button(ctx, button, false)?;
                }
                Ok(())
            }
        }
    }

    fn send_key(&mut self, ctx: &mut ChannelContext, scancode: u32, pressed: bool) -> Result<()> {
        if pressed {
            self.pressed_keys.insert(scancode);
            ctx.send(SPICE_MSGC_INPUTS_KEY_DOWN, &SpiceMsgcKeyDown { code: make_code(scancode) })
        } else {
            self.pressed_keys.remove(&scancode);
            ctx.send(SPICE_MSGC_INPUTS_KEY_UP, &SpiceMsgcKeyUp { code: break_code(scancode) })
        }
    }

    fn send_button(&mut self, ctx: &mut ChannelContext, button: PointerButton, pressed: bool) -> Result<()> {
        if pressed {
            self.buttons_state |= button.mask();
            if button.mask() != 0 {
                self.pressed_buttons.insert(button.wire());
            }
            ctx.send(
                SPICE_MSGC_INPUTS_MOUSE_PRESS,
                &SpiceMsgcMousePress {
                    button: button.wire(),
                    buttons_state: self.buttons_state,
                },
            )
        } else {
            self.buttons_state &= !button.mask();
            self.pressed_buttons.remove(&button.wire());
            ctx.send(
                SPICE_MSGC_INPUTS_MOUSE_RELEASE,
                &SpiceMsgcMouseRelease {
                    button: button.wire(),
                    buttons_state: self.buttons_state,
                },
            )
        }
    }

    fn queue_motion(&mut self, x: i32, y: i32, surface_id: u32) {
        self.pending = Some(match (self.mouse_mode, self.pending) {
            (MouseMode::Client, Some(PendingPointer::Relative { dx, dy })) => PendingPointer::Relative {
                dx: dx.saturating_add(x),
                dy: dy.saturating_add(y),
            },
            (MouseMode::Client, _) => PendingPointer::Relative { dx: x, dy: y },
            (MouseMode::Server, _) => PendingPointer::Absolute {
                x: x.max(0) as u32,
                y: y.max(0) as u32,
                display_id: surface_id.min(u8::MAX as u32) as u8,
            },
        });
    }

    /// Send the coalesced pointer state, if any, spending the credit.
    fn flush_pointer(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.pointer_credit = false;
        self.credit_restore_at = Some(Instant::now() + self.flush_interval);
        match pending {
            PendingPointer::Relative { dx, dy } => ctx.send(
                SPICE_MSGC_INPUTS_MOUSE_MOTION,
                &SpiceMsgcMouseMotion {
                    dx,
                    dy,
                    buttons_state: self.buttons_state,
                },
            ),
            PendingPointer::Absolute { x, y, display_id } => ctx.send(
                SPICE_MSGC_INPUTS_MOUSE_POSITION,
                &SpiceMsgcMousePosition {
                    x,
                    y,
                    buttons_state: self.buttons_state,
                    display_id,
                },
            ),
        }
    }

    fn replenish(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        self.pointer_credit = true;
        self.credit_restore_at = None;
        self.flush_pointer(ctx)
    }

    fn update_modifiers(&mut self, ctx: &mut ChannelContext, bits: u16) {
        let modifiers = KeyModifiers::from_wire(bits);
        if modifiers != self.modifiers {
            debug!("Remote lock keys: {:?}", modifiers);
        }
        self.modifiers = modifiers;
        ctx.post(ChannelEventKind::Modifiers(modifiers));
    }
}

impl ChannelHandler for InputsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Inputs
    }

    fn handle_message(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()> {
        match msg.msg_type() {
            SPICE_MSG_INPUTS_INIT => {
                let init: SpiceMsgInputsInit = from_wire(&msg.body)?;
                info!("Inputs channel initialized, modifiers={:#x}", init.keyboard_modifiers);
                self.update_modifiers(ctx, init.keyboard_modifiers);
            }
            SPICE_MSG_INPUTS_KEY_MODIFIERS => {
                let mods: SpiceMsgInputsKeyModifiers = from_wire(&msg.body)?;
                self.update_modifiers(ctx, mods.modifiers);
            }
            SPICE_MSG_INPUTS_MOUSE_MOTION_ACK => self.replenish(ctx)?,
            other => debug!("Unhandled inputs message type {}", other),
        }
        Ok(())
    }

    fn on_control(&mut self, ctx: &mut ChannelContext, control: ChannelControl) -> Result<()> {
        match control {
            ChannelControl::MouseMode(mode) => {
                if mode != self.mouse_mode {
                    info!("Pointer encoding switches to {:?} mode", mode);
                    // Pending motion was coalesced under the old encoding
                    self.pending = None;
                    self.mouse_mode = mode;
                }
                Ok(())
            }
            ChannelControl::FrameTick => self.replenish(ctx),
            ChannelControl::Drain { .. } => Ok(()),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.credit_restore_at
    }

    fn on_deadline(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        match self.credit_restore_at {
            Some(at) if Instant::now() >= at => self.replenish(ctx),
            _ => Ok(()),
        }
    }

    fn on_shutdown(&mut self, ctx: &mut ChannelContext) {
        let keys: Vec<u32> = self.pressed_keys.iter().copied().collect();
        for scancode in keys {
            debug!("Releasing stuck key {:#x}", scancode);
            let _ = self.send_key(ctx, scancode, false);
        }
        let buttons: Vec<u8> = self.pressed_buttons.iter().copied().collect();
        for wire in buttons {
            let button = match wire {
                SPICE_MOUSE_BUTTON_LEFT => PointerButton::Left,
                SPICE_MOUSE_BUTTON_MIDDLE => PointerButton::Middle,
                _ => PointerButton::Right,
            };
            let _ = self.send_button(ctx, button, false);
        }
    }
}
