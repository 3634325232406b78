//! Cursor channel: sprite, position and visibility of the guest pointer.

use crate::channels::{ChannelContext, ChannelHandler};
use crate::display::pixel::premultiply;
use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::video::ConsumerEvent;
use crate::wire_format::{from_wire, InboundMessage, WireReader};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A cursor image. `pixels` is RGBA premultiplied, `width * 4` stride; it
/// is `None` for shape types this client does not render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSprite {
    pub unique: u64,
    pub cursor_type: u8,
    pub width: u16,
    pub height: u16,
    pub hot_spot_x: u16,
    pub hot_spot_y: u16,
    pub pixels: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorEvent {
    Shape(Arc<CursorSprite>),
    Move { x: i16, y: i16 },
    Visibility(bool),
    Trail { length: u16, frequency: u16 },
    Reset,
}

pub struct CursorChannel {
    current: Option<Arc<CursorSprite>>,
    cache: HashMap<u64, Arc<CursorSprite>>,
    visible: bool,
    position: (i16, i16),
}

impl Default for CursorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorChannel {
    pub fn new() -> Self {
        Self {
            current: None,
            cache: HashMap::new(),
            visible: true,
            position: (0, 0),
        }
    }

    pub fn current(&self) -> Option<&Arc<CursorSprite>> {
        self.current.as_ref()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn position(&self) -> (i16, i16) {
        self.position
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn set_position(&mut self, ctx: &mut ChannelContext, x: i16, y: i16) {
        self.position = (x, y);
        ctx.emit(ConsumerEvent::Cursor(CursorEvent::Move { x, y }));
    }

    fn set_visible(&mut self, ctx: &mut ChannelContext, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            ctx.emit(ConsumerEvent::Cursor(CursorEvent::Visibility(visible)));
        }
    }

    /// Parse a `Cursor` structure and publish the new shape.
    fn apply_shape(&mut self, ctx: &mut ChannelContext, reader: &mut WireReader<'_>) -> Result<()> {
        let flags = reader.u16()?;
        if flags & SPICE_CURSOR_FLAGS_NONE != 0 {
            self.current = None;
            self.set_visible(ctx, false);
            return Ok(());
        }

        let header = SpiceCursorHeader {
            unique: reader.u64()?,
            type_: reader.u8()?,
            width: reader.u16()?,
            height: reader.u16()?,
            hot_spot_x: reader.u16()?,
            hot_spot_y: reader.u16()?,
        };

        let sprite = if flags & SPICE_CURSOR_FLAGS_FROM_CACHE != 0 {
            match self.cache.get(&header.unique) {
                Some(sprite) => sprite.clone(),
                None => {
                    return Err(SpiceError::Protocol(format!(
                        "cursor {} is not cached",
                        header.unique
                    )))
                }
            }
        } else {
            let sprite = Arc::new(decode_sprite(&header, reader.rest())?);
            if flags & SPICE_CURSOR_FLAGS_CACHE_ME != 0 {
                self.cache.insert(header.unique, sprite.clone());
            }
            sprite
        };

        debug!(
            "Cursor shape {}x{} type {} hotspot ({}, {})",
            sprite.width, sprite.height, sprite.cursor_type, sprite.hot_spot_x, sprite.hot_spot_y
        );
        self.current = Some(sprite.clone());
        ctx.emit(ConsumerEvent::Cursor(CursorEvent::Shape(sprite)));
        Ok(())
    }
}

impl ChannelHandler for CursorChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Cursor
    }

    fn handle_message(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()> {
        let mut reader = WireReader::new(&msg.body);
        match msg.msg_type() {
            SPICE_MSG_CURSOR_INIT => {
                let position = reader.point16()?;
                let trail_length = reader.u16()?;
                let trail_frequency = reader.u16()?;
                let visible = reader.u8()? != 0;
                info!(
                    "Cursor init - visible: {}, position: ({}, {}), trail: {}",
                    visible, position.x, position.y, trail_length
                );
                self.set_position(ctx, position.x, position.y);
                if trail_length > 0 {
                    ctx.emit(ConsumerEvent::Cursor(CursorEvent::Trail {
                        length: trail_length,
                        frequency: trail_frequency,
                    }));
                }
                self.apply_shape(ctx, &mut reader)?;
                self.set_visible(ctx, visible);
            }
            SPICE_MSG_CURSOR_RESET => {
                self.current = None;
                self.cache.clear();
                self.visible = true;
                ctx.emit(ConsumerEvent::Cursor(CursorEvent::Reset));
            }
            SPICE_MSG_CURSOR_SET => {
                let position = reader.point16()?;
                let visible = reader.u8()? != 0;
                self.set_position(ctx, position.x, position.y);
                self.apply_shape(ctx, &mut reader)?;
                self.set_visible(ctx, visible);
            }
            SPICE_MSG_CURSOR_MOVE => {
                let position = reader.point16()?;
                self.set_position(ctx, position.x, position.y);
            }
            SPICE_MSG_CURSOR_HIDE => self.set_visible(ctx, false),
            SPICE_MSG_CURSOR_TRAIL => {
                let trail: SpiceMsgCursorTrail = from_wire(&msg.body)?;
                ctx.emit(ConsumerEvent::Cursor(CursorEvent::Trail {
                    length: trail.length,
                    frequency: trail.frequency,
                }));
            }
            SPICE_MSG_CURSOR_INVAL_ONE => {
                let id = reader.u64()?;
                if self.cache.remove(&id).is_none() {
                    debug!("Ignoring invalidation of unknown cursor {}", id);
                }
            }
            SPICE_MSG_CURSOR_INVAL_ALL => self.cache.clear(),
            other => debug!("Unhandled cursor message type {}", other),
        }
        Ok(())
    }
}

fn decode_sprite(header: &SpiceCursorHeader, data: &[u8]) -> Result<CursorSprite> {
    let (w, h) = (header.width as usize, header.height as usize);
    let pixels = match header.type_ {
        SPICE_CURSOR_TYPE_ALPHA => {
            let len = w * h * 4;
            let src = data.get(..len).ok_or_else(|| {
                SpiceError::Protocol(format!("alpha cursor needs {len} bytes, got {}", data.len()))
            })?;
            let mut out = Vec::with_capacity(len);
            for px in src.chunks_exact(4) {
                // ARGB little-endian, straight alpha
                out.extend_from_slice(&premultiply([px[2], px[1], px[0], px[3]]));
            }
            Some(out)
        }
        SPICE_CURSOR_TYPE_MONO => {
            let row = w.div_ceil(8);
            let plane = row * h;
            let src = data.get(..plane * 2).ok_or_else(|| {
                SpiceError::Protocol(format!("mono cursor needs {} bytes, got {}", plane * 2, data.len()))
            })?;
            let (and_mask, xor_mask) = src.split_at(plane);
            let mut out = Vec::with_capacity(w * h * 4);
            for y in 0..h {
                for x in 0..w {
                    let bit = 0x80 >> (x % 8);
                    let and = and_mask[y * row + x / 8] & bit != 0;
                    let xor = xor_mask[y * row + x / 8] & bit != 0;
                    let px = match (and, xor) {
                        (true, false) => [0, 0, 0, 0],
                        (false, false) => [0, 0, 0, 0xff],
                        (false, true) => [0xff, 0xff, 0xff, 0xff],
                        // Screen inversion has no RGBA equivalent
                        (true, true) => [0, 0, 0, 0xff],
                    };
                    out.extend_from_slice(&px);
                }
            }
            Some(out)
        }
        other => {
            warn!("Cursor type {} is not rendered", other);
            None
        }
    };

    Ok(CursorSprite {
        unique: header.unique,
        cursor_type: header.type_,
        width: header.width,
        height: header.height,
        hot_spot_x: header.hot_spot_x,
        hot_spot_y: header.hot_spot_y,
        pixels,
    })
}
