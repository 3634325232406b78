use crate::channels::{ChannelContext, ChannelEventKind, ChannelHandler};
use crate::display::image::{decode_bitmap, ImageDecoder, ImageDescriptor};
use crate::display::pixel::{color_to_native, PixelFormat};
use crate::display::stream::{StreamCreate, StreamReport, VideoStream};
use crate::display::surface::Mask;
use crate::display::{Bitmap, CodecProvider, MemoryBudget, PaletteCache, PixmapCache, Rect, Surface};
use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::video::ConsumerEvent;
use crate::wire_format::{from_wire, InboundMessage, WireReader};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fields every draw command starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DrawBase {
    surface_id: u32,
    bbox: Rect,
    /// Empty means "clip to the box".
    clip: Vec<Rect>,
}

impl DrawBase {
    fn read(reader: &mut WireReader<'_>) -> Result<Self> {
        let surface_id = reader.u32()?;
        let bbox = Rect::from(reader.rect()?);
        let clip = read_clip(reader)?;
        Ok(Self { surface_id, bbox, clip })
    }

    /// Regions a draw may write to.
    fn regions(&self) -> Vec<Rect> {
        regions_within(self.bbox, &self.clip)
    }
}

fn regions_within(bbox: Rect, clip: &[Rect]) -> Vec<Rect> {
    if clip.is_empty() {
        return vec![bbox];
    }
    clip.iter()
        .map(|r| r.intersect(&bbox))
        .filter(|r| !r.is_empty())
        .collect()
}

fn read_clip(reader: &mut WireReader<'_>) -> Result<Vec<Rect>> {
    match reader.u8()? {
        SPICE_CLIP_TYPE_NONE => Ok(Vec::new()),
        SPICE_CLIP_TYPE_RECTS => {
            let count = reader.u32()? as usize;
            if count > reader.remaining() / 16 {
                return Err(SpiceError::Protocol(format!("clip claims {count} rects")));
            }
            (0..count).map(|_| reader.rect().map(Rect::from)).collect()
        }
        other => Err(SpiceError::Protocol(format!("unknown clip type {other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Brush {
    None,
    Solid(u32),
    Pattern { image: u32, pos: (i32, i32) },
}

fn read_brush(reader: &mut WireReader<'_>) -> Result<Brush> {
    match reader.u8()? {
        SPICE_BRUSH_TYPE_NONE => Ok(Brush::None),
        SPICE_BRUSH_TYPE_SOLID => Ok(Brush::Solid(reader.u32()?)),
        SPICE_BRUSH_TYPE_PATTERN => {
            let image = reader.u32()?;
            let pos = reader.point()?;
            Ok(Brush::Pattern {
                image,
                pos: (pos.x, pos.y),
            })
        }
        other => Err(SpiceError::Protocol(format!("unknown brush type {other}"))),
    }
}

#[derive(Debug, Clone, Copy)]
struct MaskRef {
    flags: u8,
    pos: (i32, i32),
    image: u32,
}

fn read_mask(reader: &mut WireReader<'_>) -> Result<MaskRef> {
    let flags = reader.u8()?;
    let pos = reader.point()?;
    let image = reader.u32()?;
    Ok(MaskRef {
        flags,
        pos: (pos.x, pos.y),
        image,
    })
}

/// Renders one display channel's surfaces and publishes presented frames.
pub struct DisplayChannel {
    channel_id: u8,
    surfaces: HashMap<u32, Surface>,
    budget: MemoryBudget,
    pixmaps: PixmapCache,
    palettes: PaletteCache,
    streams: HashMap<u32, VideoStream>,
    monitors: Vec<SpiceHead>,
    codecs: Arc<dyn CodecProvider>,
    image_decoders: HashMap<u8, Option<Box<dyn ImageDecoder>>>,
    /// Frames are held back until the first DISPLAY_MARK.
    marked: bool,
    mark_deadline: Option<Instant>,
    mark_timeout: Duration,
    min_frame_interval: Duration,
    last_present: Option<Instant>,
    /// Set while dirty surfaces wait out `min_frame_interval`.
    present_at: Option<Instant>,
}

impl DisplayChannel {
    pub fn new(channel_id: u8, cache_bytes: u64, mark_timeout: Duration, codecs: Arc<dyn CodecProvider>) -> Self {
        Self {
            channel_id,
            surfaces: HashMap::new(),
            budget: MemoryBudget::new(cache_bytes),
            pixmaps: PixmapCache::default(),
            palettes: PaletteCache::default(),
            streams: HashMap::new(),
            monitors: Vec::new(),
            codecs,
            image_decoders: HashMap::new(),
            marked: false,
            mark_deadline: None,
            mark_timeout,
            min_frame_interval: Duration::ZERO,
            last_present: None,
            present_at: None,
        }
    }

    /// Cap the frame rate; updates landing inside the interval are merged
    /// into the next frame.
    pub fn with_min_frame_interval(mut self, interval: Duration) -> Self {
        self.min_frame_interval = interval;
        self
    }

    pub fn surface(&self, surface_id: u32) -> Option<&Surface> {
        self.surfaces.get(&surface_id)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn monitors(&self) -> &[SpiceHead] {
        &self.monitors
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn pixmaps(&self) -> &PixmapCache {
        &self.pixmaps
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    fn surface_mut(&mut self, surface_id: u32) -> Result<&mut Surface> {
        self.surfaces
            .get_mut(&surface_id)
            .ok_or_else(|| SpiceError::Protocol(format!("draw on unknown surface {surface_id}")))
    }

    fn create_surface(&mut self, ctx: &mut ChannelContext, create: SpiceMsgSurfaceCreate) -> Result<()> {
        if self.surfaces.contains_key(&create.surface_id) {
            return Err(SpiceError::Protocol(format!(
                "surface {} created twice",
                create.surface_id
            )));
        }
        let format = PixelFormat::from_surface_format(create.format).ok_or_else(|| {
            SpiceError::Protocol(format!("unknown surface format {}", create.format))
        })?;
        let primary = create.flags & SPICE_SURFACE_FLAGS_PRIMARY != 0;

        let bytes = Surface::required_bytes(create.width, create.height, format);
        self.budget.charge(bytes, "surface")?;
        let surface = match Surface::new(create.surface_id, create.width, create.height, format, primary) {
            Ok(surface) => surface,
            Err(e) => {
                self.budget.release(bytes);
                return Err(e);
            }
        };

        info!(
            "Display {} surface {} created: {}x{} {:?}{}",
            self.channel_id,
            create.surface_id,
            create.width,
            create.height,
            format,
            if primary { " (primary)" } else { "" }
        );
        if primary && !self.marked {
            self.mark_deadline = Some(Instant::now() + self.mark_timeout);
        }
        self.surfaces.insert(create.surface_id, surface);
        ctx.post(ChannelEventKind::SurfaceCreated {
            surface_id: create.surface_id,
            width: create.width,
            height: create.height,
            primary,
        });
        Ok(())
    }

    fn destroy_surface(&mut self, ctx: &mut ChannelContext, surface_id: u32) {
        let Some(surface) = self.surfaces.remove(&surface_id) else {
            warn!("Ignoring destroy of unknown surface {}", surface_id);
            return;
        };
        self.budget.release(surface.byte_size());
        self.streams.retain(|_, s| s.surface_id != surface_id);
        debug!("Display {} surface {} destroyed", self.channel_id, surface_id);
        ctx.post(ChannelEventKind::SurfaceDestroyed { surface_id });
    }

    /// Cut frames for every dirty primary surface, once marked.
    fn present(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        if !self.marked {
            return Ok(());
        }
        let mut ids: Vec<u32> = self
            .surfaces
            .values()
            .filter(|s| s.primary && s.is_dirty())
            .map(|s| s.id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(due) = self.last_present.map(|last| last + self.min_frame_interval) {
            if now < due {
                self.present_at = Some(due);
                return Ok(());
            }
        }
        self.present_at = None;
        ids.sort_unstable();
        for id in ids {
            let Some(surface) = self.surfaces.get_mut(&id) else {
                continue;
            };
            if let Some(frame) = surface.take_frame()? {
                debug!(surface = id, seq = frame.seq, dirty = ?frame.dirty, "frame ready");
                ctx.post(ChannelEventKind::FramePresented {
                    surface_id: id,
                    seq: frame.seq,
                });
                ctx.emit(ConsumerEvent::Frame(frame));
                self.last_present = Some(now);
            }
        }
        Ok(())
    }

    /// Resolve the image behind a body pointer. `Ok(None)` means there is
    /// no image or no decoder for it.
    fn resolve_image(&mut self, body: &WireReader<'_>, offset: u32) -> Result<Option<Arc<Bitmap>>> {
        if offset == 0 {
            return Ok(None);
        }
        let mut reader = body.at(offset)?;
        let descriptor = ImageDescriptor::read(&mut reader)?;

        let bitmap = match descriptor.image_type {
            SPICE_IMAGE_TYPE_BITMAP => Arc::new(decode_bitmap(
                &mut reader,
                body,
                &mut self.palettes,
                &mut self.budget,
            )?),
            SPICE_IMAGE_TYPE_FROM_CACHE | SPICE_IMAGE_TYPE_FROM_CACHE_LOSSLESS => {
                return self
                    .pixmaps
                    .get(descriptor.id)
                    .map(Some)
                    .ok_or_else(|| SpiceError::Protocol(format!("pixmap {} is not cached", descriptor.id)));
            }
            SPICE_IMAGE_TYPE_SURFACE => {
                let surface_id = reader.u32()?;
                let surface = self.surfaces.get(&surface_id).ok_or_else(|| {
                    SpiceError::Protocol(format!("image refers to unknown surface {surface_id}"))
                })?;
                Arc::new(surface.canvas().clone())
            }
            image_type => {
                let codecs = self.codecs.clone();
                let slot = self.image_decoders.entry(image_type).or_insert_with(|| {
                    let decoder = codecs.image_decoder(image_type);
                    if decoder.is_none() {
                        warn!("No decoder for image type {}, draws using it are skipped", image_type);
                    }
                    decoder
                });
                match slot {
                    Some(decoder) => Arc::new(decoder.decode(&descriptor, reader.rest())?),
                    None => {
                        debug!("Skipping image {} of type {}", descriptor.id, image_type);
                        return Ok(None);
                    }
                }
            }
        };

        if descriptor.cache_me() {
            self.pixmaps.insert(descriptor.id, bitmap.clone(), &mut self.budget)?;
        }
        Ok(Some(bitmap))
    }

    fn resolve_mask(&mut self, body: &WireReader<'_>, mask: MaskRef) -> Result<Option<Mask>> {
        Ok(self.resolve_image(body, mask.image)?.map(|bitmap| Mask {
            bitmap,
            pos: mask.pos,
            invert: mask.flags & SPICE_MASK_FLAGS_INVERS != 0,
        }))
    }

    fn draw_fill(&mut self, body: &WireReader<'_>, reader: &mut WireReader<'_>) -> Result<()> {
        let base = DrawBase::read(reader)?;
        let brush = read_brush(reader)?;
        let rop = reader.u16()?;
        let mask = read_mask(reader)?;
        let mask = self.resolve_mask(body, mask)?;

        match brush {
            Brush::None => {}
            Brush::Solid(color) => {
                let surface = self.surface_mut(base.surface_id)?;
                let native = color_to_native(surface.format(), color);
                for region in base.regions() {
                    surface.fill(base.bbox, region, native, rop, mask.as_ref());
                }
            }
            Brush::Pattern { image, pos } => {
                let Some(pattern) = self.resolve_image(body, image)? else {
                    return Ok(());
                };
                let origin = (
                    base.bbox.left as i64 - pos.0 as i64,
                    base.bbox.top as i64 - pos.1 as i64,
                );
                let surface = self.surface_mut(base.surface_id)?;
                for region in base.regions() {
                    surface.fill_pattern(base.bbox, region, &pattern, origin, rop, mask.as_ref());
                }
            }
        }
        Ok(())
    }

    /// COPY, BLEND and OPAQUE share the source-image prefix.
    fn draw_copy(&mut self, body: &WireReader<'_>, reader: &mut WireReader<'_>, opaque: bool) -> Result<()> {
        let base = DrawBase::read(reader)?;
        let src = reader.u32()?;
        let src_area = Rect::from(reader.rect()?);
        if opaque {
            // The brush only matters for ROPs this client does not combine
            let _ = read_brush(reader)?;
        }
        let rop = reader.u16()?;
        let _scale_mode = reader.u8()?;
        let mask = read_mask(reader)?;

        let Some(src) = self.resolve_image(body, src)? else {
            return Ok(());
        };
        let mask = self.resolve_mask(body, mask)?;
        let surface = self.surface_mut(base.surface_id)?;
        for region in base.regions() {
            surface.blit(base.bbox, region, &src, src_area, rop, mask.as_ref());
        }
        Ok(())
    }

    fn draw_solid(&mut self, body: &WireReader<'_>, reader: &mut WireReader<'_>, rop: u16, color: u32) -> Result<()> {
        let base = DrawBase::read(reader)?;
        let mask = read_mask(reader)?;
        let mask = self.resolve_mask(body, mask)?;
        let surface = self.surface_mut(base.surface_id)?;
        let native = color_to_native(surface.format(), color);
        for region in base.regions() {
            surface.fill(base.bbox, region, native, rop, mask.as_ref());
        }
        Ok(())
    }

    fn draw_transparent(&mut self, body: &WireReader<'_>, reader: &mut WireReader<'_>) -> Result<()> {
        let base = DrawBase::read(reader)?;
        let src = reader.u32()?;
        let src_area = Rect::from(reader.rect()?);
        let src_color = reader.u32()?;
        let _true_color = reader.u32()?;

        let Some(src) = self.resolve_image(body, src)? else {
            return Ok(());
        };
        let surface = self.surface_mut(base.surface_id)?;
        for region in base.regions() {
            surface.blit_transparent(base.bbox, region, &src, src_area, src_color);
        }
        Ok(())
    }

    fn draw_alpha_blend(&mut self, body: &WireReader<'_>, reader: &mut WireReader<'_>) -> Result<()> {
        let base = DrawBase::read(reader)?;
        let flags = reader.u8()?;
        let alpha = reader.u8()?;
        let src = reader.u32()?;
        let src_area = Rect::from(reader.rect()?);

        let Some(src) = self.resolve_image(body, src)? else {
            return Ok(());
        };
        let src_has_alpha = flags & SPICE_ALPHA_FLAGS_SRC_SURFACE_HAS_ALPHA != 0 || src.format.has_alpha();
        let surface = self.surface_mut(base.surface_id)?;
        for region in base.regions() {
            surface.alpha_blend(base.bbox, region, &src, src_area, alpha, src_has_alpha);
        }
        Ok(())
    }

    fn copy_bits(&mut self, reader: &mut WireReader<'_>) -> Result<()> {
        let base = DrawBase::read(reader)?;
        let src = reader.point()?;
        let surface = self.surface_mut(base.surface_id)?;
        for region in base.regions() {
            surface.copy_bits(base.bbox, region, (src.x, src.y))?;
        }
        Ok(())
    }

    fn stream_create(&mut self, reader: &mut WireReader<'_>) -> Result<()> {
        let create = StreamCreate {
            surface_id: reader.u32()?,
            id: reader.u32()?,
            flags: reader.u8()?,
            codec: reader.u8()?,
            stamp: reader.u64()?,
            stream_width: reader.u32()?,
            stream_height: reader.u32()?,
            src_width: reader.u32()?,
            src_height: reader.u32()?,
            dest: Rect::from(reader.rect()?),
            clip: read_clip(reader)?,
        };
        if !self.surfaces.contains_key(&create.surface_id) {
            return Err(SpiceError::Protocol(format!(
                "stream {} on unknown surface {}",
                create.id, create.surface_id
            )));
        }
        info!(
            "Stream {} created: codec {}, {}x{} into {:?}",
            create.id, create.codec, create.stream_width, create.stream_height, create.dest
        );
        let decoder = self.codecs.stream_decoder(create.codec);
        let id = create.id;
        if self.streams.insert(id, VideoStream::new(create, decoder)).is_some() {
            warn!("Stream {} replaced without destroy", id);
        }
        Ok(())
    }

    fn stream_mut(&mut self, id: u32) -> Result<&mut VideoStream> {
        self.streams
            .get_mut(&id)
            .ok_or_else(|| SpiceError::Protocol(format!("unknown stream {id}")))
    }

    /// Decode and draw one stream frame, then answer the report window.
    fn stream_frame(&mut self, ctx: &mut ChannelContext, id: u32, mm_time: u32, data: &[u8]) -> Result<()> {
        let Self { streams, surfaces, .. } = self;
        let stream = streams
            .get_mut(&id)
            .ok_or_else(|| SpiceError::Protocol(format!("data for unknown stream {id}")))?;

        let dropped = match stream.decode(data) {
            Ok(Some(frame)) => {
                if let Some(surface) = surfaces.get_mut(&stream.surface_id) {
                    let src_area = frame.bounds();
                    for region in regions_within(stream.dest, &stream.clip) {
                        surface.blit(stream.dest, region, &frame, src_area, SPICE_ROPD_OP_PUT, None);
                    }
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Dropping corrupt frame of stream {}: {}", id, e);
                true
            }
        };

        if let Some(report) = stream.report.as_mut() {
            if let Some(msg) = report.record(mm_time, dropped, Instant::now()) {
                ctx.send(SPICE_MSGC_DISPLAY_STREAM_REPORT, &msg)?;
            }
        }
        Ok(())
    }

    fn invalidate_list(&mut self, reader: &mut WireReader<'_>) -> Result<()> {
        let count = reader.u16()?;
        for _ in 0..count {
            let res_type = reader.u8()?;
            let id = reader.u64()?;
            if res_type == SPICE_RES_TYPE_PIXMAP {
                self.pixmaps.remove(id, &mut self.budget);
            } else {
                debug!("Ignoring invalidation of resource type {}", res_type);
            }
        }
        Ok(())
    }
}

impl ChannelHandler for DisplayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Display
    }

    fn on_linked(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        // The server sizes its cache mirror in pixels
        let pixels = (self.budget.cap() / 4).min(i64::MAX as u64) as i64;
        ctx.send(
            SPICE_MSGC_DISPLAY_INIT,
            &SpiceMsgcDisplayInit {
                pixmap_cache_id: 1,
                pixmap_cache_size: pixels,
                glz_dictionary_id: 0,
                glz_dictionary_window_size: 0,
            },
        )
    }

    fn handle_message(&mut self, ctx: &mut ChannelContext, msg: &InboundMessage) -> Result<()> {
        let body = WireReader::new(&msg.body);
        let mut reader = body.clone();

        match msg.msg_type() {
            SPICE_MSG_DISPLAY_MODE => {
                let mode: SpiceMsgDisplayMode = from_wire(&msg.body)?;
                if !self.surfaces.contains_key(&0) {
                    let format = if mode.bits == 16 {
                        SPICE_SURFACE_FMT_16_555
                    } else {
                        SPICE_SURFACE_FMT_32_XRGB
                    };
                    self.create_surface(
                        ctx,
                        SpiceMsgSurfaceCreate {
                            surface_id: 0,
                            width: mode.x_res,
                            height: mode.y_res,
                            format,
                            flags: SPICE_SURFACE_FLAGS_PRIMARY,
                        },
                    )?;
                }
            }
            SPICE_MSG_DISPLAY_MARK => {
                if !self.marked {
                    info!("Display {} marked, presenting frames", self.channel_id);
                }
                self.marked = true;
                self.mark_deadline = None;
                self.present(ctx)?;
            }
            SPICE_MSG_DISPLAY_RESET => {
                debug!("Display {} reset", self.channel_id);
                self.palettes.clear(&mut self.budget);
                self.marked = false;
                self.present_at = None;
                if self.surfaces.values().any(|s| s.primary) {
                    self.mark_deadline = Some(Instant::now() + self.mark_timeout);
                }
            }
            SPICE_MSG_DISPLAY_SURFACE_CREATE => {
                let create: SpiceMsgSurfaceCreate = from_wire(&msg.body)?;
                self.create_surface(ctx, create)?;
            }
            SPICE_MSG_DISPLAY_SURFACE_DESTROY => {
                let destroy: SpiceMsgSurfaceDestroy = from_wire(&msg.body)?;
                self.destroy_surface(ctx, destroy.surface_id);
            }
            SPICE_MSG_DISPLAY_DRAW_FILL => self.draw_fill(&body, &mut reader)?,
            SPICE_MSG_DISPLAY_DRAW_COPY | SPICE_MSG_DISPLAY_DRAW_BLEND => {
                self.draw_copy(&body, &mut reader, false)?
            }
            SPICE_MSG_DISPLAY_DRAW_OPAQUE => self.draw_copy(&body, &mut reader, true)?,
            SPICE_MSG_DISPLAY_DRAW_BLACKNESS => {
                self.draw_solid(&body, &mut reader, SPICE_ROPD_OP_PUT, 0)?
            }
            SPICE_MSG_DISPLAY_DRAW_WHITENESS => {
                self.draw_solid(&body, &mut reader, SPICE_ROPD_OP_PUT, 0xffff_ffff)?
            }
            SPICE_MSG_DISPLAY_DRAW_INVERS => {
                self.draw_solid(&body, &mut reader, SPICE_ROPD_OP_INVERS, 0)?
            }
            SPICE_MSG_DISPLAY_DRAW_TRANSPARENT => self.draw_transparent(&body, &mut reader)?,
            SPICE_MSG_DISPLAY_DRAW_ALPHA_BLEND => self.draw_alpha_blend(&body, &mut reader)?,
            SPICE_MSG_DISPLAY_COPY_BITS => self.copy_bits(&mut reader)?,
            SPICE_MSG_DISPLAY_DRAW_ROP3
            | SPICE_MSG_DISPLAY_DRAW_STROKE
            | SPICE_MSG_DISPLAY_DRAW_TEXT
            | SPICE_MSG_DISPLAY_DRAW_COMPOSITE => {
                debug!("Draw command {} is not rendered", msg.msg_type());
            }
            SPICE_MSG_DISPLAY_INVAL_LIST => self.invalidate_list(&mut reader)?,
            SPICE_MSG_DISPLAY_INVAL_ALL_PIXMAPS => self.pixmaps.clear(&mut self.budget),
            SPICE_MSG_DISPLAY_INVAL_PALETTE => {
                let id = reader.u64()?;
                self.palettes.remove(id, &mut self.budget);
            }
            SPICE_MSG_DISPLAY_INVAL_ALL_PALETTES => self.palettes.clear(&mut self.budget),
            SPICE_MSG_DISPLAY_STREAM_CREATE => self.stream_create(&mut reader)?,
            SPICE_MSG_DISPLAY_STREAM_DATA => {
                let id = reader.u32()?;
                let mm_time = reader.u32()?;
                let size = reader.u32()? as usize;
                let data = reader.bytes(size)?;
                self.stream_frame(ctx, id, mm_time, data)?;
                self.present(ctx)?;
            }
            SPICE_MSG_DISPLAY_STREAM_DATA_SIZED => {
                let id = reader.u32()?;
                let mm_time = reader.u32()?;
                let _width = reader.u32()?;
                let _height = reader.u32()?;
                let dest = Rect::from(reader.rect()?);
                let size = reader.u32()? as usize;
                let data = reader.bytes(size)?;
                self.stream_mut(id)?.dest = dest;
                self.stream_frame(ctx, id, mm_time, data)?;
                self.present(ctx)?;
            }
            SPICE_MSG_DISPLAY_STREAM_CLIP => {
                let id = reader.u32()?;
                let clip = read_clip(&mut reader)?;
                self.stream_mut(id)?.clip = clip;
            }
            SPICE_MSG_DISPLAY_STREAM_DESTROY => {
                let id = reader.u32()?;
                if self.streams.remove(&id).is_none() {
                    debug!("Ignoring destroy of unknown stream {}", id);
                }
            }
            SPICE_MSG_DISPLAY_STREAM_DESTROY_ALL => self.streams.clear(),
            SPICE_MSG_DISPLAY_STREAM_ACTIVATE_REPORT => {
                let activate: SpiceMsgStreamActivateReport = from_wire(&msg.body)?;
                match self.streams.get_mut(&activate.stream_id) {
                    Some(stream) => stream.report = Some(StreamReport::new(&activate, Instant::now())),
                    None => warn!("Report requested for unknown stream {}", activate.stream_id),
                }
            }
            SPICE_MSG_DISPLAY_MONITORS_CONFIG => {
                let config: SpiceMsgMonitorsConfig = from_wire(&msg.body)?;
                info!("Display {} reports {} monitor(s)", self.channel_id, config.heads.len());
                self.monitors = config.heads.clone();
                ctx.post(ChannelEventKind::Monitors(config.heads));
            }
            other => debug!("Unhandled display message type {}", other),
        }
        Ok(())
    }

    fn on_quiescent(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        self.present(ctx)
    }

    fn deadline(&self) -> Option<Instant> {
        if self.marked {
            self.present_at
        } else {
            self.mark_deadline
        }
    }

    fn on_deadline(&mut self, ctx: &mut ChannelContext) -> Result<()> {
        let now = Instant::now();
        if !self.marked {
            return match self.mark_deadline {
                Some(deadline) if now >= deadline => Err(SpiceError::Protocol(format!(
                    "no DISPLAY_MARK within {:?} of the primary surface",
                    self.mark_timeout
                ))),
                _ => Ok(()),
            };
        }
        match self.present_at {
            Some(due) if now >= due => self.present(ctx),
            _ => Ok(()),
        }
    }
}
