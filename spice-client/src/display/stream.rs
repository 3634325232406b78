use super::image::StreamDecoder;
use super::surface::Bitmap;
use super::Rect;
use crate::error::Result;
use crate::protocol::*;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Parameters of `STREAM_CREATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCreate {
    pub surface_id: u32,
    pub id: u32,
    pub flags: u8,
    pub codec: u8,
    pub stamp: u64,
    pub stream_width: u32,
    pub stream_height: u32,
    pub src_width: u32,
    pub src_height: u32,
    pub dest: Rect,
    pub clip: Vec<Rect>,
}

/// A server-side video region. Frames are decoded and scaled into `dest`
/// on the owning surface.
pub struct VideoStream {
    pub id: u32,
    pub surface_id: u32,
    pub codec: u8,
    pub flags: u8,
    pub dest: Rect,
    /// Empty means unclipped.
    pub clip: Vec<Rect>,
    pub frames: u64,
    decoder: Option<Box<dyn StreamDecoder>>,
    pub report: Option<StreamReport>,
}

impl std::fmt::Debug for VideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStream")
            .field("id", &self.id)
            .field("surface_id", &self.surface_id)
            .field("codec", &self.codec)
            .field("dest", &self.dest)
            .field("frames", &self.frames)
            .field("has_decoder", &self.decoder.is_some())
            .finish()
    }
}

impl VideoStream {
    pub fn new(create: StreamCreate, decoder: Option<Box<dyn StreamDecoder>>) -> Self {
        if decoder.is_none() {
            warn!(stream = create.id, codec = create.codec, "no decoder for stream codec, frames will be skipped");
        }
        Self {
            id: create.id,
            surface_id: create.surface_id,
            codec: create.codec,
            flags: create.flags,
            dest: create.dest,
            clip: create.clip,
            frames: 0,
            decoder,
            report: None,
        }
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    /// Decode one frame. `Ok(None)` means the frame was skipped.
    pub fn decode(&mut self, data: &[u8]) -> Result<Option<Bitmap>> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };
        let mut frame = decoder.decode_frame(data)?;
        if self.flags & SPICE_STREAM_FLAGS_TOP_DOWN == 0 {
            frame.flip_vertical();
        }
        self.frames += 1;
        Ok(Some(frame))
    }
}

/// Accounting for `STREAM_REPORT` once the server asked for it.
#[derive(Debug, Clone)]
pub struct StreamReport {
    stream_id: u32,
    unique_id: u32,
    max_window: u32,
    timeout: Duration,
    window_started: Instant,
    start_mm_time: Option<u32>,
    end_mm_time: u32,
    frames: u32,
    drops: u32,
    last_delay: i32,
    /// Server multimedia time observed at a local instant.
    clock: Option<(u32, Instant)>,
}

impl StreamReport {
    pub fn new(activate: &SpiceMsgStreamActivateReport, now: Instant) -> Self {
        Self {
            stream_id: activate.stream_id,
            unique_id: activate.unique_id,
            max_window: activate.max_window_size.max(1),
            timeout: Duration::from_millis(activate.timeout_ms as u64),
            window_started: now,
            start_mm_time: None,
            end_mm_time: 0,
            frames: 0,
            drops: 0,
            last_delay: 0,
            clock: None,
        }
    }

    /// Count one frame and return a report when the window is full or has
    /// timed out.
    pub fn record(&mut self, mm_time: u32, dropped: bool, now: Instant) -> Option<SpiceMsgcStreamReport> {
        let (base_mm, base_at) = *self.clock.get_or_insert((mm_time, now));
        let local_mm = base_mm.wrapping_add(now.duration_since(base_at).as_millis() as u32);
        self.last_delay = mm_time.wrapping_sub(local_mm) as i32;

        if self.start_mm_time.is_none() {
            self.start_mm_time = Some(mm_time);
            self.window_started = now;
        }
        self.end_mm_time = mm_time;
        self.frames += 1;
        if dropped {
            self.drops += 1;
        }

        let timed_out = now.duration_since(self.window_started) >= self.timeout;
        if self.frames < self.max_window && !timed_out {
            return None;
        }

        let report = SpiceMsgcStreamReport {
            stream_id: self.stream_id,
            unique_id: self.unique_id,
            start_frame_mm_time: self.start_mm_time.unwrap_or(mm_time),
            end_frame_mm_time: self.end_mm_time,
            num_frames: self.frames,
            num_drops: self.drops,
            last_frame_delay: self.last_delay,
            audio_delay: u32::MAX,
        };
        self.start_mm_time = None;
        self.frames = 0;
        self.drops = 0;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activate(window: u32, timeout_ms: u32) -> SpiceMsgStreamActivateReport {
        SpiceMsgStreamActivateReport {
            stream_id: 3,
            unique_id: 9,
            max_window_size: window,
            timeout_ms,
        }
    }

    #[test]
    fn test_report_after_window_fills() {
        let now = Instant::now();
        let mut report = StreamReport::new(&activate(3, 60_000), now);
        assert!(report.record(100, false, now).is_none());
        assert!(report.record(133, true, now).is_none());
        let msg = report.record(166, false, now).expect("report");
        assert_eq!(msg.stream_id, 3);
        assert_eq!(msg.unique_id, 9);
        assert_eq!(msg.start_frame_mm_time, 100);
        assert_eq!(msg.end_frame_mm_time, 166);
        assert_eq!(msg.num_frames, 3);
        assert_eq!(msg.num_drops, 1);

        // The next window starts fresh
        assert!(report.record(200, false, now).is_none());
    }

    #[test]
    fn test_report_after_timeout() {
        let now = Instant::now();
        let mut report = StreamReport::new(&activate(100, 10), now);
        assert!(report.record(1, false, now).is_none());
        let later = now + Duration::from_millis(20);
        let msg = report.record(2, false, later).expect("timed out window reports");
        assert_eq!(msg.num_frames, 2);
    }

    #[test]
    fn test_stream_without_decoder_skips() {
        let mut stream = VideoStream::new(
            StreamCreate {
                surface_id: 0,
                id: 1,
                flags: 0,
                codec: SPICE_VIDEO_CODEC_TYPE_H264,
                stamp: 0,
                stream_width: 16,
                stream_height: 16,
                src_width: 16,
                src_height: 16,
                dest: Rect::new(0, 0, 16, 16),
                clip: Vec::new(),
            },
            None,
        );
        assert!(!stream.has_decoder());
        assert!(stream.decode(&[1, 2, 3]).unwrap().is_none());
        assert_eq!(stream.frames, 0);
    }
}
