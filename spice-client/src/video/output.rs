use super::frame::{Frame, FrameDelivery};
use crate::channels::{ChannelKey, CursorEvent, KeyModifiers, Notification};
use crate::error::SpiceError;
use crate::protocol::{LinkError, MouseMode};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error, warn};

pub type FrameCallback = Arc<dyn Fn(FrameDelivery) + Send + Sync>;
pub type CursorCallback = Arc<dyn Fn(CursorEvent) + Send + Sync>;
pub type NoticeCallback = Arc<dyn Fn(SessionNotice) + Send + Sync>;

/// Session-level happenings the host may want to show.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Server(Notification),
    ChannelFailed { channel: ChannelKey, error: Arc<SpiceError> },
    MouseModeChanged(MouseMode),
    KeyModifiers(KeyModifiers),
    ServerDisconnecting(LinkError),
}

#[derive(Debug)]
pub enum ConsumerEvent {
    Frame(Frame),
    Failed(Arc<SpiceError>),
    Cursor(CursorEvent),
    Notice(SessionNotice),
    Stop,
}

impl ConsumerEvent {
    fn describe(&self) -> String {
        match self {
            ConsumerEvent::Frame(f) => format!("frame {} of surface {}", f.seq, f.surface_id),
            ConsumerEvent::Failed(_) => "failure report".into(),
            ConsumerEvent::Cursor(_) => "cursor event".into(),
            ConsumerEvent::Notice(_) => "notice".into(),
            ConsumerEvent::Stop => "stop".into(),
        }
    }
}

/// Producer side of the callback queue.
#[derive(Debug, Clone)]
pub struct ConsumerSink {
    tx: mpsc::Sender<ConsumerEvent>,
}

impl ConsumerSink {
    /// Queue an event, waiting at most `deadline` for room. Returns `false`
    /// when the event was dropped.
    pub async fn deliver(&self, event: ConsumerEvent, deadline: Duration) -> bool {
        match self.tx.send_timeout(event, deadline).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event)) => {
                warn!("consumer is {:?} behind, dropping {}", deadline, event.describe());
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    frame: Option<FrameCallback>,
    cursor: Option<CursorCallback>,
    notice: Option<NoticeCallback>,
}

/// Runs consumer callbacks one at a time on a dedicated thread.
pub struct OutputWorker {
    callbacks: Arc<RwLock<Callbacks>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl OutputWorker {
    pub fn spawn(capacity: usize) -> std::io::Result<(Self, ConsumerSink)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let callbacks = Arc::new(RwLock::new(Callbacks::default()));
        let worker_callbacks = callbacks.clone();
        let handle = std::thread::Builder::new()
            .name("spice-output".into())
            .spawn(move || run(rx, worker_callbacks))?;
        let thread_id = handle.thread().id();
        Ok((
            Self {
                callbacks,
                thread: Mutex::new(Some(handle)),
                thread_id,
            },
            ConsumerSink { tx },
        ))
    }

    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.frame = callback;
        }
    }

    pub fn set_cursor_callback(&self, callback: Option<CursorCallback>) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.cursor = callback;
        }
    }

    pub fn set_notice_callback(&self, callback: Option<NoticeCallback>) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.notice = callback;
        }
    }

    /// True when called from inside a callback.
    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Stop the worker after the queued events ran and wait for it. Must
    /// not be called from the worker thread itself.
    pub async fn shutdown(&self, sink: &ConsumerSink, limit: Duration) {
        if !sink.deliver(ConsumerEvent::Stop, limit).await {
            debug!("output worker already stopped");
        }
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        let Some(handle) = handle else {
            return;
        };
        if self.is_current_thread() {
            return;
        }
        let join = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(limit, join).await {
            Ok(Ok(Ok(()))) => {}
            Ok(_) => warn!("output worker ended abnormally"),
            Err(_) => warn!("output worker still busy after {:?}, detaching", limit),
        }
    }
}

fn run(mut rx: mpsc::Receiver<ConsumerEvent>, callbacks: Arc<RwLock<Callbacks>>) {
    while let Some(event) = rx.blocking_recv() {
        // Clone the callback out so no lock is held while it runs
        let outcome = match event {
            ConsumerEvent::Stop => break,
            ConsumerEvent::Frame(frame) => {
                let cb = callbacks.read().ok().and_then(|c| c.frame.clone());
                cb.map(|cb| catch_unwind(AssertUnwindSafe(|| cb(FrameDelivery::Frame(frame)))))
            }
            ConsumerEvent::Failed(err) => {
                let cb = callbacks.read().ok().and_then(|c| c.frame.clone());
                cb.map(|cb| catch_unwind(AssertUnwindSafe(|| cb(FrameDelivery::Failed(err)))))
            }
            ConsumerEvent::Cursor(event) => {
                let cb = callbacks.read().ok().and_then(|c| c.cursor.clone());
                cb.map(|cb| catch_unwind(AssertUnwindSafe(|| cb(event))))
            }
            ConsumerEvent::Notice(notice) => {
                let cb = callbacks.read().ok().and_then(|c| c.notice.clone());
                cb.map(|cb| catch_unwind(AssertUnwindSafe(|| cb(notice))))
            }
        };
        if let Some(Err(_)) = outcome {
            error!("consumer callback panicked");
        }
    }
    debug!("output worker exiting");
}
