//! Session coordinator: links the main channel, opens the channels the
//! server lists, routes channel events and owns teardown.

use crate::channels::connection::{link_channel, start_channel, ChannelHandle, ChannelSetup, StateCell};
use crate::channels::{
    ChannelControl, ChannelEvent, ChannelEventKind, ChannelKey, ChannelRole, ChannelState, CursorChannel,
    DisplayChannel, InputEvent, InputQueue, InputsChannel, KeyModifiers, MainChannel, ServerInit, Ticket,
};
use crate::config::ClientConfig;
use crate::display::CodecProvider;
use crate::error::{Result, SpiceError};
use crate::protocol::{ChannelKind, LinkError, MouseMode, SpiceHead};
use crate::transport::{Connector, Endpoint, TrustAnchor};
use crate::utils::{join_with_timeout, spawn_task, CancelFlag, TaskHandle};
use crate::video::{ConsumerEvent, ConsumerSink, CursorCallback, FrameCallback, NoticeCallback, OutputWorker, SessionNotice};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DISPATCHER_JOIN: Duration = Duration::from_secs(1);
const READER_JOIN: Duration = Duration::from_millis(250);
const OUTPUT_JOIN: Duration = Duration::from_secs(1);

/// Server facts gathered by the main channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub init: Option<ServerInit>,
    pub mouse_mode: Option<MouseMode>,
    pub supported_mouse_modes: u16,
    pub modifiers: KeyModifiers,
    pub multi_media_time: u32,
    pub name: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub monitors: Vec<SpiceHead>,
}

impl SessionInfo {
    pub fn session_id(&self) -> Option<u32> {
        self.init.map(|init| init.session_id)
    }
}

#[derive(Debug, Clone)]
enum SessionPhase {
    Connecting,
    Running,
    Ended(Option<Arc<SpiceError>>),
}

pub(crate) struct SessionParams {
    pub endpoint: Endpoint,
    pub ticket: Ticket,
    pub trust: TrustAnchor,
    pub config: ClientConfig,
    pub connector: Arc<dyn Connector>,
    pub codecs: Arc<dyn CodecProvider>,
}

struct ChannelEntry {
    state: StateCell,
    handle: Option<ChannelHandle>,
}

pub(crate) struct Session {
    config: ClientConfig,
    setup: ChannelSetup,
    codecs: Arc<dyn CodecProvider>,
    cancel: CancelFlag,
    channels: RwLock<HashMap<ChannelKey, ChannelEntry>>,
    ticket: Mutex<Option<Ticket>>,
    input: Arc<InputQueue>,
    output: OutputWorker,
    sink: ConsumerSink,
    info: Mutex<SessionInfo>,
    connected: AtomicBool,
    width: AtomicU32,
    height: AtomicU32,
    phase: watch::Sender<SessionPhase>,
    link_tasks: Mutex<Vec<TaskHandle<()>>>,
    coordinator: Mutex<Option<TaskHandle<()>>>,
    teardown: OnceCell<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    /// Link the main channel and wait until it is ready, bounded by the
    /// connect timeout. Auxiliary channels open in the background.
    pub async fn connect(params: SessionParams) -> Result<Arc<Session>> {
        let SessionParams {
            endpoint,
            ticket,
            trust,
            config,
            connector,
            codecs,
        } = params;
        ticket.validate()?;

        let (output, sink) = OutputWorker::spawn(config.frame_queue_capacity)
            .map_err(|e| SpiceError::ResourceExhausted(format!("output worker: {e}")))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let setup = ChannelSetup {
            connector,
            transport: config.transport_config(&trust),
            endpoint,
            link_timeout: config.link_timeout,
            max_message_size: config.max_message_size,
            outbound_capacity: config.outbound_queue_capacity,
            drain_timeout: config.drain_timeout,
            callback_deadline: config.callback_deadline,
            video_codecs: codecs.video_codecs(),
            events: events_tx,
            sink: sink.clone(),
        };
        let (phase, _) = watch::channel(SessionPhase::Connecting);

        let session = Arc::new(Session {
            input: Arc::new(InputQueue::new(config.input_queue_capacity)),
            config,
            setup,
            codecs,
            cancel: CancelFlag::new(),
            channels: RwLock::new(HashMap::new()),
            ticket: Mutex::new(Some(ticket)),
            output,
            sink,
            info: Mutex::new(SessionInfo::default()),
            connected: AtomicBool::new(false),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            phase,
            link_tasks: Mutex::new(Vec::new()),
            coordinator: Mutex::new(None),
            teardown: OnceCell::new(),
        });

        let coordinator = spawn_task(session.clone().coordinate(events_rx));
        *lock(&session.coordinator) = Some(coordinator);

        info!(endpoint = %session.setup.endpoint, "connecting");
        let limit = session.config.connect_timeout;
        let result = match tokio::time::timeout(limit, session.establish()).await {
            Ok(result) => result,
            Err(_) => Err(SpiceError::Timeout(limit)),
        };

        match result {
            Ok(()) => Ok(session),
            Err(e) => {
                session.teardown(Some(e.duplicate()), None).await;
                session.join_coordinator().await;
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let key = ChannelKey::MAIN;
        let Some(state) = self.register(key) else {
            return Err(SpiceError::Protocol("main channel registered twice".into()));
        };
        let ticket = lock(&self.ticket).clone().ok_or(SpiceError::NotConnected)?;
        let transport = link_channel(&self.setup, key, 0, &ticket, &state, &self.cancel).await?;
        drop(ticket);

        let role = ChannelRole::Main(MainChannel::new(self.config.preferred_mouse_mode));
        self.install(start_channel(&self.setup, key, transport, role, state, None));

        let mut phase = self.phase.subscribe();
        let phase = phase
            .wait_for(|p| !matches!(p, SessionPhase::Connecting))
            .await
            .map_err(|_| SpiceError::Cancelled)?
            .clone();
        match phase {
            SessionPhase::Connecting | SessionPhase::Running => Ok(()),
            SessionPhase::Ended(Some(e)) => Err(e.duplicate()),
            SessionPhase::Ended(None) => Err(SpiceError::Cancelled),
        }
    }

    /// Add a channel to the table. `None` when it is already there.
    fn register(&self, key: ChannelKey) -> Option<StateCell> {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        if channels.contains_key(&key) {
            return None;
        }
        let state = StateCell::new();
        channels.insert(
            key,
            ChannelEntry {
                state: state.clone(),
                handle: None,
            },
        );
        Some(state)
    }

    fn install(&self, handle: ChannelHandle) {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        if self.cancel.is_cancelled() {
            handle.stop.cancel();
        }
        match channels.get_mut(&handle.key) {
            Some(entry) => entry.handle = Some(handle),
            None => {
                let state = handle.state.clone();
                channels.insert(
                    handle.key,
                    ChannelEntry {
                        state,
                        handle: Some(handle),
                    },
                );
            }
        }
    }

    fn send_control(&self, key: ChannelKey, control: ChannelControl) {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = channels.get(&key).and_then(|e| e.handle.as_ref()) {
            handle.send_control(control);
        }
    }

    fn send_control_to_kind(&self, kind: ChannelKind, control: ChannelControl) {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        for handle in channels.values().filter_map(|e| e.handle.as_ref()) {
            if handle.key.kind == kind {
                handle.send_control(control);
            }
        }
    }

    async fn coordinate(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let cancelled = self.cancel.cancelled();
        tokio::pin!(cancelled);
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("session coordinator stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        let ChannelEvent { key, kind } = event;
        match kind {
            ChannelEventKind::Init(init) => {
                {
                    let mut info = lock(&self.info);
                    info.init = Some(init);
                    info.mouse_mode = Some(init.current_mouse_mode);
                    info.supported_mouse_modes = init.supported_mouse_modes as u16;
                    info.multi_media_time = init.multi_media_time;
                }
                self.input.set_mouse_mode(init.current_mouse_mode);
                self.connected.store(true, Ordering::SeqCst);
                self.phase.send_replace(SessionPhase::Running);
                info!(session_id = init.session_id, "session established");
            }
            ChannelEventKind::ChannelsList(keys) => self.open_channels(keys),
            ChannelEventKind::MouseMode { supported, current } => {
                let changed = {
                    let mut info = lock(&self.info);
                    info.supported_mouse_modes = supported;
                    info.mouse_mode.replace(current) != Some(current)
                };
                self.input.set_mouse_mode(current);
                self.send_control_to_kind(ChannelKind::Inputs, ChannelControl::MouseMode(current));
                if changed {
                    self.notify(SessionNotice::MouseModeChanged(current)).await;
                }
            }
            ChannelEventKind::MultiMediaTime(time) => lock(&self.info).multi_media_time = time,
            ChannelEventKind::Name(name) => lock(&self.info).name = Some(name),
            ChannelEventKind::Uuid(uuid) => lock(&self.info).uuid = Some(uuid),
            ChannelEventKind::Notify(notification) => {
                self.notify(SessionNotice::Server(notification)).await;
            }
            ChannelEventKind::Disconnecting(reason) => {
                if key == ChannelKey::MAIN {
                    self.server_disconnecting(reason).await;
                }
            }
            ChannelEventKind::SurfaceCreated {
                surface_id,
                width,
                height,
                primary,
            } => {
                debug!(channel = %key, surface_id, width, height, primary, "surface created");
                if key.kind == ChannelKind::Display && key.id == 0 && surface_id == 0 {
                    self.width.store(width, Ordering::SeqCst);
                    self.height.store(height, Ordering::SeqCst);
                }
            }
            ChannelEventKind::SurfaceDestroyed { surface_id } => {
                if key.kind == ChannelKind::Display && key.id == 0 && surface_id == 0 {
                    self.width.store(0, Ordering::SeqCst);
                    self.height.store(0, Ordering::SeqCst);
                }
            }
            ChannelEventKind::Monitors(heads) => lock(&self.info).monitors = heads,
            ChannelEventKind::FramePresented { .. } => {
                self.send_control_to_kind(ChannelKind::Inputs, ChannelControl::FrameTick);
            }
            ChannelEventKind::Modifiers(modifiers) => {
                lock(&self.info).modifiers = modifiers;
                self.notify(SessionNotice::KeyModifiers(modifiers)).await;
            }
            ChannelEventKind::Closed => {
                debug!(channel = %key, "channel closed");
                if key == ChannelKey::MAIN {
                    self.teardown(None, None).await;
                }
            }
            ChannelEventKind::Failed(error) => {
                if self.cancel.is_cancelled() {
                    debug!(channel = %key, "ignoring failure during teardown: {}", error);
                } else if key.is_critical() {
                    warn!(channel = %key, "critical channel failed: {}", error);
                    self.teardown(Some(error), None).await;
                } else {
                    warn!(channel = %key, "channel failed: {}", error);
                    self.notify(SessionNotice::ChannelFailed {
                        channel: key,
                        error: Arc::new(error),
                    })
                    .await;
                }
            }
        }
    }

    async fn notify(&self, notice: SessionNotice) {
        self.sink
            .deliver(ConsumerEvent::Notice(notice), self.config.callback_deadline)
            .await;
    }

    fn role_for(&self, key: ChannelKey) -> Option<ChannelRole> {
        match key.kind {
            ChannelKind::Main => None,
            ChannelKind::Display => Some(ChannelRole::Display(Box::new(DisplayChannel::new(
                key.id,
                self.config.display_cache_bytes,
                self.config.mark_timeout,
                self.codecs.clone(),
            )
            .with_min_frame_interval(self.config.min_frame_interval)))),
            ChannelKind::Inputs => {
                let mode = lock(&self.info).mouse_mode.unwrap_or(MouseMode::Server);
                Some(ChannelRole::Inputs(
                    InputsChannel::new(mode).with_flush_interval(self.config.pointer_flush_interval),
                ))
            }
            ChannelKind::Cursor => Some(ChannelRole::Cursor(CursorChannel::new())),
            other if self.config.open_unsupported_channels => Some(ChannelRole::Passive(other)),
            _ => None,
        }
    }

    /// Link every listed channel in parallel. The ticket is released once
    /// the last of them has authenticated or failed.
    fn open_channels(self: &Arc<Self>, keys: Vec<ChannelKey>) {
        let Some(ticket) = lock(&self.ticket).take() else {
            warn!("channel list repeated after the ticket was released, ignoring");
            return;
        };
        let ticket = Arc::new(ticket);
        let session_id = lock(&self.info).session_id().unwrap_or(0);

        let mut tasks = Vec::new();
        for key in keys {
            let Some(role) = self.role_for(key) else {
                if key.kind != ChannelKind::Main {
                    info!(channel = %key, "skipping channel");
                }
                continue;
            };
            let Some(state) = self.register(key) else {
                debug!(channel = %key, "channel already open");
                continue;
            };
            let input = (key.kind == ChannelKind::Inputs).then(|| self.input.clone());
            let session = self.clone();
            let ticket = ticket.clone();
            tasks.push(spawn_task(async move {
                session.open_channel(key, role, session_id, ticket, state, input).await;
            }));
        }
        lock(&self.link_tasks).extend(tasks);
    }

    async fn open_channel(
        &self,
        key: ChannelKey,
        role: ChannelRole,
        session_id: u32,
        ticket: Arc<Ticket>,
        state: StateCell,
        input: Option<Arc<InputQueue>>,
    ) {
        match link_channel(&self.setup, key, session_id, &ticket, &state, &self.cancel).await {
            Ok(transport) => {
                drop(ticket);
                self.install(start_channel(&self.setup, key, transport, role, state, input));
            }
            Err(error) => {
                let _ = self.setup.events.send(ChannelEvent {
                    key,
                    kind: ChannelEventKind::Failed(error),
                });
            }
        }
    }

    async fn server_disconnecting(&self, reason: LinkError) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify(SessionNotice::ServerDisconnecting(reason)).await;

        let deadline = Instant::now() + self.config.drain_timeout;
        {
            let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
            for handle in channels.values().filter_map(|e| e.handle.as_ref()) {
                handle.send_control(ChannelControl::Drain { deadline });
            }
        }
        self.teardown(Some(SpiceError::ServerDisconnected(reason)), Some(deadline))
            .await;
    }

    /// Stop everything exactly once. Concurrent callers wait for the first
    /// one to finish.
    pub async fn teardown(&self, reason: Option<SpiceError>, grace: Option<Instant>) {
        self.teardown
            .get_or_init(|| self.run_teardown(reason, grace))
            .await;
    }

    async fn run_teardown(&self, reason: Option<SpiceError>, grace: Option<Instant>) {
        self.connected.store(false, Ordering::SeqCst);
        match &reason {
            Some(e) => info!("session ending: {}", e),
            None => info!("disconnecting"),
        }

        if let Some(deadline) = grace {
            self.wait_for_channels(deadline).await;
        }

        self.cancel.cancel();
        self.input.close();

        let links = std::mem::take(&mut *lock(&self.link_tasks));
        join_all(
            links
                .into_iter()
                .map(|task| join_with_timeout("link", task, self.config.link_timeout)),
        )
        .await;

        let handles: Vec<ChannelHandle> = {
            let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
            channels.values_mut().filter_map(|e| e.handle.take()).collect()
        };
        for handle in &handles {
            handle.stop.cancel();
        }

        let mut writers = Vec::with_capacity(handles.len());
        let mut readers = Vec::with_capacity(handles.len());
        let mut dispatchers = Vec::with_capacity(handles.len());
        for handle in handles {
            let name = handle.key.to_string();
            dispatchers.push(join_with_timeout_owned(name.clone(), handle.dispatcher, DISPATCHER_JOIN));
            writers.push(join_with_timeout_owned(
                name.clone(),
                handle.writer,
                self.config.writer_drain_timeout,
            ));
            readers.push(join_with_timeout_owned(name, handle.reader, READER_JOIN));
        }
        // Dispatchers queue their last messages before writers may finish
        join_all(dispatchers).await;
        join_all(writers).await;
        join_all(readers).await;

        let failure = reason.map(Arc::new);
        if let Some(error) = &failure {
            self.sink
                .deliver(ConsumerEvent::Failed(error.clone()), self.config.callback_deadline)
                .await;
        }
        self.phase.send_replace(SessionPhase::Ended(failure));
        self.output.shutdown(&self.sink, OUTPUT_JOIN).await;
        info!("session closed");
    }

    async fn wait_for_channels(&self, deadline: Instant) {
        let states: Vec<StateCell> = {
            let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
            channels.values().map(|e| e.state.clone()).collect()
        };
        let all_done = async {
            for state in states {
                let mut rx = state.subscribe();
                let _ = rx.wait_for(|s| s.is_terminal()).await;
            }
        };
        if tokio::time::timeout_at(deadline, all_done).await.is_err() {
            debug!("drain period ended with channels still open");
        }
    }

    /// Local disconnect: tear down and reap the coordinator.
    pub async fn disconnect(&self) {
        self.teardown(None, None).await;
        self.join_coordinator().await;
    }

    async fn join_coordinator(&self) {
        let coordinator = lock(&self.coordinator).take();
        if let Some(task) = coordinator {
            join_with_timeout("coordinator", task, DISPATCHER_JOIN).await;
        }
    }

    /// Queue a host input event for the inputs channel.
    pub async fn send_input(&self, event: InputEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(SpiceError::NotConnected);
        }
        self.input.push(event).await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Primary surface size of display 0; zero before it is created.
    pub fn size(&self) -> (u32, u32) {
        (self.width.load(Ordering::SeqCst), self.height.load(Ordering::SeqCst))
    }

    pub fn info(&self) -> SessionInfo {
        lock(&self.info).clone()
    }

    /// Failure that ended the session, if any.
    pub fn failure(&self) -> Option<Arc<SpiceError>> {
        match &*self.phase.borrow() {
            SessionPhase::Ended(failure) => failure.clone(),
            _ => None,
        }
    }

    pub fn channel_states(&self) -> Vec<(ChannelKey, ChannelState)> {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        let mut states: Vec<_> = channels.iter().map(|(k, e)| (*k, e.state.get())).collect();
        states.sort_by_key(|(k, _)| *k);
        states
    }

    pub fn request_mouse_mode(&self, mode: MouseMode) {
        self.send_control(ChannelKey::MAIN, ChannelControl::MouseMode(mode));
    }

    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        self.output.set_frame_callback(callback);
    }

    pub fn set_cursor_callback(&self, callback: Option<CursorCallback>) {
        self.output.set_cursor_callback(callback);
    }

    pub fn set_notice_callback(&self, callback: Option<NoticeCallback>) {
        self.output.set_notice_callback(callback);
    }

    pub fn is_output_thread(&self) -> bool {
        self.output.is_current_thread()
    }
}

async fn join_with_timeout_owned(name: String, task: TaskHandle<()>, limit: Duration) -> bool {
    join_with_timeout(&name, task, limit).await
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.input.close();
    }
}
