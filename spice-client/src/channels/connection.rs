//! One channel's transport and tasks: the link exchange, then a reader, a
//! writer and a dispatcher running until the channel closes or fails.

use crate::channels::link::{authenticate, exchange_link, Ticket};
use crate::channels::{
    handle_common, AckState, ChannelContext, ChannelControl, ChannelEvent, ChannelEventKind, ChannelHandler,
    ChannelKey, ChannelRole, ChannelState, InputQueue, OutboundMessage,
};
use crate::error::{Result, SpiceError};
use crate::transport::{Connector, Endpoint, Transport, TransportConfig, TransportReader, TransportWriter};
use crate::utils::{sleep_until, spawn_task, CancelFlag, TaskHandle};
use crate::video::ConsumerSink;
use crate::wire_format::{encode_message, read_message, InboundMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Inbound messages buffered between the reader and the dispatcher.
const INBOUND_QUEUE: usize = 64;

/// Messages handled back to back before the quiescent hook runs anyway.
const MAX_BATCH: usize = 64;

/// Forward-only channel state, observable from the session.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<watch::Sender<ChannelState>>);

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ChannelState::Unconnected);
        Self(Arc::new(tx))
    }

    pub fn get(&self) -> ChannelState {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.0.subscribe()
    }

    /// Move to `next` if that is a legal transition.
    pub fn advance(&self, next: ChannelState) -> bool {
        self.0.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

/// Everything a channel needs that is shared by the whole session.
#[derive(Clone)]
pub(crate) struct ChannelSetup {
    pub connector: Arc<dyn Connector>,
    pub endpoint: Endpoint,
    pub transport: TransportConfig,
    pub link_timeout: Duration,
    pub max_message_size: u32,
    pub outbound_capacity: usize,
    pub drain_timeout: Duration,
    pub callback_deadline: Duration,
    pub video_codecs: Vec<u8>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub sink: ConsumerSink,
}

/// The session's view of a running channel.
pub(crate) struct ChannelHandle {
    pub key: ChannelKey,
    pub state: StateCell,
    pub control: mpsc::UnboundedSender<ChannelControl>,
    pub stop: CancelFlag,
    pub reader: TaskHandle<()>,
    pub writer: TaskHandle<()>,
    pub dispatcher: TaskHandle<()>,
}

impl ChannelHandle {
    pub fn send_control(&self, control: ChannelControl) {
        if self.control.send(control).is_err() {
            debug!(channel = %self.key, ?control, "channel already stopped");
        }
    }
}

/// Open the transport and run link plus authentication, bounded by the
/// link timeout.
pub(crate) async fn link_channel(
    setup: &ChannelSetup,
    key: ChannelKey,
    connection_id: u32,
    ticket: &Ticket,
    state: &StateCell,
    cancel: &CancelFlag,
) -> Result<Transport> {
    state.advance(ChannelState::Linking);
    debug!(channel = %key, endpoint = %setup.endpoint, "linking");

    let attempt = async {
        let mut transport = Transport::open(setup.connector.as_ref(), &setup.endpoint, &setup.transport).await?;
        let reply = exchange_link(&mut transport, key, connection_id, &setup.video_codecs).await?;
        state.advance(ChannelState::Authenticating);
        authenticate(&mut transport, &reply, ticket).await?;
        Ok::<_, SpiceError>(transport)
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(SpiceError::Cancelled),
        r = tokio::time::timeout(setup.link_timeout, attempt) => {
            r.unwrap_or(Err(SpiceError::Timeout(setup.link_timeout)))
        }
    };

    match result {
        Ok(transport) => {
            info!(channel = %key, "channel linked");
            Ok(transport)
        }
        Err(e) => {
            warn!(channel = %key, "link failed: {}", e);
            state.advance(ChannelState::Failed);
            Err(e)
        }
    }
}

/// Split a linked transport and spawn the channel's three tasks.
pub(crate) fn start_channel(
    setup: &ChannelSetup,
    key: ChannelKey,
    transport: Transport,
    role: ChannelRole,
    state: StateCell,
    input: Option<Arc<InputQueue>>,
) -> ChannelHandle {
    state.advance(role.state_after_link());

    let (reader, writer) = transport.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(setup.outbound_capacity.max(1));
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let stop = CancelFlag::new();

    let reader = spawn_task(run_reader(key, reader, inbound_tx, setup.max_message_size, stop.clone()));
    let writer = spawn_task(run_writer(key, writer, outbound_rx));

    let dispatcher = Dispatcher {
        key,
        role,
        ack: AckState::default(),
        state: state.clone(),
        outbound: outbound_tx,
        events: setup.events.clone(),
        sink: setup.sink.clone(),
        callback_deadline: setup.callback_deadline,
        drain_timeout: setup.drain_timeout,
        drain_deadline: None,
        stop: stop.clone(),
    };
    let dispatcher = spawn_task(dispatcher.run(inbound_rx, control_rx, input));

    ChannelHandle {
        key,
        state,
        control: control_tx,
        stop,
        reader,
        writer,
        dispatcher,
    }
}

async fn run_reader(
    key: ChannelKey,
    mut reader: TransportReader,
    tx: mpsc::Sender<Result<InboundMessage>>,
    max_size: u32,
    stop: CancelFlag,
) {
    let mut expected_serial = 1u64;
    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            r = read_message(&mut reader, max_size) => r,
        };
        let result = result.and_then(|msg| {
            if msg.header.serial != expected_serial {
                return Err(SpiceError::Protocol(format!(
                    "serial {} out of order, expected {}",
                    msg.header.serial, expected_serial
                )));
            }
            expected_serial += 1;
            Ok(msg)
        });
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
    debug!(channel = %key, "reader stopped");
}

/// Drains the outbound queue until every sender is gone, then closes the
/// write half.
async fn run_writer(key: ChannelKey, mut writer: TransportWriter, mut rx: mpsc::Receiver<OutboundMessage>) {
    let mut serial = 0u64;
    while let Some(msg) = rx.recv().await {
        serial += 1;
        let sent = match encode_message(serial, msg.msg_type, &msg.body) {
            Ok(bytes) => writer.write(&bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(channel = %key, "write failed: {}", e);
            return;
        }
    }
    if let Err(e) = writer.close().await {
        debug!(channel = %key, "close after drain: {}", e);
    }
    debug!(channel = %key, sent = serial, "writer stopped");
}

struct Dispatcher {
    key: ChannelKey,
    role: ChannelRole,
    ack: AckState,
    state: StateCell,
    outbound: mpsc::Sender<OutboundMessage>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    sink: ConsumerSink,
    callback_deadline: Duration,
    drain_timeout: Duration,
    drain_deadline: Option<Instant>,
    stop: CancelFlag,
}

impl Dispatcher {
    async fn run(
        mut self,
        inbound: mpsc::Receiver<Result<InboundMessage>>,
        control: mpsc::UnboundedReceiver<ChannelControl>,
        input: Option<Arc<InputQueue>>,
    ) {
        let result = self.drive(inbound, control, input).await;
        // Stops the reader whatever ended the loop
        self.stop.cancel();

        match result {
            Ok(()) => {
                info!(channel = %self.key, "channel closed");
                self.state.advance(ChannelState::Closed);
                self.post(ChannelEventKind::Closed);
            }
            Err(e) => {
                error!(channel = %self.key, "channel failed: {}", e);
                self.state.advance(ChannelState::Failed);
                self.post(ChannelEventKind::Failed(e));
            }
        }
    }

    fn post(&self, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent { key: self.key, kind });
    }

    async fn drive(
        &mut self,
        mut inbound: mpsc::Receiver<Result<InboundMessage>>,
        mut control: mpsc::UnboundedReceiver<ChannelControl>,
        input: Option<Arc<InputQueue>>,
    ) -> Result<()> {
        let mut ctx = ChannelContext::default();
        self.role.on_linked(&mut ctx)?;
        self.flush(ctx).await?;

        let stop = self.stop.clone();
        let cancelled = stop.cancelled();
        tokio::pin!(cancelled);
        let mut control_open = true;
        let mut input_open = input.is_some();

        loop {
            let deadline = match (self.role.deadline(), self.drain_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                biased;
                _ = &mut cancelled => {
                    let mut ctx = ChannelContext::default();
                    self.role.on_shutdown(&mut ctx);
                    self.flush(ctx).await?;
                    return Ok(());
                }
                item = inbound.recv() => {
                    let Some(item) = item else {
                        return self.end_of_stream(None);
                    };
                    self.handle_batch(item, &mut inbound).await?;
                }
                c = control.recv(), if control_open => match c {
                    Some(ChannelControl::Drain { deadline }) => self.start_drain(Some(deadline)),
                    Some(c) => {
                        let mut ctx = ChannelContext::default();
                        self.role.on_control(&mut ctx, c)?;
                        self.flush(ctx).await?;
                    }
                    None => control_open = false,
                },
                event = next_input(input.as_deref()), if input_open => match event {
                    Some(event) => {
                        let mut ctx = ChannelContext::default();
                        self.role.submit_input(&mut ctx, event)?;
                        self.flush(ctx).await?;
                    }
                    None => input_open = false,
                },
                _ = sleep_until(deadline) => {
                    if self.drain_deadline.is_some_and(|d| Instant::now() >= d) {
                        info!(channel = %self.key, "drain period over");
                        return Ok(());
                    }
                    let mut ctx = ChannelContext::default();
                    self.role.on_deadline(&mut ctx)?;
                    self.flush(ctx).await?;
                }
            }
        }
    }

    /// Handle `first` and whatever else is already queued, then run the
    /// quiescent hook.
    async fn handle_batch(
        &mut self,
        first: Result<InboundMessage>,
        inbound: &mut mpsc::Receiver<Result<InboundMessage>>,
    ) -> Result<()> {
        let mut next = Some(first);
        let mut handled = 0;
        while let Some(item) = next.take() {
            let msg = match item {
                Ok(msg) => msg,
                Err(e) => return self.end_of_stream(Some(e)),
            };
            let mut ctx = ChannelContext::default();
            if !handle_common(self.key, &mut self.ack, &mut ctx, &msg)? {
                self.role.handle_message(&mut ctx, &msg)?;
            }
            self.flush(ctx).await?;

            handled += 1;
            if handled < MAX_BATCH {
                next = inbound.try_recv().ok();
            }
        }
        let mut ctx = ChannelContext::default();
        self.role.on_quiescent(&mut ctx)?;
        self.flush(ctx).await
    }

    /// The inbound stream ended, cleanly or not. While draining either is
    /// a normal close.
    fn end_of_stream(&self, error: Option<SpiceError>) -> Result<()> {
        if self.drain_deadline.is_some() {
            if let Some(e) = error {
                debug!(channel = %self.key, "stream ended while draining: {}", e);
            }
            return Ok(());
        }
        Err(error.unwrap_or(SpiceError::TransportEof))
    }

    fn start_drain(&mut self, deadline: Option<Instant>) {
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.drain_timeout);
        self.drain_deadline = Some(match self.drain_deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        if self.state.advance(ChannelState::Draining) {
            debug!(channel = %self.key, "draining");
        }
    }

    /// Carry out the side effects a handler queued.
    async fn flush(&mut self, ctx: ChannelContext) -> Result<()> {
        if ctx.ready {
            self.state.advance(ChannelState::Ready);
        }
        if ctx.draining {
            self.start_drain(None);
        }
        for msg in ctx.outbound {
            self.outbound.send(msg).await.map_err(|_| SpiceError::TransportEof)?;
        }
        for kind in ctx.events {
            self.post(kind);
        }
        for event in ctx.consumer {
            self.sink.deliver(event, self.callback_deadline).await;
        }
        Ok(())
    }
}

async fn next_input(queue: Option<&InputQueue>) -> Option<crate::channels::InputEvent> {
    match queue {
        Some(queue) => queue.pop().await,
        None => None,
    }
}
