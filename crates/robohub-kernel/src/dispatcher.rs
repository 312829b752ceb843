//! [`EventDispatcher`] – the hub's single event loop.
//!
//! Every tick the dispatcher gathers everything that is ready and applies it
//! in a fixed order:
//!
//! | Order | Source | Effect |
//! |---|---|---|
//! | 1 | cancellation token | tear down workers, return [`DispatchOutcome::Cancelled`] |
//! | 2 | command bus | sink callbacks, motor frames, fatal unknown verbs |
//! | 3 | serial link | decoded readings merged into the value store |
//! | 4 | injection handle | readings merged into the value store |
//! | 5 | supervisor | worker deaths, per [`DeathPolicy`](crate::supervisor::DeathPolicy) |
//!
//! When nothing is ready it sleeps for one tick.  Whatever ends the loop,
//! every worker is shut down before [`EventDispatcher::run`] returns.

use std::sync::Arc;
use std::time::Duration;

use robohub_hal::{FrameBuffer, SerialLink, TransportCodec};
use robohub_middleware::{CommandReceiver, Envelope, ValueStore};
use robohub_types::{Command, HubError, SensorReading, TransportCommand, Verb};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::status::DispatchSink;
use crate::supervisor::{DEFAULT_GRACE, ProcessSupervisor, WorkerExit};

/// Default loop period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// How a dispatch session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Cancelled,
}

/// Pushes externally supplied readings into a running dispatcher.
#[derive(Clone, Debug)]
pub struct InjectionHandle {
    tx: mpsc::UnboundedSender<SensorReading>,
}

impl InjectionHandle {
    /// Queue `reading` for the next tick.  Returns `false` once the
    /// dispatcher has stopped.
    pub fn inject(&self, reading: SensorReading) -> bool {
        self.tx.send(reading).is_ok()
    }
}

#[derive(Debug)]
enum Action {
    Cancel,
    Bus(Envelope),
    Serial(SensorReading),
    Injected(SensorReading),
    Deaths(Vec<WorkerExit>),
}

pub struct EventDispatcher {
    supervisor: ProcessSupervisor,
    commands: CommandReceiver,
    store: ValueStore,
    sink: Arc<dyn DispatchSink>,
    cancel: CancellationToken,
    link: Option<Box<dyn SerialLink>>,
    frames: FrameBuffer,
    codec: TransportCodec,
    transport: TransportCommand,
    injections_tx: mpsc::UnboundedSender<SensorReading>,
    injections_rx: mpsc::UnboundedReceiver<SensorReading>,
    tick: Duration,
    grace: Duration,
}

impl EventDispatcher {
    pub fn new(
        supervisor: ProcessSupervisor,
        commands: CommandReceiver,
        store: ValueStore,
        sink: Arc<dyn DispatchSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (injections_tx, injections_rx) = mpsc::unbounded_channel();
        Self {
            supervisor,
            commands,
            store,
            sink,
            cancel,
            link: None,
            frames: FrameBuffer::new(),
            codec: TransportCodec::default(),
            transport: TransportCommand::default(),
            injections_tx,
            injections_rx,
            tick: DEFAULT_TICK,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_link(mut self, link: Box<dyn SerialLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_codec(mut self, codec: TransportCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_channel_count(mut self, channels: usize) -> Self {
        self.transport = TransportCommand::new(channels);
        self
    }

    pub fn injection_handle(&self) -> InjectionHandle {
        InjectionHandle {
            tx: self.injections_tx.clone(),
        }
    }

    /// Run until cancelled or a fatal error, then shut every worker down.
    pub async fn run(mut self) -> Result<DispatchOutcome, HubError> {
        info!(tick_ms = self.tick.as_millis() as u64, "dispatcher started");
        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!(error = %e, "dispatcher stopping on fatal error");
        }

        for exit in self.supervisor.shutdown(self.grace).await {
            debug!(module = %exit.module_id, "{exit}");
        }
        info!("dispatcher stopped");
        result
    }

    async fn event_loop(&mut self) -> Result<DispatchOutcome, HubError> {
        loop {
            let actions = self.select_actions();
            if actions.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.tick) => {}
                }
                continue;
            }
            for action in actions {
                if let Some(outcome) = self.handle_action(action)? {
                    return Ok(outcome);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Everything ready right now, in precedence order.
    fn select_actions(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.cancel.is_cancelled() {
            actions.push(Action::Cancel);
        }
        actions.extend(self.commands.drain().into_iter().map(Action::Bus));
        actions.extend(self.read_serial().into_iter().map(Action::Serial));
        while let Ok(reading) = self.injections_rx.try_recv() {
            actions.push(Action::Injected(reading));
        }
        let deaths = self.supervisor.poll_deaths();
        if !deaths.is_empty() {
            actions.push(Action::Deaths(deaths));
        }
        actions
    }

    fn read_serial(&mut self) -> Vec<SensorReading> {
        let Some(link) = self.link.as_mut() else {
            return Vec::new();
        };
        match link.read_available() {
            Ok(bytes) if !bytes.is_empty() => self.frames.push(&bytes),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "serial read failed; detaching link");
                self.link = None;
            }
        }

        let mut readings = Vec::new();
        for frame in self.frames.drain_frames() {
            match self.codec.decode_detailed(&frame) {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!(error = %e, "dropping serial frame"),
            }
        }
        readings
    }

    fn handle_action(&mut self, action: Action) -> Result<Option<DispatchOutcome>, HubError> {
        match action {
            Action::Cancel => {
                info!("cancellation requested");
                return Ok(Some(DispatchOutcome::Cancelled));
            }
            Action::Bus(Envelope::UnknownVerb { origin, verb }) => {
                return Err(HubError::UnknownVerb { origin, verb });
            }
            Action::Bus(Envelope::Command(command)) => self.apply_command(command),
            Action::Serial(reading) | Action::Injected(reading) => self.store.update(&reading),
            Action::Deaths(deaths) => self.supervisor.handle_deaths(&deaths)?,
        }
        Ok(None)
    }

    fn apply_command(&mut self, command: Command) {
        let Command { origin, verb } = command;
        match verb {
            Verb::SetState(state) => self.sink.on_state_change(&origin, &state),
            Verb::SendMessage(text) => self.sink.on_message(&origin, &text),
            Verb::Event { name, payload } => self.sink.on_event(&origin, &name, &payload),
            Verb::SetMotorAngle { channel, degrees } => {
                if let Err(e) = self.transport.set(channel, degrees) {
                    warn!(module = %origin.module_id, error = %e, "dropping motor command");
                    return;
                }
                let frame = self.codec.encode(&self.transport);
                match self.link.as_mut() {
                    Some(link) => {
                        if let Err(e) = link.write_frame(&frame) {
                            warn!(error = %e, "serial write failed");
                        }
                    }
                    None => debug!(channel, degrees, "no serial link attached; motor frame not sent"),
                }
            }
        }
    }
}
