//! Protocol engine: handshake, poll loop and the outbound command queue.
//!
//! # Concurrency
//!
//! The engine is a cheap [`Clone`] handle. Internally there are exactly two
//! pieces of shared mutable state that matter:
//!
//! - the outbound queue, a `parking_lot::Mutex<VecDeque<_>>` that any caller
//!   may append to and that is only ever drained while holding the transport;
//! - the transport itself, behind a `tokio::sync::Mutex` so the poll loop and
//!   [`Engine::immediate_stop`] never interleave frames.
//!
//! The poll loop holds the transport only for one write-queue-then-read-frame
//! cycle. Telemetry observers run after the lock is released, which lets an
//! observer flush an emergency stop straight away.
//!
//! # Lifecycle
//!
//! ```text
//!   connect ──► identify (bounded retries) ──► QDC ──► error table
//!           ──► ConnectionChanged(Some) ──► clear queue ──► poll loop
//!
//!   poll loop: enqueue measurement read ─► drain queue ─► read 16 bytes
//!              ─► decode (CRC mismatch: drop) ─► DataUpdated ─► observer
//!
//!   timeout / I/O error ──► teardown ──► ConnectionLost
//! ```

use super::capabilities::{DeviceCapabilities, QDC_LINE_COUNT};
use super::settings;
use super::telemetry::{ErrorFlags, TelemetrySample};
use crate::error::{LoadError, LoadResult};
use crate::events::{EventBus, LoadEvent};
use crate::protocol::{
    OutboundCommand, Payload, Quantity, ReadCommand, RunMode, TelemetryFrame, WriteCommand,
    IDENTIFICATION, TELEMETRY_FRAME_LEN,
};
use crate::transport::{Connector, LinkSettings, SerialConnector, Transport};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Receives every decoded telemetry sample from inside the poll loop.
///
/// Calls happen after `DataUpdated` was broadcast and before the next frame is
/// requested. Implementations must not call [`Engine::disconnect`]; that waits
/// for the poll loop to finish.
#[async_trait]
pub trait TelemetryObserver: Send + Sync {
    /// A new sample was decoded.
    async fn on_telemetry(&self, engine: &Engine, sample: &TelemetrySample);

    /// The link failed and the engine already tore it down.
    async fn on_link_lost(&self, _engine: &Engine, _error: &LoadError) {}
}

/// Everything cached about the current connection. Replaced wholesale on
/// connect and reset to default on disconnect.
#[derive(Debug, Default)]
struct DeviceState {
    port: Option<String>,
    capabilities: DeviceCapabilities,
    error_table: Vec<String>,
    sample: TelemetrySample,
    errors: ErrorFlags,
    remote: bool,
    series_resistance: f64,
    user_pins: u8,
}

struct PollTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<LoadResult<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    link: LinkSettings,
    events: EventBus,
    queue: Mutex<VecDeque<OutboundCommand>>,
    state: RwLock<DeviceState>,
    transport: tokio::sync::Mutex<Option<Transport>>,
    poll: Mutex<Option<PollTask>>,
    observer: RwLock<Option<Weak<dyn TelemetryObserver>>>,
    crc_failures: AtomicU64,
}

/// Handle to the MightyWatt protocol engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("port", &self.port_name())
            .field("queue_len", &self.queue_len())
            .field("crc_failures", &self.crc_failures())
            .finish()
    }
}

impl Engine {
    /// Engine opening links through `connector`.
    pub fn new(connector: Arc<dyn Connector>, link: LinkSettings, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                link,
                events,
                queue: Mutex::new(VecDeque::new()),
                state: RwLock::new(DeviceState::default()),
                transport: tokio::sync::Mutex::new(None),
                poll: Mutex::new(None),
                observer: RwLock::new(None),
                crc_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Engine talking to real serial ports.
    pub fn serial(link: LinkSettings, events: EventBus) -> Self {
        Self::new(Arc::new(SerialConnector), link, events)
    }

    /// Bus the engine publishes on.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Link timings in use.
    pub fn link(&self) -> LinkSettings {
        self.inner.link
    }

    /// Install the telemetry observer. Only a weak reference is kept.
    pub fn set_observer(&self, observer: Weak<dyn TelemetryObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn TelemetryObserver>> {
        self.inner.observer.read().as_ref().and_then(Weak::upgrade)
    }

    // ---------------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------------

    /// Open `port`, identify the device and start polling.
    ///
    /// Identification is tried up to `attempts` times, reopening the port
    /// in between. Failing to open the port at all is returned immediately.
    #[instrument(skip(self))]
    pub async fn connect(&self, port: &str, attempts: u32) -> LoadResult<()> {
        if self.is_connected() {
            self.disconnect().await?;
        }

        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            let mut transport = self.inner.connector.open(port, &self.inner.link).await?;
            match identify(&mut transport).await {
                Ok(true) => {
                    debug!(attempt, "device identified");
                    return self.handshake(port, transport).await;
                }
                Ok(false) => warn!(attempt, "unexpected identification response"),
                Err(err) => warn!(attempt, error = %err, "identification failed"),
            }
            transport.close().await;
        }

        Err(LoadError::WrongDevice {
            port: port.to_string(),
            attempts,
        })
    }

    async fn handshake(&self, port: &str, mut transport: Transport) -> LoadResult<()> {
        let capabilities = match query_capabilities(&mut transport).await {
            Ok(caps) => caps,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };
        if let Some(warning) = capabilities.firmware_warning() {
            warn!(firmware = %capabilities.firmware, "{warning}");
            self.inner.events.emit(LoadEvent::FirmwareWarning(warning));
        }
        let error_table = match query_error_messages(&mut transport).await {
            Ok(table) => table,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };

        info!(
            firmware = %capabilities.firmware,
            board = %capabilities.board_revision,
            max_current = capabilities.max_current(),
            max_voltage = capabilities.max_voltage(),
            max_power = capabilities.max_power,
            "connected"
        );

        *self.inner.state.write() = DeviceState {
            port: Some(port.to_string()),
            capabilities,
            error_table,
            ..DeviceState::default()
        };
        *self.inner.transport.lock().await = Some(transport);
        self.inner.crc_failures.store(0, Ordering::Relaxed);

        self.inner.events.emit(LoadEvent::ConnectionChanged {
            port: Some(port.to_string()),
        });
        self.inner.queue.lock().clear();
        self.start_polling();
        Ok(())
    }

    fn start_polling(&self) {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_loop(Arc::downgrade(&self.inner), shutdown_rx));
        let previous = self.inner.poll.lock().replace(PollTask { shutdown, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Stop polling, close the port and forget everything about the device.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> LoadResult<()> {
        let task = self.inner.poll.lock().take();
        let mut result = Ok(());
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            match task.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "poll loop had already stopped"),
                Err(join) if join.is_cancelled() => {}
                Err(join) => result = Err(join.into()),
            }
        }
        self.teardown().await;
        result
    }

    async fn teardown(&self) {
        let transport = self.inner.transport.lock().await.take();
        let was_connected = {
            let mut state = self.inner.state.write();
            let was = state.port.is_some();
            *state = DeviceState::default();
            was
        };
        self.inner.queue.lock().clear();
        if let Some(transport) = transport {
            transport.close().await;
        }
        if was_connected {
            info!("disconnected");
            self.inner
                .events
                .emit(LoadEvent::ConnectionChanged { port: None });
            self.inner.events.emit(LoadEvent::DataUpdated);
        }
    }

    /// One poll cycle. `Ok(None)` means the frame failed its CRC.
    async fn poll_once(&self) -> LoadResult<Option<TelemetrySample>> {
        let mut bytes = [0u8; TELEMETRY_FRAME_LEN];
        {
            let mut guard = self.inner.transport.lock().await;
            let transport = guard.as_mut().ok_or(LoadError::NotConnected)?;
            self.enqueue(OutboundCommand::read(ReadCommand::Measurement));
            flush_queue(&self.inner.queue, transport).await?;
            transport.read_exact(&mut bytes).await?;
        }

        match TelemetryFrame::decode(&bytes) {
            Ok(frame) => {
                let sample = TelemetrySample::from_frame(&frame);
                let mut state = self.inner.state.write();
                state.sample = sample;
                state.remote = sample.status.remote_sensing();
                state.errors.accumulate(frame.error_flags);
                Ok(Some(sample))
            }
            Err(mismatch) => {
                let failures = self.inner.crc_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(crc_failures = failures, "dropping telemetry frame: {mismatch}");
                Ok(None)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound commands
    // ---------------------------------------------------------------------

    fn enqueue(&self, command: OutboundCommand) {
        self.inner.queue.lock().push_back(command);
    }

    /// Queue a set-point.
    ///
    /// While connected the value is checked against the device limits for
    /// `mode` and rejected with [`LoadError::Range`]. While disconnected
    /// nothing is validated and nothing is sent.
    pub fn set(&self, mode: RunMode, value: f64) -> LoadResult<()> {
        {
            let state = self.inner.state.read();
            if state.port.is_none() {
                trace!(%mode, value, "not connected, set ignored");
                return Ok(());
            }
            if let Some(limit) = state.capabilities.limit_for(mode) {
                if !(0.0..=limit).contains(&value) {
                    return Err(LoadError::Range { mode, value, limit });
                }
            }
        }
        self.enqueue(setpoint_command(mode, value));
        Ok(())
    }

    /// Queue a raw device-setting command.
    pub fn set_value(&self, command: WriteCommand, payload: Payload) {
        self.enqueue(OutboundCommand::write(command, payload));
    }

    /// Queue an already-built command.
    pub fn send(&self, command: OutboundCommand) {
        self.enqueue(command);
    }

    /// Drop everything queued, queue zero current and write it out now.
    ///
    /// Waits for an in-progress poll cycle (bounded by the link timeouts)
    /// rather than for the next one.
    pub async fn immediate_stop(&self) -> LoadResult<()> {
        {
            let mut queue = self.inner.queue.lock();
            queue.clear();
            queue.push_back(setpoint_command(RunMode::Current, 0.0));
        }
        let mut guard = self.inner.transport.lock().await;
        match guard.as_mut() {
            Some(transport) => flush_queue(&self.inner.queue, transport).await,
            None => Ok(()),
        }
    }

    /// Queue zero current behind whatever is already queued.
    pub fn finish_and_stop(&self) {
        self.enqueue(setpoint_command(RunMode::Current, 0.0));
    }

    /// Commands waiting for the next poll cycle.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Toggle four-wire (remote) voltage sensing.
    pub fn set_remote(&self, enabled: bool) {
        self.enqueue(settings::remote_sensing_command(enabled));
        self.inner.state.write().remote = enabled;
    }

    /// Tell the device about resistance in series with its terminals.
    pub fn set_series_resistance(&self, ohms: f64) {
        self.enqueue(settings::series_resistance_command(ohms));
        self.inner.state.write().series_resistance = ohms;
    }

    /// Drive user `pin` high or low. Indices past the last pin address all of them.
    pub fn set_user_pin(&self, pin: u8, set: bool) {
        self.enqueue(settings::user_pin_command(pin, set));
        let mask = settings::pin_mask(pin);
        let mut state = self.inner.state.write();
        if set {
            state.user_pins |= mask;
        } else {
            state.user_pins &= !mask;
        }
    }

    /// Drive every user pin low.
    pub fn reset_user_pins(&self) {
        self.enqueue(settings::reset_user_pins_command());
        self.inner.state.write().user_pins = 0;
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// True while the poll loop owns an open link.
    pub fn is_connected(&self) -> bool {
        self.inner.state.read().port.is_some()
    }

    /// Port of the current connection.
    pub fn port_name(&self) -> Option<String> {
        self.inner.state.read().port.clone()
    }

    /// Limits of the connected device, `None` while disconnected.
    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        let state = self.inner.state.read();
        state.port.as_ref().map(|_| state.capabilities.clone())
    }

    /// Error messages indexed by error bit. Empty while disconnected.
    pub fn error_table(&self) -> Vec<String> {
        self.inner.state.read().error_table.clone()
    }

    /// Latest telemetry.
    pub fn sample(&self) -> TelemetrySample {
        self.inner.state.read().sample
    }

    /// Latest measured value in the units of `mode`'s set-point.
    pub fn get_value(&self, mode: RunMode) -> f64 {
        let state = self.inner.state.read();
        state
            .sample
            .value_for_mode(mode, state.capabilities.dvm_input_resistance)
    }

    /// Latest value of `quantity`.
    pub fn measured(&self, quantity: Quantity) -> f64 {
        let state = self.inner.state.read();
        state
            .sample
            .quantity(quantity, state.capabilities.dvm_input_resistance)
    }

    /// Resistance reported while no current flows (DVM input resistance).
    pub fn open_circuit_resistance(&self) -> f64 {
        self.inner.state.read().capabilities.dvm_input_resistance
    }

    /// Error bits accumulated since the last clear.
    pub fn error_flags(&self) -> ErrorFlags {
        self.inner.state.read().errors
    }

    /// Active device errors as text, `None` when there are none.
    pub fn error_list(&self) -> Option<String> {
        let state = self.inner.state.read();
        state.errors.describe(&state.error_table)
    }

    /// Forget the accumulated error bits.
    pub fn clear_errors(&self) {
        self.inner.state.write().errors.clear();
    }

    /// Four-wire sensing as last commanded.
    pub fn remote(&self) -> bool {
        self.inner.state.read().remote
    }

    /// Series resistance as last commanded, Ω.
    pub fn series_resistance(&self) -> f64 {
        self.inner.state.read().series_resistance
    }

    /// Last commanded user pin levels, bit per pin.
    pub fn user_pins(&self) -> u8 {
        self.inner.state.read().user_pins
    }

    /// Telemetry frames dropped for a bad CRC since connecting.
    pub fn crc_failures(&self) -> u64 {
        self.inner.crc_failures.load(Ordering::Relaxed)
    }
}

/// Build the wire command for a set-point. Values are scaled to µA, µV, µW
/// or mΩ and rounded; out-of-range values saturate.
pub fn setpoint_command(mode: RunMode, value: f64) -> OutboundCommand {
    let payload = if mode.has_setpoint() {
        Payload::U32((value * mode.wire_scale()).round() as u32)
    } else {
        Payload::Empty
    };
    OutboundCommand::write(mode.write_command(), payload)
}

async fn poll_loop(inner: Weak<Inner>, mut shutdown: oneshot::Receiver<()>) -> LoadResult<()> {
    loop {
        if !matches!(
            shutdown.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = Engine { inner };

        match engine.poll_once().await {
            Ok(Some(sample)) => {
                engine.inner.events.emit(LoadEvent::DataUpdated);
                if let Some(observer) = engine.observer() {
                    observer.on_telemetry(&engine, &sample).await;
                }
            }
            Ok(None) => {}
            Err(LoadError::NotConnected) => break,
            Err(err) => {
                error!(error = %err, "link lost, reconnect required");
                engine.teardown().await;
                engine
                    .inner
                    .events
                    .emit(LoadEvent::ConnectionLost(err.to_string()));
                if let Some(observer) = engine.observer() {
                    observer.on_link_lost(&engine, &err).await;
                }
                return Err(err);
            }
        }

        drop(engine);
        tokio::task::yield_now().await;
    }
    debug!("poll loop stopped");
    Ok(())
}

async fn flush_queue(
    queue: &Mutex<VecDeque<OutboundCommand>>,
    transport: &mut Transport,
) -> LoadResult<()> {
    loop {
        let next = queue.lock().pop_front();
        let Some(command) = next else {
            return Ok(());
        };
        transport.send(&command).await?;
    }
}

async fn identify(transport: &mut Transport) -> LoadResult<bool> {
    transport
        .send(&OutboundCommand::read(ReadCommand::Identification))
        .await?;
    let response = transport.read_line().await?;
    trace!(%response, "identification");
    Ok(response.contains(IDENTIFICATION))
}

async fn query_capabilities(transport: &mut Transport) -> LoadResult<DeviceCapabilities> {
    transport
        .send(&OutboundCommand::read(ReadCommand::Capabilities))
        .await?;
    let mut lines = Vec::with_capacity(QDC_LINE_COUNT);
    for _ in 0..QDC_LINE_COUNT {
        lines.push(transport.read_line().await?);
    }
    DeviceCapabilities::from_qdc_lines(&lines)
}

async fn query_error_messages(transport: &mut Transport) -> LoadResult<Vec<String>> {
    transport
        .send(&OutboundCommand::read(ReadCommand::ErrorMessages))
        .await?;
    let count = transport.read_byte().await?;
    let mut table = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        table.push(transport.read_line().await?);
    }
    Ok(table)
}
