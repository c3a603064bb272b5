//! The electronic load as one object.
//!
//! [`ElectronicLoad`] ties an [`Engine`] to a [`Scheduler`] and a
//! [`Supervisor`] that runs the safety checks on every telemetry sample:
//!
//! 1. device error flags: stop, report the error list, clear the flags;
//! 2. the value watchdog: stop, disarm, report;
//! 3. the series resistance power watchdog: stop, report.
//!
//! Each check stops the load on its own, regardless of the others.

use crate::config::LoadConfig;
use crate::device::settings::{
    autorange_command, fan_rule_command, led_brightness_command, led_rules_command,
    measurement_filter_command,
};
use crate::device::{
    DeviceCapabilities, DeviceSettings, Engine, FanRule, LedBrightness, LedRules,
    MeasurementFilter, TelemetryObserver, TelemetrySample,
};
use crate::error::{LoadError, LoadResult};
use crate::events::{EventBus, LoadEvent};
use crate::program::{Program, ProgramProgress, Scheduler, SchedulerState};
use crate::protocol::{RunMode, WriteCommand};
use crate::transport::{Connector, LinkSettings, SerialConnector};
use crate::watchdog::{SeriesResistanceWatchdog, ValueWatchdog};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Safety checks run from inside the poll loop.
#[derive(Debug)]
pub struct Supervisor {
    scheduler: Arc<Scheduler>,
    events: EventBus,
    watchdog: Mutex<ValueWatchdog>,
    series: Mutex<SeriesResistanceWatchdog>,
}

impl Supervisor {
    fn new(scheduler: Arc<Scheduler>, events: EventBus) -> Self {
        Self {
            scheduler,
            events,
            watchdog: Mutex::new(ValueWatchdog::default()),
            series: Mutex::new(SeriesResistanceWatchdog::default()),
        }
    }

    async fn emergency_stop(&self, engine: &Engine) {
        self.scheduler.request_stop();
        if let Err(err) = engine.immediate_stop().await {
            warn!(error = %err, "emergency stop could not be written");
        }
    }
}

#[async_trait]
impl TelemetryObserver for Supervisor {
    async fn on_telemetry(&self, engine: &Engine, sample: &TelemetrySample) {
        if let Some(text) = engine.error_list() {
            warn!(flags = engine.error_flags().bits(), "device reported errors");
            self.emergency_stop(engine).await;
            self.events.emit(LoadEvent::DeviceErrors(text));
            engine.clear_errors();
        }

        let tripped = {
            let mut watchdog = self.watchdog.lock();
            let tripped = watchdog.evaluate(sample, engine.open_circuit_resistance());
            tripped.then(|| watchdog.to_string())
        };
        if let Some(rule) = tripped {
            warn!(%rule, "watchdog tripped");
            self.emergency_stop(engine).await;
            self.events.emit(LoadEvent::WatchdogTripped);
        }

        let tripped = self.series.lock().evaluate(
            engine.series_resistance(),
            sample.current,
            Instant::now(),
        );
        if tripped {
            warn!(
                series_resistance = engine.series_resistance(),
                current = sample.current,
                "series resistance power limit exceeded"
            );
            self.emergency_stop(engine).await;
            self.events
                .emit(LoadEvent::SeriesResistanceWatchdogTripped);
        }
    }

    async fn on_link_lost(&self, _engine: &Engine, _error: &LoadError) {
        self.scheduler.request_stop();
    }
}

/// High-level handle on one MightyWatt.
#[derive(Debug)]
pub struct ElectronicLoad {
    engine: Engine,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<Supervisor>,
    settings: RwLock<DeviceSettings>,
    series_resistance: Mutex<f64>,
}

impl ElectronicLoad {
    /// Wrap `engine`; `settings` are written to the device on every connect.
    pub fn new(engine: Engine, settings: DeviceSettings) -> Self {
        let scheduler = Arc::new(Scheduler::new(engine.clone()));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&scheduler),
            engine.events().clone(),
        ));
        let observer: Arc<dyn TelemetryObserver> = supervisor.clone();
        engine.set_observer(Arc::downgrade(&observer));

        Self {
            engine,
            scheduler,
            supervisor,
            settings: RwLock::new(settings),
            series_resistance: Mutex::new(0.0),
        }
    }

    /// Load with default settings whose links come from `connector`.
    pub fn with_connector(connector: Arc<dyn Connector>, link: LinkSettings) -> Self {
        Self::new(
            Engine::new(connector, link, EventBus::default()),
            DeviceSettings::default(),
        )
    }

    /// Build from configuration: link timings, device defaults and watchdogs.
    pub fn from_config(config: &LoadConfig) -> Self {
        let engine = Engine::new(
            Arc::new(SerialConnector),
            config.link_settings(),
            EventBus::default(),
        );
        let load = Self::new(engine, config.device);
        load.set_watchdog(config.watchdog);
        load.set_series_power_limit(config.series_resistance.power_limit);
        load.set_series_watchdog_enabled(config.series_resistance.enabled);
        *load.series_resistance.lock() = config.series_resistance.resistance;
        load
    }

    /// Underlying protocol engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Program scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Event bus shared by engine, scheduler and watchdogs.
    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    /// Receive every [`LoadEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LoadEvent> {
        self.engine.events().subscribe()
    }

    // ---------------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------------

    /// Connect, write the configured defaults and zero the current.
    #[instrument(skip(self))]
    pub async fn connect(&self, port: &str, attempts: u32) -> LoadResult<()> {
        self.engine.connect(port, attempts).await?;

        let settings = *self.settings.read();
        for command in settings.commands() {
            self.engine.send(command);
        }
        self.engine.set(RunMode::Current, 0.0)?;

        let series_resistance = *self.series_resistance.lock();
        if series_resistance > 0.0 {
            self.engine.set_series_resistance(series_resistance);
        }
        Ok(())
    }

    /// Stop any program, zero the current and close the link.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> LoadResult<()> {
        self.scheduler.stop().await;
        if self.engine.is_connected() {
            if let Err(err) = self.engine.immediate_stop().await {
                warn!(error = %err, "could not zero the load before disconnecting");
            }
            tokio::time::sleep(self.engine.link().load_delay()).await;
        }
        self.engine.disconnect().await
    }

    /// True while the link is up.
    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Limits of the connected device.
    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.engine.capabilities()
    }

    // ---------------------------------------------------------------------
    // Manual control
    // ---------------------------------------------------------------------

    /// Queue a set-point, see [`Engine::set`].
    pub fn set(&self, mode: RunMode, value: f64) -> LoadResult<()> {
        self.engine.set(mode, value)
    }

    /// Latest measurement in the units of `mode`.
    pub fn get_value(&self, mode: RunMode) -> f64 {
        self.engine.get_value(mode)
    }

    /// Latest telemetry.
    pub fn sample(&self) -> TelemetrySample {
        self.engine.sample()
    }

    /// Stop any program and zero the current right away.
    pub async fn stop(&self) -> LoadResult<()> {
        self.scheduler.stop().await;
        self.engine.immediate_stop().await
    }

    /// Zero the current after the commands already queued.
    pub fn finish_and_stop(&self) {
        self.engine.finish_and_stop();
    }

    // ---------------------------------------------------------------------
    // Programs
    // ---------------------------------------------------------------------

    /// Run `program`, replacing any program in progress.
    pub async fn start(&self, program: Program) -> LoadResult<()> {
        self.scheduler.start(program).await
    }

    /// End the current program item early.
    pub fn skip(&self) {
        self.scheduler.skip();
    }

    /// Wait for the running program to complete.
    pub async fn wait(&self) {
        self.scheduler.wait().await;
    }

    /// Scheduler state.
    pub fn program_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Position and remaining time of the running program.
    pub fn progress(&self) -> ProgramProgress {
        self.scheduler.progress()
    }

    // ---------------------------------------------------------------------
    // Watchdogs
    // ---------------------------------------------------------------------

    /// Value watchdog as currently armed.
    pub fn watchdog(&self) -> ValueWatchdog {
        *self.supervisor.watchdog.lock()
    }

    /// Replace the value watchdog.
    pub fn set_watchdog(&self, watchdog: ValueWatchdog) {
        if watchdog.enabled {
            info!(rule = %watchdog, "watchdog armed");
        }
        *self.supervisor.watchdog.lock() = watchdog;
    }

    /// Series resistance watchdog state.
    pub fn series_watchdog(&self) -> SeriesResistanceWatchdog {
        *self.supervisor.series.lock()
    }

    /// Arm or disarm the series resistance watchdog.
    pub fn set_series_watchdog_enabled(&self, enabled: bool) {
        self.supervisor.series.lock().set_enabled(enabled);
    }

    /// Returns `false` and keeps the old limit for values ≤ 0.1 W.
    pub fn set_series_power_limit(&self, watts: f64) -> bool {
        let accepted = self.supervisor.series.lock().set_power_limit(watts);
        if !accepted {
            warn!(watts, "series resistance power limit ignored");
        }
        accepted
    }

    // ---------------------------------------------------------------------
    // Device settings
    // ---------------------------------------------------------------------

    /// Settings written on connect.
    pub fn settings(&self) -> DeviceSettings {
        *self.settings.read()
    }

    fn apply_setting(
        &self,
        update: impl FnOnce(&mut DeviceSettings),
        command: crate::protocol::OutboundCommand,
    ) -> LoadResult<()> {
        if !self.engine.is_connected() {
            return Err(LoadError::NotConnected);
        }
        update(&mut *self.settings.write());
        self.engine.send(command);
        Ok(())
    }

    /// Change the LED brightness. Needs a connection.
    pub fn set_led_brightness(&self, brightness: LedBrightness) -> LoadResult<()> {
        self.apply_setting(
            |s| s.led_brightness = brightness,
            led_brightness_command(brightness),
        )
    }

    /// Change the LED rules. Needs a connection.
    pub fn set_led_rules(&self, rules: LedRules) -> LoadResult<()> {
        self.apply_setting(|s| s.led_rules = rules, led_rules_command(rules))
    }

    /// Change the fan rule. Needs a connection.
    pub fn set_fan_rule(&self, rule: FanRule) -> LoadResult<()> {
        self.apply_setting(|s| s.fan_rule = rule, fan_rule_command(rule))
    }

    /// Change the measurement filter. Needs a connection.
    pub fn set_measurement_filter(&self, filter: MeasurementFilter) -> LoadResult<()> {
        self.apply_setting(
            |s| s.measurement_filter = filter,
            measurement_filter_command(filter),
        )
    }

    /// Switch current autoranging. Needs a connection.
    pub fn set_autorange_current(&self, enabled: bool) -> LoadResult<()> {
        self.apply_setting(
            |s| s.autorange_current = enabled,
            autorange_command(WriteCommand::CurrentRangeAuto, enabled),
        )
    }

    /// Switch voltage autoranging. Needs a connection.
    pub fn set_autorange_voltage(&self, enabled: bool) -> LoadResult<()> {
        self.apply_setting(
            |s| s.autorange_voltage = enabled,
            autorange_command(WriteCommand::VoltageRangeAuto, enabled),
        )
    }

    /// Four-wire voltage sensing.
    pub fn set_remote(&self, enabled: bool) {
        self.engine.set_remote(enabled);
    }

    /// Four-wire sensing as last commanded.
    pub fn remote(&self) -> bool {
        self.engine.remote()
    }

    /// Resistance in series with the load, Ω. Kept across reconnects.
    pub fn set_series_resistance(&self, ohms: f64) {
        *self.series_resistance.lock() = ohms;
        self.engine.set_series_resistance(ohms);
    }

    /// Configured series resistance, Ω.
    pub fn series_resistance(&self) -> f64 {
        *self.series_resistance.lock()
    }

    /// Drive user `pin` high or low.
    pub fn set_user_pin(&self, pin: u8, set: bool) {
        self.engine.set_user_pin(pin, set);
    }

    /// Drive every user pin low.
    pub fn reset_user_pins(&self) {
        self.engine.reset_user_pins();
    }
}

impl Default for ElectronicLoad {
    fn default() -> Self {
        Self::with_connector(Arc::new(SerialConnector), LinkSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Comparison, Quantity};
    use std::time::Duration;

    #[tokio::test]
    async fn settings_need_a_connection() {
        let load = ElectronicLoad::default();
        assert!(matches!(
            load.set_led_brightness(LedBrightness::High),
            Err(LoadError::NotConnected)
        ));
        assert_eq!(load.settings().led_brightness, LedBrightness::Medium);
        assert_eq!(load.engine().queue_len(), 0);
    }

    #[tokio::test]
    async fn series_resistance_is_remembered() {
        let load = ElectronicLoad::default();
        load.set_series_resistance(0.25);
        assert_eq!(load.series_resistance(), 0.25);
        assert_eq!(load.engine().series_resistance(), 0.25);
        assert_eq!(load.engine().queue_len(), 1);
    }

    #[test]
    fn watchdog_configuration() {
        let load = ElectronicLoad::default();
        load.set_watchdog(ValueWatchdog {
            enabled: true,
            quantity: Quantity::Voltage,
            comparison: Comparison::LessThan,
            threshold: 2.5,
        });
        assert!(load.watchdog().enabled);

        assert!(!load.set_series_power_limit(0.05));
        assert_eq!(load.series_watchdog().power_limit(), 100.0);
        assert!(load.set_series_power_limit(20.0));
        load.set_series_watchdog_enabled(true);
        assert!(load.series_watchdog().enabled());
    }

    #[test]
    fn from_config_applies_watchdogs() {
        let mut config = LoadConfig::default();
        config.series_resistance.resistance = 1.5;
        config.series_resistance.power_limit = 12.0;
        config.series_resistance.enabled = true;
        config.device.fan_rule = FanRule::AutoCool;

        let load = ElectronicLoad::from_config(&config);
        assert_eq!(load.series_resistance(), 1.5);
        assert_eq!(load.series_watchdog().power_limit(), 12.0);
        assert!(load.series_watchdog().enabled());
        assert_eq!(load.settings().fan_rule, FanRule::AutoCool);
    }

    #[tokio::test(start_paused = true)]
    async fn series_overload_grace_period_follows_runtime_clock() {
        let load = ElectronicLoad::default();
        load.set_series_resistance(1.0);
        assert!(load.set_series_power_limit(1.0));
        load.set_series_watchdog_enabled(true);
        let mut rx = load.subscribe();

        // 1 Ω at 2 A is 4 W.
        let overloaded = TelemetrySample {
            current: 2.0,
            voltage: 5.0,
            ..TelemetrySample::default()
        };
        load.supervisor.on_telemetry(load.engine(), &overloaded).await;
        tokio::time::advance(Duration::from_millis(900)).await;
        load.supervisor.on_telemetry(load.engine(), &overloaded).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(200)).await;
        load.supervisor.on_telemetry(load.engine(), &overloaded).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            LoadEvent::SeriesResistanceWatchdogTripped
        );
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_quiet() {
        let load = ElectronicLoad::default();
        let mut rx = load.subscribe();
        load.disconnect().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
