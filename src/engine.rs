// src/engine.rs
use crate::{
    alarm::{AlarmContext, AlarmEvent, AlarmHistory, AlarmStateMachine, AlarmStatus, TimerOutcome},
    audio::{AudioSink, NullAudioSink},
    calibration::CalibrationTable,
    catalog::ProductCatalog,
    config::Config,
    config_store::ConfigHandle,
    correction::CorrectionTable,
    error::*,
    events::{AlarmListener, AlarmListeners},
    flow::{FlowRateEstimator, FlowRateResult, GroupFlowSummary, VolumeHistorySample},
    mass::{summarize, MassCalculator, MassResult, MassSummary},
    registry::{TankId, TankRegistry},
    scheduler::{Scheduler, TimerId},
    thresholds::{compute_thresholds, OperationThresholds, OperationType},
    volume::{VolumeCalculator, VolumeResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// One gauge reading from the data-source layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub tank_id: TankId,
    pub height_mm: f64,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything one calculation pass produced for a tank
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TankUpdate {
    pub tank_id: TankId,
    pub timestamp: DateTime<Utc>,
    pub volume: VolumeResult,
    /// `None` when the tank has no known product or the mass step failed
    pub mass: Option<MassResult>,
    pub flow: FlowRateResult,
    /// `None` while no operation is configured
    pub alarm: Option<AlarmStatus>,
    /// Volume, flow and mass-failure findings; other mass findings stay on [`MassResult`]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DataQualityWarning>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub readings_processed: u64,
    pub readings_failed: u64,
    /// Readings whose volume was used but whose mass could not be computed
    pub mass_failures: u64,
    pub timers_delivered: u64,
    pub uptime_secs: u64,
}

pub struct Engine {
    config: ConfigHandle,
    volume: VolumeCalculator,
    mass: MassCalculator,
    catalog: Arc<dyn ProductCatalog>,
    scheduler: Arc<dyn Scheduler>,
    audio: Arc<dyn AudioSink>,
    listeners: AlarmListeners,
    running: Arc<AtomicBool>,
    readings_processed: AtomicU64,
    readings_failed: AtomicU64,
    mass_failures: AtomicU64,
    timers_delivered: AtomicU64,
    start_time: Instant,
}

impl Engine {
    pub fn new(config: ConfigHandle, catalog: Arc<dyn ProductCatalog>, scheduler: Arc<dyn Scheduler>) -> Self {
        let volume = VolumeCalculator::new(&config.snapshot().volume);
        Self {
            config,
            volume,
            mass: MassCalculator::new(),
            catalog,
            scheduler,
            audio: Arc::new(NullAudioSink),
            listeners: AlarmListeners::new(),
            running: Arc::new(AtomicBool::new(false)),
            readings_processed: AtomicU64::new(0),
            readings_failed: AtomicU64::new(0),
            mass_failures: AtomicU64::new(0),
            timers_delivered: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn set_audio_sink(&mut self, audio: Arc<dyn AudioSink>) {
        self.audio = audio;
    }

    /// Listeners are notified in the order they are added
    pub fn add_listener(&mut self, name: impl Into<String>, listener: Arc<dyn AlarmListener>) {
        self.listeners.register(name, listener);
    }

    pub fn register_correction_table(&mut self, table: CorrectionTable) {
        self.mass.register_table(table);
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn volume_calculator(&self) -> &VolumeCalculator {
        &self.volume
    }

    fn context<'a>(&'a self, config: &'a Config) -> AlarmContext<'a> {
        AlarmContext {
            config,
            scheduler: self.scheduler.as_ref(),
            audio: self.audio.as_ref(),
            listeners: &self.listeners,
        }
    }

    // ========================================================================
    // TANKS AND OPERATIONS
    // ========================================================================

    /// Add a tank or replace its calibration. Returns `true` on replace.
    pub fn register_tank(
        &self,
        registry: &mut TankRegistry,
        calibration: CalibrationTable,
        product_id: Option<String>,
    ) -> bool {
        for warning in calibration.quality_warnings() {
            warn!("Tank {} calibration: {}", calibration.tank_id(), warning);
        }

        let tank_id = calibration.tank_id().clone();
        let replaced = registry.upsert(calibration, product_id);
        if replaced {
            self.volume.invalidate(&tank_id);
        }
        replaced
    }

    /// Drop a tank. Any live alarm is reset first so no timer outlives it.
    pub fn remove_tank(&self, registry: &mut TankRegistry, tank_id: &TankId) -> Result<()> {
        let mut record = registry
            .remove(tank_id)
            .ok_or_else(|| TankError::TankNotFound(tank_id.clone()))?;
        if let Some(machine) = record.alarm.as_mut() {
            let config = self.config.snapshot();
            machine.reset(&self.context(&config));
        }
        self.volume.invalidate(tank_id);
        Ok(())
    }

    /// Configure a loading or unloading operation on a tank.
    ///
    /// Without an explicit `initial_volume` the tank's last computed volume is
    /// used. Events from an earlier operation on the same tank are kept.
    pub fn start_operation(
        &self,
        registry: &mut TankRegistry,
        tank_id: &TankId,
        operation_type: OperationType,
        operation_quantity: f64,
        initial_volume: Option<f64>,
    ) -> Result<OperationThresholds> {
        let config = self.config.snapshot();
        let record = registry.get_mut(tank_id)?;

        let initial = initial_volume.or_else(|| record.last_volume()).ok_or_else(|| {
            TankError::Validation(format!("no initial volume known for tank {}", tank_id))
        })?;
        let thresholds = compute_thresholds(operation_type, operation_quantity, initial, &config.alarms)?;

        let history = match record.alarm.take() {
            Some(mut previous) => {
                previous.reset(&self.context(&config));
                record.timer_generation = previous.generation();
                previous.into_history()
            }
            None => AlarmHistory::new(),
        };
        record.alarm = Some(AlarmStateMachine::resume(
            tank_id.clone(),
            thresholds,
            history,
            record.timer_generation,
        ));

        info!(
            "Tank {} {} of {:.1} L started at {:.1} L (target {:.1} L)",
            tank_id, operation_type, operation_quantity, initial, thresholds.target_volume
        );
        Ok(thresholds)
    }

    /// Finish the operation on a tank and hand back its alarm history.
    pub fn end_operation(&self, registry: &mut TankRegistry, tank_id: &TankId) -> Result<AlarmHistory> {
        let record = registry.get_mut(tank_id)?;
        let mut machine = record
            .alarm
            .take()
            .ok_or_else(|| TankError::NoActiveOperation(tank_id.clone()))?;

        let config = self.config.snapshot();
        machine.reset(&self.context(&config));
        record.timer_generation = machine.generation();
        info!("Tank {} operation ended", tank_id);
        Ok(machine.into_history())
    }

    // ========================================================================
    // CALCULATION PASS
    // ========================================================================

    /// Run volume, mass, flow and alarm evaluation for one reading.
    ///
    /// A rejected reading leaves the tank's history and alarm state untouched.
    /// A mass failure does not reject the reading: volume still drives flow
    /// and alarms, and the update carries a
    /// [`DataQualityWarning::MassUnavailable`] instead of a mass.
    pub fn process_reading(&self, registry: &mut TankRegistry, reading: Reading) -> Result<TankUpdate> {
        let tank_id = reading.tank_id.clone();
        match self.calculate(registry, reading) {
            Ok(update) => {
                self.readings_processed.fetch_add(1, Ordering::Relaxed);
                Ok(update)
            }
            Err(e) => {
                let failures = self.readings_failed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Reading for tank {} rejected (failure #{}): {}", tank_id, failures, e);
                Err(e)
            }
        }
    }

    fn calculate(&self, registry: &mut TankRegistry, reading: Reading) -> Result<TankUpdate> {
        if !reading.height_mm.is_finite() {
            return Err(TankError::Validation(format!(
                "height {} is not a finite number",
                reading.height_mm
            )));
        }
        if let Some(temperature) = reading.temperature_c {
            if !temperature.is_finite() {
                return Err(TankError::Validation(format!(
                    "temperature {} is not a finite number",
                    temperature
                )));
            }
        }

        let config = self.config.snapshot();
        let record = registry.get_mut(&reading.tank_id)?;
        let mut warnings = Vec::new();

        let volume = self.volume.cached_volume_from_height(reading.height_mm, &record.calibration);
        if volume.is_extrapolated() {
            warnings.push(DataQualityWarning::ExtrapolatedVolume {
                height_mm: reading.height_mm,
            });
        }

        let product = record.product_id.as_deref().and_then(|id| {
            let found = self.catalog.lookup(id);
            if found.is_none() {
                debug!("Product '{}' for tank {} not in catalog", id, record.id);
            }
            found
        });
        let mass = product.and_then(|product| {
            match self.mass.mass_from_volume(
                &volume,
                product.density_15c_vacuum,
                reading.temperature_c,
                Some(&product),
            ) {
                Ok(mass) => Some(mass),
                Err(e) => {
                    self.mass_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Mass for tank {} not computed: {}", record.id, e);
                    warnings.push(DataQualityWarning::MassUnavailable { reason: e.to_string() });
                    None
                }
            }
        });

        // Nothing below can fail; tank state is only mutated from here on
        let estimator = FlowRateEstimator::new(&config.flow);
        let flow = estimator.update_and_estimate(
            &mut record.history,
            VolumeHistorySample {
                timestamp: reading.timestamp,
                volume_liters: volume.volume_liters,
                height_mm: reading.height_mm,
            },
        );
        warnings.extend(estimator.quality_warning(&flow));

        let alarm = record
            .alarm
            .as_mut()
            .map(|machine| machine.update(volume.volume_liters, &self.context(&config), reading.timestamp));
        record.last_update = Some(reading.timestamp);

        trace!(
            "Tank {}: {:.1} mm -> {:.1} L, flow {:.2} L/min",
            reading.tank_id,
            reading.height_mm,
            volume.volume_liters,
            flow.flow_rate_l_per_min
        );

        Ok(TankUpdate {
            tank_id: reading.tank_id,
            timestamp: reading.timestamp,
            volume,
            mass,
            flow,
            alarm,
            warnings,
        })
    }

    /// Process readings in order. A failure for one tank never stops the rest.
    pub fn process_batch(
        &self,
        registry: &mut TankRegistry,
        readings: impl IntoIterator<Item = Reading>,
    ) -> Vec<(TankId, Result<TankUpdate>)> {
        readings
            .into_iter()
            .map(|reading| {
                let tank_id = reading.tank_id.clone();
                (tank_id, self.process_reading(registry, reading))
            })
            .collect()
    }

    // ========================================================================
    // ALARM CONTROL
    // ========================================================================

    /// Deliver a fired timer to its tank's state machine
    pub fn handle_timer(&self, registry: &mut TankRegistry, timer: &TimerId) -> TimerOutcome {
        self.timers_delivered.fetch_add(1, Ordering::Relaxed);

        let machine = match registry.get_mut(&timer.tank_id) {
            Ok(record) => record.alarm.as_mut(),
            Err(_) => None,
        };
        match machine {
            Some(machine) => {
                let config = self.config.snapshot();
                machine.on_timer(timer, &self.context(&config))
            }
            None => {
                debug!("Timer {:?} for tank {} has no operation to act on", timer.kind, timer.tank_id);
                TimerOutcome::Ignored
            }
        }
    }

    pub fn acknowledge(
        &self,
        registry: &mut TankRegistry,
        tank_id: &TankId,
        user: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlarmEvent>> {
        let machine = registry
            .get_mut(tank_id)?
            .alarm
            .as_mut()
            .ok_or_else(|| TankError::NoActiveOperation(tank_id.clone()))?;
        let config = self.config.snapshot();
        Ok(machine.acknowledge(user, &self.context(&config), at))
    }

    pub fn reset_alarm(&self, registry: &mut TankRegistry, tank_id: &TankId) -> Result<()> {
        let machine = registry
            .get_mut(tank_id)?
            .alarm
            .as_mut()
            .ok_or_else(|| TankError::NoActiveOperation(tank_id.clone()))?;
        let config = self.config.snapshot();
        machine.reset(&self.context(&config));
        info!("Tank {} alarm reset", tank_id);
        Ok(())
    }

    /// Alarm events for a tank, oldest first. Empty when no operation is configured.
    pub fn alarm_history(&self, registry: &TankRegistry, tank_id: &TankId) -> Result<Vec<AlarmEvent>> {
        Ok(registry
            .get(tank_id)?
            .alarm
            .as_ref()
            .map(|machine| machine.history().iter().cloned().collect())
            .unwrap_or_default())
    }

    // ========================================================================
    // AGGREGATES
    // ========================================================================

    pub fn mass_summary<'a>(&self, updates: impl IntoIterator<Item = &'a TankUpdate>) -> MassSummary {
        summarize(updates.into_iter().filter_map(|u| u.mass.as_ref()))
    }

    pub fn group_flow<'a>(&self, updates: impl IntoIterator<Item = &'a TankUpdate>) -> GroupFlowSummary {
        let config = self.config.snapshot();
        FlowRateEstimator::new(&config.flow).summarize_group(updates.into_iter().map(|u| &u.flow))
    }

    // ========================================================================
    // ASYNC DRIVER
    // ========================================================================

    /// Drive the engine from channels until shutdown or the reading source closes.
    ///
    /// Dropping the shutdown sender also stops the loop.
    pub async fn run(
        &self,
        registry: &mut TankRegistry,
        mut readings: mpsc::Receiver<Reading>,
        mut timers: mpsc::UnboundedReceiver<TimerId>,
        updates: mpsc::UnboundedSender<TankUpdate>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TankError::Configuration("Engine is already running".into()));
        }
        info!("Starting engine with {} tanks", registry.len());

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                Some(timer) = timers.recv() => {
                    let outcome = self.handle_timer(registry, &timer);
                    trace!("Timer {:?} for tank {}: {:?}", timer.kind, timer.tank_id, outcome);
                }

                reading = readings.recv() => match reading {
                    Some(reading) => {
                        if let Ok(update) = self.process_reading(registry, reading) {
                            if updates.send(update).is_err() {
                                error!("Update consumer dropped, stopping engine");
                                break;
                            }
                        }
                    }
                    None => {
                        info!("Reading source closed");
                        break;
                    }
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let stats = self.stats();
        info!(
            "Engine stopped after {} readings ({} rejected)",
            stats.readings_processed, stats.readings_failed
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running: self.is_running(),
            readings_processed: self.readings_processed.load(Ordering::Relaxed),
            readings_failed: self.readings_failed.load(Ordering::Relaxed),
            mass_failures: self.mass_failures.load(Ordering::Relaxed),
            timers_delivered: self.timers_delivered.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}
