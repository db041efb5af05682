// Scenario replay: feeds timed readings through the engine on a virtual clock
// and prints one JSON line per tank update and alarm notification.

use anyhow::{bail, Context};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ullage::{
    config::PartialConfig,
    config_store::{load_or_default, FileConfigStore},
    events::AlarmNotification,
    CalibrationTable, ChannelListener, Config, ConfigHandle, CorrectionTable, Engine, InMemoryCatalog,
    ManualScheduler, OperationType, Product, Reading, TankId, TankRegistry, TankUpdate,
};

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default = "default_start")]
    start: DateTime<Utc>,
    /// Inline overrides; ignored when a config file is given on the command line
    #[serde(default)]
    config: Option<PartialConfig>,
    #[serde(default)]
    products: Vec<Product>,
    #[serde(default)]
    correction_tables: Vec<CorrectionTable>,
    tanks: Vec<ScenarioTank>,
    #[serde(default)]
    operations: Vec<ScenarioOperation>,
    #[serde(default)]
    steps: Vec<Step>,
}

fn default_start() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Deserialize)]
struct ScenarioTank {
    id: TankId,
    #[serde(default)]
    product: Option<String>,
    /// `[height_mm, volume_liters]` pairs
    calibration: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct ScenarioOperation {
    tank: TankId,
    #[serde(rename = "type")]
    operation_type: OperationType,
    quantity: f64,
    #[serde(default)]
    initial_volume: Option<f64>,
}

/// One timeline entry, applied once the virtual clock reaches `at_ms`
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Step {
    Reading {
        at_ms: u64,
        tank: TankId,
        height_mm: f64,
        #[serde(default)]
        temperature_c: Option<f64>,
    },
    Acknowledge {
        at_ms: u64,
        tank: TankId,
        user: String,
    },
    Reset {
        at_ms: u64,
        tank: TankId,
    },
}

impl Step {
    fn at_ms(&self) -> u64 {
        match self {
            Step::Reading { at_ms, .. } | Step::Acknowledge { at_ms, .. } | Step::Reset { at_ms, .. } => *at_ms,
        }
    }
}

fn main() -> anyhow::Result<()> {
    ullage::init_logging();
    info!("Ullage v{} starting", ullage::VERSION);

    let mut args = std::env::args().skip(1);
    let Some(scenario_path) = args.next() else {
        bail!("Usage: ullage <scenario.yaml> [config.yaml]");
    };
    let config_path = args.next();

    let text = std::fs::read_to_string(&scenario_path)
        .with_context(|| format!("reading scenario {}", scenario_path))?;
    let scenario: Scenario =
        serde_yaml::from_str(&text).with_context(|| format!("parsing scenario {}", scenario_path))?;

    let config = match (&config_path, scenario.config.clone()) {
        (Some(path), _) => load_or_default(&FileConfigStore::new(path)),
        (None, Some(partial)) => {
            let config = Config::from_partial(partial)?;
            config.validate().context("inline scenario config")?;
            config
        }
        (None, None) => Config::default(),
    };

    replay(scenario, config)
}

fn replay(scenario: Scenario, config: Config) -> anyhow::Result<()> {
    let catalog: InMemoryCatalog = scenario.products.into_iter().collect();
    let scheduler = Arc::new(ManualScheduler::new());
    let mut engine = Engine::new(ConfigHandle::new(config), Arc::new(catalog), scheduler.clone());
    for table in scenario.correction_tables {
        engine.register_correction_table(table);
    }

    let (listener, mut notifications) = ChannelListener::new();
    engine.add_listener("stdout", Arc::new(listener));

    let mut registry = TankRegistry::new();
    for tank in scenario.tanks {
        let table = CalibrationTable::from_pairs(tank.id.clone(), &tank.calibration)
            .with_context(|| format!("calibration for tank {}", tank.id))?;
        engine.register_tank(&mut registry, table, tank.product);
    }

    let mut operations: BTreeMap<TankId, ScenarioOperation> =
        scenario.operations.into_iter().map(|op| (op.tank.clone(), op)).collect();

    let mut steps = scenario.steps;
    steps.sort_by_key(Step::at_ms);

    let mut updates: Vec<TankUpdate> = Vec::new();
    for step in steps {
        let at_ms = step.at_ms();
        let elapsed = Duration::from_millis(at_ms);
        if let Some(by) = elapsed.checked_sub(scheduler.now()) {
            for timer in scheduler.advance(by) {
                engine.handle_timer(&mut registry, &timer);
            }
        }
        let timestamp = scenario.start + ChronoDuration::milliseconds(at_ms as i64);

        match step {
            Step::Reading {
                tank,
                height_mm,
                temperature_c,
                ..
            } => {
                let reading = Reading {
                    tank_id: tank.clone(),
                    height_mm,
                    temperature_c,
                    timestamp,
                };
                if let Ok(update) = engine.process_reading(&mut registry, reading) {
                    println!("{}", serde_json::to_string(&update)?);
                    updates.retain(|u| u.tank_id != update.tank_id);
                    updates.push(update);
                }

                // Operations start once the tank has a measured volume
                if let Some(op) = operations.remove(&tank) {
                    if let Err(e) = engine.start_operation(
                        &mut registry,
                        &op.tank,
                        op.operation_type,
                        op.quantity,
                        op.initial_volume,
                    ) {
                        warn!("Operation on tank {} not started: {}", op.tank, e);
                    }
                }
            }
            Step::Acknowledge { tank, user, .. } => {
                engine.acknowledge(&mut registry, &tank, &user, timestamp)?;
            }
            Step::Reset { tank, .. } => engine.reset_alarm(&mut registry, &tank)?,
        }

        while let Ok(notification) = notifications.try_recv() {
            print_notification(&notification)?;
        }
    }

    let summary = engine.mass_summary(&updates);
    let flow = engine.group_flow(&updates);
    info!(
        "Final: {:.3} t across {} tanks, group flow {:.3} m3/h ({:?})",
        summary.total_mass_tons, summary.tank_count, flow.total_flow_m3_per_hour, flow.trend
    );

    let stats = engine.stats();
    info!(
        "Final stats: {} readings, {} rejected, {} timers",
        stats.readings_processed, stats.readings_failed, stats.timers_delivered
    );
    Ok(())
}

fn print_notification(notification: &AlarmNotification) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(notification)?);
    Ok(())
}
