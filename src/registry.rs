//! Tank registry: an arena of per-tank records owned by the caller.
//!
//! Every piece of per-tank mutable state (volume history, alarm state machine,
//! last update time) lives in a [`TankRecord`]. The engine borrows the registry
//! for each calculation pass; nothing is captured globally.

use crate::alarm::AlarmStateMachine;
use crate::calibration::CalibrationTable;
use crate::error::{Result, TankError};
use crate::flow::VolumeHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

/// Tank identifier as used by the data-source layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TankId(String);

impl TankId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TankId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TankId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&TankId> for TankId {
    fn from(id: &TankId) -> Self {
        id.clone()
    }
}

pub struct TankRecord {
    pub id: TankId,
    pub calibration: CalibrationTable,
    /// Catalog key of the stored product, if known
    pub product_id: Option<String>,
    pub history: VolumeHistory,
    /// Present while an operation is configured
    pub alarm: Option<AlarmStateMachine>,
    /// Timer generation reached by the last finished operation
    pub timer_generation: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl TankRecord {
    fn new(calibration: CalibrationTable, product_id: Option<String>) -> Self {
        Self {
            id: calibration.tank_id().clone(),
            calibration,
            product_id,
            history: VolumeHistory::new(),
            alarm: None,
            timer_generation: 0,
            last_update: None,
        }
    }

    /// Most recent volume seen for this tank
    pub fn last_volume(&self) -> Option<f64> {
        self.history.latest().map(|s| s.volume_liters)
    }
}

#[derive(Default)]
pub struct TankRegistry {
    tanks: HashMap<TankId, TankRecord>,
}

impl TankRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tank, or replace the calibration of an existing one.
    ///
    /// Returns `true` when an existing calibration was replaced; callers must
    /// then invalidate any cached lookups for the tank.
    pub fn upsert(&mut self, calibration: CalibrationTable, product_id: Option<String>) -> bool {
        let id = calibration.tank_id().clone();
        match self.tanks.get_mut(&id) {
            Some(record) => {
                info!("Replacing calibration for tank {} ({} points)", id, calibration.len());
                record.calibration = calibration;
                if product_id.is_some() {
                    record.product_id = product_id;
                }
                true
            }
            None => {
                info!("Registered tank {} ({} points)", id, calibration.len());
                self.tanks.insert(id, TankRecord::new(calibration, product_id));
                false
            }
        }
    }

    /// Remove a tank together with its history and alarm state
    pub fn remove(&mut self, id: &TankId) -> Option<TankRecord> {
        let removed = self.tanks.remove(id);
        if removed.is_some() {
            info!("Removed tank {}", id);
        }
        removed
    }

    pub fn get(&self, id: &TankId) -> Result<&TankRecord> {
        self.tanks
            .get(id)
            .ok_or_else(|| TankError::TankNotFound(id.clone()))
    }

    pub fn get_mut(&mut self, id: &TankId) -> Result<&mut TankRecord> {
        self.tanks
            .get_mut(id)
            .ok_or_else(|| TankError::TankNotFound(id.clone()))
    }

    pub fn contains(&self, id: &TankId) -> bool {
        self.tanks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tanks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tanks.is_empty()
    }

    /// Tank ids in sorted order
    pub fn ids(&self) -> Vec<TankId> {
        let mut ids: Vec<TankId> = self.tanks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn records(&self) -> impl Iterator<Item = &TankRecord> {
        self.tanks.values()
    }

    /// Clear a tank's volume history (e.g. after a sensor swap)
    pub fn clear_history(&mut self, id: &TankId) -> Result<()> {
        self.get_mut(id)?.history.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::VolumeHistorySample;

    fn table(id: &str, max_volume: f64) -> CalibrationTable {
        CalibrationTable::from_pairs(id, &[(0.0, 0.0), (1000.0, max_volume)]).unwrap()
    }

    #[test]
    fn test_upsert_and_replace() {
        let mut registry = TankRegistry::new();
        assert!(!registry.upsert(table("T1", 5000.0), Some("mgo".into())));
        assert!(registry.upsert(table("T1", 6000.0), None));

        let record = registry.get(&"T1".into()).unwrap();
        assert_eq!(record.calibration.points()[1].volume_liters, 6000.0);
        assert_eq!(record.product_id.as_deref(), Some("mgo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_drops_history() {
        let mut registry = TankRegistry::new();
        registry.upsert(table("T1", 5000.0), None);
        registry.get_mut(&"T1".into()).unwrap().history.push(VolumeHistorySample {
            timestamp: Utc::now(),
            volume_liters: 10.0,
            height_mm: 2.0,
        });

        let removed = registry.remove(&"T1".into()).unwrap();
        assert_eq!(removed.history.len(), 1);
        assert!(matches!(
            registry.get(&"T1".into()),
            Err(TankError::TankNotFound(_))
        ));

        registry.upsert(table("T1", 5000.0), None);
        assert!(registry.get(&"T1".into()).unwrap().history.is_empty());
    }

    #[test]
    fn test_ids_sorted() {
        let mut registry = TankRegistry::new();
        for id in ["T3", "T1", "T2"] {
            registry.upsert(table(id, 1000.0), None);
        }
        assert_eq!(registry.ids(), vec![TankId::from("T1"), TankId::from("T2"), TankId::from("T3")]);
    }

    #[test]
    fn test_tank_id_serializes_transparently() {
        let json = serde_json::to_string(&TankId::from("P-01")).unwrap();
        assert_eq!(json, r#""P-01""#);
    }
}
