use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::phase_models::PhasePower;
use crate::models::system_models::EmsMode;

// --------------------------------------------------------------------------------------------------------------
// Persisted EMS settings. The store is a single JSON document on disk: loaded once at startup
// (with out-of-range values clamped), rewritten whenever the energy counters are persisted.

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

// --------------------------------------------------------------------------------------------------------------

/// Forward energy counters per consumer class and phase, in kWh. These survive
/// restarts; everything else the control loop derives is transient.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EnergyCounters {
    pub primary_l1_forward_kwh:   f64,
    pub primary_l2_forward_kwh:   f64,
    pub primary_l3_forward_kwh:   f64,
    pub secondary_l1_forward_kwh: f64,
    pub secondary_l2_forward_kwh: f64,
    pub secondary_l3_forward_kwh: f64,
}

impl EnergyCounters {
    pub fn primary(&self) -> PhasePower {
        PhasePower::new(
            self.primary_l1_forward_kwh,
            self.primary_l2_forward_kwh,
            self.primary_l3_forward_kwh,
            0.0,
        )
    }

    pub fn secondary(&self) -> PhasePower {
        PhasePower::new(
            self.secondary_l1_forward_kwh,
            self.secondary_l2_forward_kwh,
            self.secondary_l3_forward_kwh,
            0.0,
        )
    }

    pub fn set_primary(&mut self, counters: PhasePower) {
        self.primary_l1_forward_kwh = counters.l1;
        self.primary_l2_forward_kwh = counters.l2;
        self.primary_l3_forward_kwh = counters.l3;
    }

    pub fn set_secondary(&mut self, counters: PhasePower) {
        self.secondary_l1_forward_kwh = counters.l1;
        self.secondary_l2_forward_kwh = counters.l2;
        self.secondary_l3_forward_kwh = counters.l3;
    }
}

// --------------------------------------------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EmsSettings {
    // --- connectivity ---

    /// Base URL of the local RPC bridge that fronts the message bus,
    /// e.g. "http://127.0.0.1:8088".
    pub bridge_url: String,

    // --- control behaviour ---

    /// EMS mode: 0 = off, 1 = on. Only the control timers depend on this;
    /// sessions keep their connections either way.
    pub mode: u8,
    /// Seconds between control-loop ticks (1-60).
    pub control_loop_interval_s: u64,
    /// SoC percentage (2-98) above which the balancing offset starts steering
    /// consumers into absorbing would-be-curtailed PV.
    pub balancing_threshold: f64,
    /// Arithmetic expression over SOC giving the battery reservation in watts.
    /// Grammar: numbers, SOC, + - * /, parentheses, min/max.
    pub battery_reservation_equation: String,
    /// Continuous inverter power per phase (W), the conversion-stage ceiling.
    pub continuous_inverter_power_w: f64,

    // --- logging ---

    /// Log level: "Trace", "Debug", "Info", "Warn", "Error"
    pub log_level: String,
    /// Raise the level filter to Debug for the per-tick allocation trace.
    pub write_debug_logs: bool,

    // --- persisted counters ---

    pub energy_counters: EnergyCounters,
}

impl Default for EmsSettings {
    fn default() -> Self {
        Self {
            // connectivity
            bridge_url: "http://127.0.0.1:8088".to_string(),
            // control behaviour
            mode:                         0,
            control_loop_interval_s:      5,
            balancing_threshold:          98.0,
            battery_reservation_equation: "10000".to_string(),
            continuous_inverter_power_w:  4000.0,
            // logging
            log_level:        "Info".to_string(),
            write_debug_logs: false,
            // counters
            energy_counters: EnergyCounters::default(),
        }
    }
}

impl EmsSettings {
    pub fn ems_mode(&self) -> EmsMode {
        if self.mode == 1 { EmsMode::On } else { EmsMode::Off }
    }

    /// Clamp every value to its allowed range, warning about corrections.
    fn sanitize(&mut self) {
        if !(1..=60).contains(&self.control_loop_interval_s) {
            warn!("[Settings] control_loop_interval_s {} out of range 1-60, clamping", self.control_loop_interval_s);
            self.control_loop_interval_s = self.control_loop_interval_s.clamp(1, 60);
        }
        if !(2.0..=98.0).contains(&self.balancing_threshold) {
            warn!("[Settings] balancing_threshold {} out of range 2-98, clamping", self.balancing_threshold);
            self.balancing_threshold = self.balancing_threshold.clamp(2.0, 98.0);
        }
        if !(0.0..=150_000.0).contains(&self.continuous_inverter_power_w) {
            warn!("[Settings] continuous_inverter_power_w {} out of range 0-150000, clamping", self.continuous_inverter_power_w);
            self.continuous_inverter_power_w = self.continuous_inverter_power_w.clamp(0.0, 150_000.0);
        }
        if self.mode > 1 {
            warn!("[Settings] mode {} is not 0/1, treating as on", self.mode);
            self.mode = 1;
        }
    }
}

// --------------------------------------------------------------------------------------------------------------

/// The settings document plus its on-disk location.
pub struct SettingsStore {
    path: PathBuf,
    pub settings: EmsSettings,
}

impl SettingsStore {
    /// Load the store. A missing file yields the defaults (first start); a
    /// file that exists but does not parse is an error rather than silently
    /// discarding the persisted counters.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();

        let mut settings = if path.exists() {
            serde_json::from_str::<EmsSettings>(&fs::read_to_string(&path)?)?
        } else {
            warn!("[Settings] {} does not exist, starting with defaults", path.display());
            EmsSettings::default()
        };
        settings.sanitize();

        Ok(Self { path, settings })
    }

    /// Persist the document. Written to a sibling temp file first and renamed
    /// into place so a crash mid-write cannot corrupt the counters.
    pub fn save(&self) -> Result<(), SettingsError> {
        let serialized = serde_json::to_string_pretty(&self.settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// --------------------------------------------------------------------------------------------------------------
