use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use std::collections::HashMap;

use crate::handlers::ems::controller::{SystemMonitor, SystemSnapshot};
use crate::models::phase_models::PhasePower;
use crate::models::system_models::GridMetrics;

// --------------------------------------------------------------------------------------------------------------
// Peer-value monitor over the local RPC bridge. Every input path the control loop consumes is
// fetched through GET /value?path=<PATH>; absent paths fall back to 0 / None so the loop keeps
// running on a half-populated system.

const PATH_BATTERY_POWER:      &str = "/Dc/Battery/Power";
const PATH_BATTERY_SOC:        &str = "/Dc/Battery/Soc";
const PATH_DC_PV_POWER:        &str = "/Dc/Pv/Power";
const PATH_DESS_CHARGE_RATE:   &str = "/DynamicEss/ChargeRate";
const PATH_DESS_STRATEGY:      &str = "/DynamicEss/ReactiveStrategy";
const PATH_ACTIVE_BMS:         &str = "/ActiveBmsService";
const PATH_GRID_PHASES:        &str = "/Ac/Grid/NumberOfPhases";
const PATH_GRID_PARALLEL:      &str = "/Ac/ActiveIn/GridParallel";
const PATH_OUTPUT_PHASES:      &str = "/Ac/NumberOfPhases";
const PATH_HUB4_MODE:          &str = "/Settings/CGwacs/Hub4Mode";
const PATH_PREVENT_FEEDBACK:   &str = "/Settings/CGwacs/PreventFeedback";

const PATH_BMS_CCL: &str = "/Info/MaxChargeCurrent";
const PATH_BMS_CVL: &str = "/Info/MaxChargeVoltage";

/// All scalar paths polled in one batch per tick.
const SNAPSHOT_PATHS: &[&str] = &[
    PATH_BATTERY_POWER, PATH_BATTERY_SOC, PATH_DC_PV_POWER,
    PATH_DESS_CHARGE_RATE, PATH_DESS_STRATEGY, PATH_ACTIVE_BMS,
    PATH_GRID_PHASES, PATH_GRID_PARALLEL, PATH_OUTPUT_PHASES,
    PATH_HUB4_MODE, PATH_PREVENT_FEEDBACK,
    "/Ac/PvOnGrid/L1/Power", "/Ac/PvOnGrid/L2/Power", "/Ac/PvOnGrid/L3/Power",
    "/Ac/PvOnOutput/L1/Power", "/Ac/PvOnOutput/L2/Power", "/Ac/PvOnOutput/L3/Power",
    "/Ac/Consumption/L1/Power", "/Ac/Consumption/L2/Power", "/Ac/Consumption/L3/Power",
];

// --------------------------------------------------------------------------------------------------------------

pub struct HttpMonitor {
    client: Client,
    base_url: String,
}

impl HttpMonitor {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    /// Fetch a single value. `service` scopes the path to a peer service
    /// (used for the BMS limits); the default scope is the system service.
    async fn fetch_value(&self, service: Option<&str>, path: &str) -> Option<serde_json::Value> {
        let url = format!("{}/value", self.base_url);
        let mut query: Vec<(&str, &str)> = vec![("path", path)];
        if let Some(service) = service {
            query.push(("service", service));
        }

        let response = self.client.get(&url).query(&query).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
                Ok(value) => {
                    debug!("[Bridge] {} = {}", path, value);
                    Some(value)
                }
                Err(e) => {
                    warn!("[Bridge] Failed to parse value for '{}': {}", path, e);
                    None
                }
            },
            Ok(_) => None, // absent path; the read site defaults
            Err(e) => {
                warn!("[Bridge] HTTP error fetching '{}': {}", path, e);
                None
            }
        }
    }

    /// CCL x CVL of the active BMS service; None unless both limits are known.
    async fn charge_power_capability(&self, active_bms: Option<&str>) -> Option<f64> {
        let service = active_bms.filter(|s| !s.is_empty())?;

        let ccl = self.fetch_value(Some(service), PATH_BMS_CCL).await?.as_f64()?;
        let cvl = self.fetch_value(Some(service), PATH_BMS_CVL).await?.as_f64()?;
        Some(ccl * cvl)
    }
}

#[async_trait]
impl SystemMonitor for HttpMonitor {
    async fn snapshot(&self) -> SystemSnapshot {
        // Fire all scalar requests concurrently and build a lookup map.
        let futures: Vec<_> =
            SNAPSHOT_PATHS.iter().map(|path| self.fetch_value(None, path)).collect();
        let results = futures::future::join_all(futures).await;

        let values: HashMap<&str, serde_json::Value> = SNAPSHOT_PATHS
            .iter()
            .zip(results)
            .filter_map(|(path, value)| value.map(|v| (*path, v)))
            .collect();

        let f64_or_zero = |path: &str| values.get(path).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let f64_opt = |path: &str| values.get(path).and_then(|v| v.as_f64());
        let i64_opt = |path: &str| values.get(path).and_then(|v| v.as_i64());
        let phase = |prefix: &str| {
            PhasePower::new(
                f64_or_zero(&format!("{}/L1/Power", prefix)),
                f64_or_zero(&format!("{}/L2/Power", prefix)),
                f64_or_zero(&format!("{}/L3/Power", prefix)),
                0.0,
            )
        };

        let active_bms = values.get(PATH_ACTIVE_BMS).and_then(|v| v.as_str()).map(str::to_string);
        let charge_power_capability = self.charge_power_capability(active_bms.as_deref()).await;

        SystemSnapshot {
            battery_power_w: f64_or_zero(PATH_BATTERY_POWER),
            pv_on_grid: phase("/Ac/PvOnGrid"),
            pv_on_output: phase("/Ac/PvOnOutput"),
            consumption: phase("/Ac/Consumption"),
            dc_pv_power_w: f64_or_zero(PATH_DC_PV_POWER),
            soc: f64_opt(PATH_BATTERY_SOC),
            dess_charge_rate: f64_opt(PATH_DESS_CHARGE_RATE),
            dess_reactive_strategy: i64_opt(PATH_DESS_STRATEGY),
            charge_power_capability,
            grid: GridMetrics {
                grid_parallel: i64_opt(PATH_GRID_PARALLEL).map(|v| v == 1),
                grid_phases: i64_opt(PATH_GRID_PHASES).map(|v| v as u8),
                output_phases: i64_opt(PATH_OUTPUT_PHASES).map(|v| v as u8),
                saldating: i64_opt(PATH_HUB4_MODE) == Some(1),
                feed_in_limited: i64_opt(PATH_PREVENT_FEEDBACK) == Some(1),
            },
        }
    }
}
