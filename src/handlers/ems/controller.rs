use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::configuration::config::SettingsStore;
use crate::handlers::ems::overhead::{LedgerError, SolarOverhead, AC_DC_EFFICIENCY};
use crate::handlers::ems::reservation::{current_battery_reservation, ReservationInputs};
use crate::handlers::s2::session::ConsumerSession;
use crate::handlers::s2::transport::{BusEvent, S2Bus};
use crate::models::phase_models::PhasePower;
use crate::models::system_models::{ConsumerClass, EmsMode, GridMetrics, SystemType};

// --------------------------------------------------------------------------------------------------------------
// The EMS scheduler. A single cooperative loop services four periodic timers (control tick,
// 1 Hz power tracking, counter persistence, connection retry) and the bus event stream. The
// session list and the per-tick ledger are owned here and only ever touched from this loop.

const COUNTER_PERSIST_INTERVAL_S: u64 = 60;
const CONNECTION_RETRY_INTERVAL_S: u64 = 35;

/// A service may host at most this many resource managers.
const MAX_RMS_PER_SERVICE: usize = 10;

/// Ceiling for the synthetic balancing offset (W).
const BALANCING_OFFSET_LIMIT: f64 = 90_000.0;

/// Offset growth per control tick while balancing is wanted (W).
const BALANCING_OFFSET_STEP: f64 = 100.0;

// --------------------------------------------------------------------------------------------------------------

/// One control tick's worth of peer telemetry, snapshotted through the
/// monitor. Absent peer values arrive as 0 / None; the loop must keep
/// running on a half-populated system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSnapshot {
    /// /Dc/Battery/Power; positive while charging.
    pub battery_power_w: f64,
    /// /Ac/PvOnGrid/Ln/Power per phase.
    pub pv_on_grid: PhasePower,
    /// /Ac/PvOnOutput/Ln/Power per phase.
    pub pv_on_output: PhasePower,
    /// /Ac/Consumption/Ln/Power per phase.
    pub consumption: PhasePower,
    /// /Dc/Pv/Power.
    pub dc_pv_power_w: f64,
    /// Battery state of charge in percent.
    pub soc: Option<f64>,
    /// /DynamicEss/ChargeRate.
    pub dess_charge_rate: Option<f64>,
    /// /DynamicEss/ReactiveStrategy.
    pub dess_reactive_strategy: Option<i64>,
    /// CCL x CVL of the active BMS, when both limits are published.
    pub charge_power_capability: Option<f64>,
    /// Grid-side inputs for the topology classifier.
    pub grid: GridMetrics,
}

/// Source of the per-tick system snapshot.
#[async_trait]
pub trait SystemMonitor: Send + Sync {
    async fn snapshot(&self) -> SystemSnapshot;
}

/// Sink for the published /Ems/... values.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, path: &str, value: serde_json::Value);
}

// --------------------------------------------------------------------------------------------------------------

pub struct EmsController {
    bus: Arc<dyn S2Bus>,
    monitor: Arc<dyn SystemMonitor>,
    telemetry: Box<dyn TelemetrySink>,
    store: SettingsStore,

    /// Insertion-ordered; the priority sort is stable so ties resolve by
    /// arrival order deterministically.
    sessions: Vec<ConsumerSession>,

    system_type: SystemType,
    power_primary: PhasePower,
    power_secondary: PhasePower,
    counter_primary: PhasePower,
    counter_secondary: PhasePower,
    dcpv_balancing_offset: f64,
    enabled: bool,
}

impl EmsController {
    pub fn new(
        bus: Arc<dyn S2Bus>,
        monitor: Arc<dyn SystemMonitor>,
        telemetry: Box<dyn TelemetrySink>,
        store: SettingsStore,
    ) -> Self {
        let counter_primary = store.settings.energy_counters.primary();
        let counter_secondary = store.settings.energy_counters.secondary();
        let enabled = store.settings.ems_mode() == EmsMode::On;

        let controller = Self {
            bus,
            monitor,
            telemetry,
            store,
            sessions: Vec::new(),
            system_type: SystemType::Unknown,
            power_primary: PhasePower::default(),
            power_secondary: PhasePower::default(),
            counter_primary,
            counter_secondary,
            dcpv_balancing_offset: 0.0,
            enabled,
        };

        controller.telemetry.publish("/Ems/Active", json!(if enabled { 1 } else { 0 }));
        if enabled {
            info!(
                "[EMS] Activated with a control loop interval of {}s",
                controller.store.settings.control_loop_interval_s
            );
        } else {
            info!("[EMS] Deactivated.");
        }
        controller
    }

    /// Run the scheduler until the event stream closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<BusEvent>) {
        let mut control_tick =
            tokio::time::interval(Duration::from_secs(self.store.settings.control_loop_interval_s));
        let mut power_tick = tokio::time::interval(Duration::from_secs(1));
        let mut persist_tick =
            tokio::time::interval(Duration::from_secs(COUNTER_PERSIST_INTERVAL_S));
        let mut retry_tick =
            tokio::time::interval(Duration::from_secs(CONNECTION_RETRY_INTERVAL_S));
        for interval in [&mut control_tick, &mut power_tick, &mut persist_tick, &mut retry_tick] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = control_tick.tick() => {
                    if self.enabled {
                        if let Err(e) = self.control_loop_tick().await {
                            // Fail fast for this tick only; the timer survives.
                            error!("[EMS] Exception during control loop: {}", e);
                        }
                    }
                }
                _ = power_tick.tick() => {
                    // Keep-alives belong to the sessions, not to the EMS mode.
                    let now = Instant::now();
                    for session in &mut self.sessions {
                        session.poll_keep_alive(now).await;
                    }
                    if self.enabled {
                        self.track_power_tick();
                    }
                }
                _ = persist_tick.tick() => {
                    if self.enabled {
                        self.persist_counters();
                    }
                }
                _ = retry_tick.tick() => {
                    if self.enabled {
                        self.retry_connections().await;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("[EMS] Bus event stream closed, shutting down.");
                        break;
                    }
                }
            }
        }
    }

    // ----------------------------------------------------------------------------------------------------------
    // Bus events

    async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Message { client_id, payload } => {
                if let Some(session) =
                    self.sessions.iter_mut().find(|s| s.unique_id() == client_id)
                {
                    session.handle_message(&payload).await;
                }
            }
            BusEvent::Disconnect { client_id, reason } => {
                if let Some(session) =
                    self.sessions.iter_mut().find(|s| s.unique_id() == client_id)
                {
                    session.on_disconnect(&reason);
                }
            }
            BusEvent::DeviceAdded { service, instance, resource_managers } => {
                debug!("[EMS] Device added: {}", service);
                for descriptor in resource_managers.iter().take(MAX_RMS_PER_SERVICE) {
                    let mut session =
                        ConsumerSession::new(&service, instance, descriptor, self.bus.clone());
                    info!(
                        "[EMS] Identified S2 RM {} on {}. Added to managed sessions as {}",
                        descriptor.index,
                        service,
                        session.unique_id()
                    );
                    session.begin().await;

                    // A re-announced RM replaces its old session in place so
                    // the priority-tie order stays stable.
                    match self.sessions.iter().position(|s| s.unique_id() == session.unique_id()) {
                        Some(existing) => self.sessions[existing] = session,
                        None => self.sessions.push(session),
                    }
                }
            }
            BusEvent::DeviceRemoved { service } => {
                debug!("[EMS] Device removed: {}", service);
                for session in &mut self.sessions {
                    if session.service() == service {
                        info!("[EMS] Removing {} from managed sessions.", session.unique_id());
                        session.end();
                    }
                }
                self.sessions.retain(|s| s.service() != service);
            }
            BusEvent::ModeChanged { mode } => self.set_mode(mode),
            BusEvent::DebugLogsChanged { enabled } => {
                if enabled {
                    info!("[EMS] Enabled debug logging.");
                    log::set_max_level(log::LevelFilter::Debug);
                } else {
                    info!("[EMS] Disabled debug logging.");
                    log::set_max_level(log::LevelFilter::Info);
                }
            }
        }
    }

    fn set_mode(&mut self, mode: EmsMode) {
        let enable = mode == EmsMode::On;
        if enable == self.enabled {
            return;
        }

        self.enabled = enable;
        self.store.settings.mode = if enable { 1 } else { 0 };
        self.telemetry.publish("/Ems/Active", json!(if enable { 1 } else { 0 }));
        if enable {
            info!(
                "[EMS] Activated with a control loop interval of {}s",
                self.store.settings.control_loop_interval_s
            );
        } else {
            info!("[EMS] Deactivated.");
        }
    }

    // ----------------------------------------------------------------------------------------------------------
    // Control loop

    async fn control_loop_tick(&mut self) -> Result<(), LedgerError> {
        debug!("[EMS] v------------------- LOOP -------------------v");
        let started = Instant::now();

        let snapshot = self.monitor.snapshot().await;

        self.system_type = SystemType::classify(&snapshot.grid);
        if self.system_type == SystemType::Unknown {
            warn!("[EMS] Unable to determine the system type by now. Retrying later...");
        }
        self.telemetry.publish("/Ems/SystemType", json!(self.system_type.value()));

        let inputs = ReservationInputs {
            soc: snapshot.soc,
            charge_power_capability: snapshot.charge_power_capability,
            dess_charge_rate: snapshot.dess_charge_rate,
            dess_reactive_strategy: snapshot.dess_reactive_strategy,
        };
        let (reservation, reservation_state) = current_battery_reservation(
            &self.store.settings.battery_reservation_equation,
            &inputs,
        );
        self.telemetry.publish("/Ems/BatteryReservation", json!(reservation));
        self.telemetry
            .publish("/Ems/BatteryReservationState", json!(reservation_state.as_str()));

        let mut overhead = self.available_overhead(&snapshot, reservation);
        debug!(
            "[EMS] SOC={:?}%, RSRV={}/{}W ({}), overhead {}",
            snapshot.soc,
            overhead.battery_rate(),
            reservation,
            reservation_state.as_str(),
            overhead.remaining(),
        );
        debug!(
            "[EMS] Reservation footprint {} on {}, inverter cap {}",
            overhead.reserved(),
            overhead.system_type(),
            overhead.inverter_power(),
        );

        // Only iterate when there is surplus to hand out, or EMS-driven
        // consumption that may need to be switched off.
        if overhead.remaining().total() > 0.0
            || self.power_primary.total() > 0.0
            || self.power_secondary.total() > 0.0
        {
            let mut order: Vec<usize> = (0..self.sessions.len()).collect();
            order.sort_by_key(|&i| self.sessions[i].priority);

            for index in order {
                let session = &mut self.sessions[index];
                if session.is_initialized() && session.rm_details.is_some() {
                    let name = session
                        .rm_details
                        .as_ref()
                        .map(|d| d.display_name().to_string())
                        .unwrap_or_default();
                    if session.is_controllable() {
                        debug!("[EMS] ===== RM {} ({}) is controllable =====", session.unique_id(), name);
                        session.self_assign(&mut overhead)?;
                        debug!("[EMS] ==> Remaining overhead: {}", overhead.remaining());
                    } else {
                        debug!("[EMS] ===== RM {} ({}) is uncontrollable =====", session.unique_id(), name);
                    }
                } else {
                    debug!(
                        "[EMS] ===== RM {} is not yet initialized ({:?}) =====",
                        session.unique_id(),
                        session.state()
                    );
                }
            }

            // Instructions only go out once every session has claimed, so the
            // whole tick sees one consistent allocation.
            for session in &mut self.sessions {
                if session.is_initialized() {
                    session.commit().await;
                }
            }
        } else {
            debug!("[EMS] ZzZzZzz...");
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!("[EMS] Loop took {:.1}ms", duration_ms);
        self.telemetry.publish("/Ems/Debug/LoopTime", json!(duration_ms));
        debug!("[EMS] ^------------------- LOOP -------------------^");
        Ok(())
    }

    /// The surplus the ledger starts from: AC PV minus consumption per phase,
    /// EMS-driven loads added back in (they are about to be re-allocated and
    /// must not count as consumption), phase deficits absorbed by DC-PV, and
    /// the balancing offset applied on top.
    fn available_overhead(&mut self, snapshot: &SystemSnapshot, reservation: f64) -> SolarOverhead {
        let battery_rate = snapshot.battery_power_w;

        let mut ac = snapshot.pv_on_grid + snapshot.pv_on_output - snapshot.consumption;
        for session in &self.sessions {
            if session.is_active_ems_control {
                ac += session.current_power.ac_only();
            }
        }

        // DC-PV pays one conversion before it can serve an AC consumer.
        let mut dcpv = snapshot.dc_pv_power_w * AC_DC_EFFICIENCY;
        let mut l1 = ac.l1;
        let mut l2 = ac.l2;
        let mut l3 = ac.l3;
        if l1 < 0.0 {
            dcpv -= l1.abs();
            l1 = 0.0;
        }
        if l2 < 0.0 {
            dcpv -= l2.abs();
            l2 = 0.0;
        }
        if l3 < 0.0 {
            dcpv -= l3.abs();
            l3 = 0.0;
        }

        // Zero-feed-in and off-grid systems throttle PV once the battery is
        // nearly full. Pretending extra DC surplus steers consumers into
        // absorbing what would otherwise be curtailed; normal operation
        // resumes below the threshold.
        let threshold = self.store.settings.balancing_threshold;
        if self.system_type.curtails_surplus() {
            if let Some(soc) = snapshot.soc {
                if soc >= threshold + 1.0
                    && battery_rate > 0.0
                    && self.dcpv_balancing_offset < BALANCING_OFFSET_LIMIT
                {
                    self.dcpv_balancing_offset += BALANCING_OFFSET_STEP;
                    debug!(
                        "[EMS] Increasing dcpv balancing offset to {}W",
                        self.dcpv_balancing_offset
                    );
                }
            }
        }
        // Reset independent of the system type so no offset survives a
        // topology change back to grid-connected.
        if snapshot.soc.map(|soc| soc <= threshold - 1.0).unwrap_or(true) {
            self.dcpv_balancing_offset = 0.0;
        }

        let round1 = |value: f64| (value * 10.0).round() / 10.0;
        SolarOverhead::new(
            PhasePower::new(
                round1(l1),
                round1(l2),
                round1(l3),
                round1(dcpv + self.dcpv_balancing_offset),
            ),
            reservation,
            battery_rate,
            self.store.settings.continuous_inverter_power_w,
            self.system_type,
        )
    }

    // ----------------------------------------------------------------------------------------------------------
    // Power tracking and persistence

    fn track_power_tick(&mut self) {
        self.power_primary = PhasePower::default();
        self.power_secondary = PhasePower::default();

        let now = Utc::now();
        for session in &mut self.sessions {
            if session.is_initialized() {
                let (power, counter) = session.pop_powerstats(now);
                match session.consumer_class {
                    ConsumerClass::Primary => {
                        self.power_primary += power;
                        self.counter_primary += counter;
                    }
                    ConsumerClass::Secondary => {
                        self.power_secondary += power;
                        self.counter_secondary += counter;
                    }
                }
            }
        }

        for (class, power, counter) in [
            ("Primary", self.power_primary, self.counter_primary),
            ("Secondary", self.power_secondary, self.counter_secondary),
        ] {
            for (phase, p, c) in [
                (1, power.l1, counter.l1),
                (2, power.l2, counter.l2),
                (3, power.l3, counter.l3),
            ] {
                self.telemetry
                    .publish(&format!("/Ems/{}Consumer/Ac/L{}/Power", class, phase), json!(p));
                self.telemetry.publish(
                    &format!("/Ems/{}Consumer/Ac/L{}/Energy/Forward", class, phase),
                    json!(c),
                );
            }
            self.telemetry
                .publish(&format!("/Ems/{}Consumer/Ac/Power", class), json!(power.total()));
            self.telemetry.publish(
                &format!("/Ems/{}Consumer/Ac/Energy/Forward", class),
                json!(counter.total()),
            );
        }
    }

    fn persist_counters(&mut self) {
        self.store.settings.energy_counters.set_primary(self.counter_primary);
        self.store.settings.energy_counters.set_secondary(self.counter_secondary);

        match self.store.save() {
            Ok(()) => debug!(
                "[EMS] Saved transient counters: P: {:.3}/{:.3}/{:.3} | S: {:.3}/{:.3}/{:.3}",
                self.counter_primary.l1,
                self.counter_primary.l2,
                self.counter_primary.l3,
                self.counter_secondary.l1,
                self.counter_secondary.l2,
                self.counter_secondary.l3,
            ),
            Err(e) => error!("[EMS] Exception saving counters: {}", e),
        }
    }

    async fn retry_connections(&mut self) {
        for session in &mut self.sessions {
            if !session.is_initialized() {
                info!("[EMS] Retrying connection to {}", session.unique_id());
                session.begin().await;
            }
        }
    }
}

// --------------------------------------------------------------------------------------------------------------
