use serde::{Deserialize, Serialize};
use std::fmt;

// --------------------------------------------------------------------------------------------------------------
// Grid topology classification. The topology decides how the surplus allocator may route power
// between phases: saldating meters net energy across phases (cross-phase transfer is free),
// everything else pays the AC->DC->AC conversion penalty.

/// Topology tag published on /Ems/SystemType. Numeric values are part of the
/// published interface and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    Unknown                      = 0,
    GridConnected1Phase          = 1,
    GridConnected2PhaseSaldating = 2,
    GridConnected3PhaseSaldating = 3,
    GridConnected2PhaseIndividual = 4,
    GridConnected3PhaseIndividual = 5,
    ZeroFeedin1Phase             = 6,
    ZeroFeedin2Phase             = 7,
    ZeroFeedin3Phase             = 8,
    OffGrid1Phase                = 9,
    OffGrid2Phase                = 10,
    OffGrid3Phase                = 11,
}

impl SystemType {
    pub fn value(&self) -> i64 {
        *self as i64
    }

    /// Saldating metering nets energy across phases, so cross-phase routing
    /// carries no efficiency penalty.
    pub fn is_saldating(&self) -> bool {
        matches!(
            self,
            SystemType::GridConnected2PhaseSaldating | SystemType::GridConnected3PhaseSaldating
        )
    }

    /// Topologies where throttled PV is lost rather than exported; these get
    /// the synthetic DC balancing offset applied.
    pub fn curtails_surplus(&self) -> bool {
        matches!(
            self,
            SystemType::ZeroFeedin1Phase
                | SystemType::ZeroFeedin2Phase
                | SystemType::ZeroFeedin3Phase
                | SystemType::OffGrid1Phase
                | SystemType::OffGrid2Phase
                | SystemType::OffGrid3Phase
        )
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SystemType::Unknown                       => "Unknown",
            SystemType::GridConnected1Phase           => "GridConnected1Phase",
            SystemType::GridConnected2PhaseSaldating  => "GridConnected2PhaseSaldating",
            SystemType::GridConnected3PhaseSaldating  => "GridConnected3PhaseSaldating",
            SystemType::GridConnected2PhaseIndividual => "GridConnected2PhaseIndividual",
            SystemType::GridConnected3PhaseIndividual => "GridConnected3PhaseIndividual",
            SystemType::ZeroFeedin1Phase              => "ZeroFeedin1Phase",
            SystemType::ZeroFeedin2Phase              => "ZeroFeedin2Phase",
            SystemType::ZeroFeedin3Phase              => "ZeroFeedin3Phase",
            SystemType::OffGrid1Phase                 => "OffGrid1Phase",
            SystemType::OffGrid2Phase                 => "OffGrid2Phase",
            SystemType::OffGrid3Phase                 => "OffGrid3Phase",
        };
        write!(f, "{}", name)
    }
}

// --------------------------------------------------------------------------------------------------------------

/// The grid-side measurements the classifier needs. All fields come from peer
/// services and may be absent during startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridMetrics {
    /// 1 on /Ac/ActiveIn/GridParallel means the inverter runs alongside the grid.
    pub grid_parallel: Option<bool>,
    /// Number of grid phases while grid-parallel.
    pub grid_phases: Option<u8>,
    /// Number of AC output phases; used when the grid is absent.
    pub output_phases: Option<u8>,
    /// Multi-phase regulation setting: true = total (saldating), false = per phase.
    pub saldating: bool,
    /// Export to grid is blocked (zero feed-in operation).
    pub feed_in_limited: bool,
}

impl SystemType {
    /// Pure classification from grid metrics. Anything undecidable stays
    /// Unknown; a later tick will retry once peers have published values.
    pub fn classify(metrics: &GridMetrics) -> SystemType {
        match metrics.grid_parallel {
            Some(true) => match (metrics.grid_phases, metrics.feed_in_limited) {
                (Some(1), false) => SystemType::GridConnected1Phase,
                (Some(2), false) if metrics.saldating => SystemType::GridConnected2PhaseSaldating,
                (Some(2), false) => SystemType::GridConnected2PhaseIndividual,
                (Some(3), false) if metrics.saldating => SystemType::GridConnected3PhaseSaldating,
                (Some(3), false) => SystemType::GridConnected3PhaseIndividual,
                (Some(1), true) => SystemType::ZeroFeedin1Phase,
                (Some(2), true) => SystemType::ZeroFeedin2Phase,
                (Some(3), true) => SystemType::ZeroFeedin3Phase,
                _ => SystemType::Unknown,
            },
            Some(false) => match metrics.output_phases {
                Some(1) => SystemType::OffGrid1Phase,
                Some(2) => SystemType::OffGrid2Phase,
                Some(3) => SystemType::OffGrid3Phase,
                _ => SystemType::Unknown,
            },
            None => SystemType::Unknown,
        }
    }
}

// --------------------------------------------------------------------------------------------------------------

/// EMS operating mode as persisted in the settings store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmsMode {
    Off = 0,
    On  = 1,
}

impl Default for EmsMode {
    fn default() -> Self {
        EmsMode::Off
    }
}

/// Consumer class. Primary consumers may run on a small genuine surplus even
/// while the battery reservation is unmet; Secondary consumers only run from
/// surplus above the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerClass {
    Primary   = 0,
    Secondary = 1,
}

/// Why the published battery reservation has its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// The user equation's value is in effect.
    Ok,
    /// Lowered to the BMS charge-power capability.
    Bms,
    /// Lowered or zeroed by the dynamic-ESS dispatcher.
    Dess,
    /// The user equation failed to evaluate; reservation forced to 0.
    Error,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Ok    => "OK",
            ReservationState::Bms   => "BMS",
            ReservationState::Dess  => "DESS",
            ReservationState::Error => "ERROR",
        }
    }
}

// --------------------------------------------------------------------------------------------------------------
