use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::models::s2_models::CommodityQuantity;

// --------------------------------------------------------------------------------------------------------------
// Power in this system always lives on one of four rails: the three AC phases and the DC bus.
// PhasePower carries one value per rail and offers three access styles so call sites can pick
// whatever they have at hand: direct fields, a Phase index, or an S2 commodity tag.

/// One of the four power rails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    L1,
    L2,
    L3,
    Dc,
}

impl Phase {
    /// The three AC phases in ascending order. Most allocation loops walk these.
    pub const AC: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    /// The three AC phases in the order the battery reservation consumes them.
    pub const AC_RESERVATION_ORDER: [Phase; 3] = [Phase::L3, Phase::L2, Phase::L1];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::L1 => write!(f, "L1"),
            Phase::L2 => write!(f, "L2"),
            Phase::L3 => write!(f, "L3"),
            Phase::Dc => write!(f, "DC"),
        }
    }
}

// --------------------------------------------------------------------------------------------------------------

/// A signed power (or energy) value split over L1, L2, L3 and the DC bus.
/// Supports component-wise `+`, `-`, `+=`, `-=`; no rail is privileged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhasePower {
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
    pub dc: f64,
}

impl PhasePower {
    pub fn new(l1: f64, l2: f64, l3: f64, dc: f64) -> Self {
        Self { l1, l2, l3, dc }
    }

    /// Sum over all four rails.
    pub fn total(&self) -> f64 {
        self.l1 + self.l2 + self.l3 + self.dc
    }

    pub fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::L1 => self.l1,
            Phase::L2 => self.l2,
            Phase::L3 => self.l3,
            Phase::Dc => self.dc,
        }
    }

    pub fn set(&mut self, phase: Phase, value: f64) {
        match phase {
            Phase::L1 => self.l1 = value,
            Phase::L2 => self.l2 = value,
            Phase::L3 => self.l3 = value,
            Phase::Dc => self.dc = value,
        }
    }

    pub fn add(&mut self, phase: Phase, delta: f64) {
        self.set(phase, self.get(phase) + delta);
    }

    /// Read through an S2 commodity tag. The 3-phase-symmetric tag reads the
    /// AC sum, matching its write semantics of an equal split.
    pub fn commodity_get(&self, commodity: CommodityQuantity) -> f64 {
        match commodity {
            CommodityQuantity::ElectricPowerL1 => self.l1,
            CommodityQuantity::ElectricPowerL2 => self.l2,
            CommodityQuantity::ElectricPowerL3 => self.l3,
            CommodityQuantity::ElectricPower3PhaseSymmetric => self.l1 + self.l2 + self.l3,
            _ => 0.0,
        }
    }

    /// Add through an S2 commodity tag. The 3-phase-symmetric tag splits the
    /// value equally over L1, L2 and L3.
    pub fn commodity_add(&mut self, commodity: CommodityQuantity, delta: f64) {
        match commodity {
            CommodityQuantity::ElectricPowerL1 => self.l1 += delta,
            CommodityQuantity::ElectricPowerL2 => self.l2 += delta,
            CommodityQuantity::ElectricPowerL3 => self.l3 += delta,
            CommodityQuantity::ElectricPower3PhaseSymmetric => {
                self.l1 += delta / 3.0;
                self.l2 += delta / 3.0;
                self.l3 += delta / 3.0;
            }
            _ => {}
        }
    }

    /// AC-only copy with the DC rail zeroed.
    pub fn ac_only(&self) -> Self {
        Self { l1: self.l1, l2: self.l2, l3: self.l3, dc: 0.0 }
    }
}

// --------------------------------------------------------------------------------------------------------------

impl Add for PhasePower {
    type Output = PhasePower;

    fn add(self, other: PhasePower) -> PhasePower {
        PhasePower {
            l1: self.l1 + other.l1,
            l2: self.l2 + other.l2,
            l3: self.l3 + other.l3,
            dc: self.dc + other.dc,
        }
    }
}

impl AddAssign for PhasePower {
    fn add_assign(&mut self, other: PhasePower) {
        self.l1 += other.l1;
        self.l2 += other.l2;
        self.l3 += other.l3;
        self.dc += other.dc;
    }
}

impl Sub for PhasePower {
    type Output = PhasePower;

    fn sub(self, other: PhasePower) -> PhasePower {
        PhasePower {
            l1: self.l1 - other.l1,
            l2: self.l2 - other.l2,
            l3: self.l3 - other.l3,
            dc: self.dc - other.dc,
        }
    }
}

impl SubAssign for PhasePower {
    fn sub_assign(&mut self, other: PhasePower) {
        self.l1 -= other.l1;
        self.l2 -= other.l2;
        self.l3 -= other.l3;
        self.dc -= other.dc;
    }
}

impl fmt::Display for PhasePower {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:.1}W | L1={:.1} L2={:.1} L3={:.1} DC={:.1}]",
            self.total(),
            self.l1,
            self.l2,
            self.l3,
            self.dc,
        )
    }
}

// --------------------------------------------------------------------------------------------------------------
