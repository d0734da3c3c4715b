use log::debug;
use thiserror::Error;

use crate::models::phase_models::{Phase, PhasePower};
use crate::models::s2_models::CommodityQuantity;
use crate::models::system_models::SystemType;

// --------------------------------------------------------------------------------------------------------------
// Transactional solar-surplus ledger. One instance lives for exactly one control tick: the
// scheduler constructs it from the surplus snapshot, sessions claim power out of it inside
// begin()/commit()/rollback() brackets, and whatever remains at the end of the tick is discarded.

/// One-way AC<->DC conversion efficiency. Experimental value; a cross-phase
/// ACDCAC route pays this twice.
pub const AC_DC_EFFICIENCY: f64 = 0.925;

/// Below this a residual demand counts as satisfied. Keeps conversion-division
/// residue from failing a claim that is arithmetically complete.
const RESIDUE_EPSILON: f64 = 1e-6;

/// Primary consumers need at least this much total surplus left after their
/// claim; prevents on/off flapping around the zero line.
const PRIMARY_MIN_SURPLUS: f64 = 50.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("claim transaction already running; call commit() or rollback() before begin()")]
    TransactionAlreadyOpen,
    #[error("no claim transaction running; call begin() first")]
    NoTransaction,
}

// --------------------------------------------------------------------------------------------------------------

pub struct SolarOverhead {
    /// Remaining surplus per rail; mutated in place by successful claims.
    power: PhasePower,
    /// Footprint the battery reservation leaves on the surplus. Diagnostic:
    /// enforcement happens through the post-cascade gates, not by deduction.
    reserved: PhasePower,
    /// Continuous per-phase inverter capability.
    inverter_power: PhasePower,
    /// Snapshot taken at begin(), restored verbatim by rollback().
    prior_power: Option<PhasePower>,
    /// Claim accumulated inside the open transaction.
    power_claim: PhasePower,
    /// AC share of the most recent claim target; consumers without power
    /// measurements get their energy counters estimated from this.
    power_request: PhasePower,
    battery_reservation: f64,
    battery_rate: f64,
    system_type: SystemType,
    transaction_open: bool,
}

impl SolarOverhead {
    pub fn new(
        surplus: PhasePower,
        reservation: f64,
        battery_rate: f64,
        inverter_power_per_phase: f64,
        system_type: SystemType,
    ) -> Self {
        // Work out which part of the surplus the reservation will effectively occupy:
        // DC-PV feeds the battery directly, AC-PV has to round-trip through the
        // conversion stage, so each AC phase only contributes its discounted share.
        // Consumed in the order DC, L3, L2, L1.
        let mut reserved = PhasePower::default();
        let mut unplaced = reservation;
        if unplaced > 0.0 {
            if unplaced <= surplus.dc {
                reserved.dc = unplaced;
            } else {
                reserved.dc = surplus.dc;
                unplaced -= surplus.dc;

                for phase in Phase::AC_RESERVATION_ORDER {
                    if unplaced > 0.0 {
                        let contribution = surplus.get(phase) * AC_DC_EFFICIENCY;
                        if unplaced <= contribution {
                            reserved.set(phase, unplaced / AC_DC_EFFICIENCY);
                            unplaced = 0.0;
                        } else {
                            unplaced -= contribution;
                            reserved.set(phase, surplus.get(phase));
                        }
                    }
                }
            }
        }

        Self {
            power: surplus,
            reserved,
            inverter_power: PhasePower::new(
                inverter_power_per_phase,
                inverter_power_per_phase,
                inverter_power_per_phase,
                0.0,
            ),
            prior_power: None,
            power_claim: PhasePower::default(),
            power_request: PhasePower::default(),
            battery_reservation: reservation,
            battery_rate,
            system_type,
            transaction_open: false,
        }
    }

    pub fn remaining(&self) -> PhasePower {
        self.power
    }

    pub fn reserved(&self) -> PhasePower {
        self.reserved
    }

    pub fn inverter_power(&self) -> PhasePower {
        self.inverter_power
    }

    pub fn power_request(&self) -> PhasePower {
        self.power_request
    }

    pub fn battery_reservation(&self) -> f64 {
        self.battery_reservation
    }

    pub fn battery_rate(&self) -> f64 {
        self.battery_rate
    }

    pub fn system_type(&self) -> SystemType {
        self.system_type
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_open
    }

    // ----------------------------------------------------------------------------------------------------------

    /// Open a claim checkpoint. If every claim needed for one consumer mode
    /// succeeds, call commit(); if any fails, rollback() before trying the
    /// next mode.
    pub fn begin(&mut self) -> Result<(), LedgerError> {
        if self.transaction_open {
            return Err(LedgerError::TransactionAlreadyOpen);
        }

        self.prior_power = Some(self.power);
        self.power_claim = PhasePower::default();
        self.transaction_open = true;
        Ok(())
    }

    /// Claim up to `max` watts on the given commodity. Satisfies per-phase
    /// demand through the cheapest route first: direct AC, then DC or
    /// cross-phase ACDCAC depending on the metering topology. With `force`
    /// any shortfall is charged to the DC bus (battery discharge) and the
    /// reservation gates are skipped.
    pub fn claim(
        &mut self,
        commodity: CommodityQuantity,
        _min: f64,
        max: f64,
        primary: bool,
        force: bool,
    ) -> Result<bool, LedgerError> {
        if !self.transaction_open {
            return Err(LedgerError::NoTransaction);
        }

        // Split the target demand onto individual rails. Symmetric loads draw
        // a third per phase; per-phase loads draw everything on their phase.
        let mut claim_target = PhasePower::default();
        claim_target.commodity_add(commodity, max);
        self.power_request = claim_target.ac_only();

        if max <= 0.0 {
            // Zero demand is always satisfiable and must not consult the gates.
            return Ok(true);
        }

        debug!("[Ledger] claim {}W on {:?} (primary={}, force={})", max, commodity, primary, force);

        claim_target = self.try_claim_ac(claim_target);

        // With a saldating meter cross-phase routing is lossless, so prefer it
        // and keep the DC buffer as the fallback. Everything else drains DC
        // first and pays double conversion for whatever must cross phases.
        if claim_target.total() > RESIDUE_EPSILON {
            if self.system_type.is_saldating() {
                claim_target = self.try_claim_acdcac(claim_target, 1.0);
                if claim_target.total() > RESIDUE_EPSILON {
                    claim_target = self.try_claim_dc(claim_target);
                }
            } else {
                claim_target = self.try_claim_dc(claim_target);
                if claim_target.total() > RESIDUE_EPSILON {
                    claim_target =
                        self.try_claim_acdcac(claim_target, AC_DC_EFFICIENCY * AC_DC_EFFICIENCY);
                }
            }
        }

        if claim_target.total() > RESIDUE_EPSILON {
            debug!("[Ledger] missing power: {:.1}W", claim_target.total());
            if !force {
                return Ok(false);
            }

            // Forced claim: the battery pays for what is missing.
            debug!("[Ledger] force-claiming remaining {:.1}W from DC", claim_target.total());
            self.power.dc -= claim_target.total();
            self.power_claim.dc += claim_target.total();
        }

        // Reservation gates. Claims that would eat into the battery share are
        // only allowed for primary consumers or forced fallbacks.
        debug!(
            "[Ledger] claim {} vs reservation {:.0}W on budget {:.1}W (primary={}, force={})",
            self.power_claim, self.battery_reservation, self.power.total(), primary, force
        );
        if self.power.total() < self.battery_reservation && !primary && !force {
            debug!("[Ledger] claim would violate battery reservation, rejecting");
            return Ok(false);
        }

        if !force && primary && self.power.total() <= PRIMARY_MIN_SURPLUS {
            debug!("[Ledger] primary claim leaves no workable surplus, rejecting");
            return Ok(false);
        }

        Ok(true)
    }

    /// Close the transaction and return the accumulated claim.
    pub fn commit(&mut self) -> Result<PhasePower, LedgerError> {
        if !self.transaction_open {
            return Err(LedgerError::NoTransaction);
        }

        let claim = self.power_claim;
        self.prior_power = None;
        self.power_claim = PhasePower::default();
        self.transaction_open = false;
        Ok(claim)
    }

    /// Close the transaction and restore the surplus to its begin() snapshot.
    pub fn rollback(&mut self) -> Result<(), LedgerError> {
        if !self.transaction_open {
            return Err(LedgerError::NoTransaction);
        }

        let prior = self.prior_power.take().unwrap_or(self.power);
        debug!("[Ledger] rolling back overhead from {} to {}", self.power, prior);
        self.power = prior;
        self.power_claim = PhasePower::default();
        self.transaction_open = false;
        Ok(())
    }

    /// Swap an already committed claim for the prior, larger one. Used when a
    /// consumer is stuck in a transition timer and keeps drawing its old
    /// power: the surplus must stay pinned at the old level until the
    /// consumer actually ramps down.
    pub fn rebook_claim(&mut self, committed: PhasePower, prior: PhasePower) {
        debug_assert!(!self.transaction_open);
        self.power += committed;
        self.power -= prior;
    }

    // ----------------------------------------------------------------------------------------------------------

    fn try_claim_ac(&mut self, mut claim_target: PhasePower) -> PhasePower {
        for phase in Phase::AC {
            if claim_target.get(phase) > RESIDUE_EPSILON {
                let available = self.power.get(phase);
                let claimed = if claim_target.get(phase) <= available {
                    claim_target.get(phase)
                } else {
                    available.max(0.0)
                };

                self.power_claim.add(phase, claimed);
                self.power.add(phase, -claimed);
                claim_target.add(phase, -claimed);
                debug!("[Ledger] claimed {:.1}W AC on {}, {:.1}W left there", claimed, phase, self.power.get(phase));
            }
        }

        claim_target
    }

    fn try_claim_dc(&mut self, mut claim_target: PhasePower) -> PhasePower {
        for phase in Phase::AC {
            if claim_target.get(phase) > RESIDUE_EPSILON {
                let claimed = if claim_target.get(phase) <= self.power.dc {
                    claim_target.get(phase)
                } else {
                    self.power.dc.max(0.0)
                };

                // Every phase may source from the DC buffer, so the DC claim accumulates.
                self.power_claim.dc += claimed;
                self.power.dc -= claimed;
                claim_target.add(phase, -claimed);
                debug!("[Ledger] claimed {:.1}W DC for {}, DC now {:.1}W", claimed, phase, self.power.dc);
            }
        }

        claim_target
    }

    /// Satisfy demand on one phase by drawing from a different phase through
    /// the DC stage. Delivering 1 W costs 1/penalty W at the donor.
    fn try_claim_acdcac(&mut self, mut claim_target: PhasePower, penalty: f64) -> PhasePower {
        for phase in Phase::AC {
            for donor in Phase::AC {
                if donor == phase || claim_target.get(phase) <= RESIDUE_EPSILON {
                    continue;
                }

                let available = self.power.get(donor);
                if available <= RESIDUE_EPSILON {
                    continue;
                }

                let demand_at_donor = claim_target.get(phase) / penalty;
                let (drawn, delivered) = if available >= demand_at_donor {
                    (demand_at_donor, claim_target.get(phase))
                } else {
                    (available, available * penalty)
                };

                self.power_claim.add(donor, drawn);
                self.power.add(donor, -drawn);
                claim_target.add(phase, -delivered);
                debug!(
                    "[Ledger] claimed {:.1}W from {} delivering {:.1}W on {} via ACDCAC",
                    drawn, donor, delivered, phase
                );
            }
        }

        claim_target
    }
}

// --------------------------------------------------------------------------------------------------------------
