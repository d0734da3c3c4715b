use chrono::Utc;
use log::{debug, error, info, warn};
use std::time::Instant;

use crate::handlers::ems::overhead::{LedgerError, SolarOverhead};
use crate::handlers::s2::session::ConsumerSession;
use crate::models::s2_models::{
    new_message_id, ControlType, OmbcInstruction, OmbcOperationMode, OmbcSystemDescription,
};
use crate::models::system_models::ConsumerClass;

// --------------------------------------------------------------------------------------------------------------
// OMBC half of the consumer session: probing the reachable operation modes against the surplus
// ledger, the transition-timer guard, and instruction issuance at commit time.

/// A transition is possible when the RM declared an edge for it; staying in
/// the current mode is always possible.
fn can_transition(
    description: &OmbcSystemDescription,
    active: &OmbcOperationMode,
    candidate: &OmbcOperationMode,
) -> bool {
    if active.id == candidate.id {
        return true;
    }
    description.transition(&active.id, &candidate.id).is_some()
}

impl ConsumerSession {
    /// Claim a share of the tick's surplus matching this consumer's
    /// requirements. The actual instruction goes out on commit(), once every
    /// session has claimed.
    pub fn self_assign(&mut self, overhead: &mut SolarOverhead) -> Result<(), LedgerError> {
        if self.active_control_type != Some(ControlType::OperationModeBasedControl) {
            return Ok(());
        }

        match self.ombc_self_assign(overhead) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    "[S2] Power assignment failed for {}: {}. This may be temporary",
                    self.unique_id(),
                    e
                );
                if overhead.in_transaction() {
                    overhead.rollback()?;
                }
                Ok(())
            }
        }
    }

    fn ombc_self_assign(&mut self, overhead: &mut SolarOverhead) -> Result<(), LedgerError> {
        let description = match self.system_description.clone() {
            Some(d) => d,
            None => {
                warn!("[S2] No system description available for {}", self.unique_id());
                return Ok(());
            }
        };
        let active = match self.active_operation_mode.clone() {
            Some(m) => m,
            None => {
                warn!("[S2] No active operation mode known for {}", self.unique_id());
                return Ok(());
            }
        };

        // Modes reachable from the active one, most expensive first (sorted at
        // receipt). If nothing more expensive can be afforded the last entry,
        // the cheapest reachable mode, is adopted by force: there is neither
        // enough surplus to upgrade nor to keep the current mode.
        let eligible: Vec<OmbcOperationMode> = description
            .operation_modes
            .iter()
            .filter(|m| can_transition(&description, &active, m))
            .cloned()
            .collect();

        debug!(
            "[S2] Eligible modes for {}: {:?}",
            self.unique_id(),
            eligible.iter().map(|m| m.label().to_string()).collect::<Vec<_>>()
        );

        let forced_id = match eligible.last() {
            Some(mode) => mode.id.clone(),
            None => {
                error!("[S2] No valid operation modes to choose from for {}", self.unique_id());
                return Ok(());
            }
        };

        let primary = self.consumer_class == ConsumerClass::Primary;

        for mode in &eligible {
            overhead.begin()?;
            let force = mode.id == forced_id;

            let mut satisfied = true;
            for range in &mode.power_ranges {
                let claimed = overhead.claim(
                    range.commodity_quantity,
                    range.start_of_range,
                    range.end_of_range,
                    primary,
                    force,
                )?;
                if !claimed {
                    debug!(
                        "[S2] Operation mode '{}' not eligible on {}: no availability on {:?}",
                        mode.label(),
                        self.unique_id(),
                        range.commodity_quantity
                    );
                    overhead.rollback()?;
                    satisfied = false;
                    break;
                }
            }
            if !satisfied {
                continue;
            }

            debug!("[S2] Operation mode selected: '{}' on {}", mode.label(), self.unique_id());

            let prior_claim = self.power_claim;
            let new_claim = overhead.commit()?;
            self.next_operation_mode = Some(mode.clone());

            if self.check_timer_block() > 0 {
                // Ramping down while stuck in a transition timer: the consumer
                // keeps drawing its old power, so the surplus stays pinned at
                // the prior claim until the transition goes through.
                if let Some(prior) = prior_claim {
                    if prior.total() > new_claim.total() {
                        warn!(
                            "[S2] Consumer {} is stuck in a transition timer. Reverting power claim from {:.1}W to {:.1}W until the transition is possible",
                            self.unique_id(),
                            new_claim.total(),
                            prior.total()
                        );
                        self.power_claim = Some(prior);
                        overhead.rebook_claim(new_claim, prior);
                        return Ok(());
                    }
                }
                self.power_claim = Some(new_claim);
            } else {
                self.power_claim = Some(new_claim);
                self.power_request = overhead.power_request();
                self.is_active_ems_control = self.power_request.total() > 0.0;
            }
            return Ok(());
        }

        Ok(())
    }

    /// Issue the instruction for the mode chosen during self-assignment, once
    /// no blocking timer stands in the way. Called after every session has
    /// claimed its share.
    pub async fn commit(&mut self) {
        if self.active_control_type != Some(ControlType::OperationModeBasedControl) {
            return;
        }

        let next = match &self.next_operation_mode {
            Some(n) => n.clone(),
            None => return,
        };
        if self.active_operation_mode.as_ref().map(|m| m.id == next.id).unwrap_or(false) {
            // Already in the proposed mode; nothing to send.
            return;
        }

        let seconds_blocked = self.check_timer_block();
        if seconds_blocked > 0 {
            debug!(
                "[S2] Instruction for {} delayed by a blocking timer ({}s)",
                self.unique_id(),
                seconds_blocked
            );
            return;
        }

        if let Some(previous) = &self.active_instruction {
            debug!("[S2] Superseding instruction {} for {}", previous.id, self.unique_id());
        }

        let instruction = OmbcInstruction {
            message_id: new_message_id(),
            id: new_message_id(),
            execution_time: Utc::now(),
            operation_mode_id: next.id.clone(),
            operation_mode_factor: 1.0,
            abnormal_condition: false,
        };

        info!("[S2] Instruction sent: OMBC = '{}' for {}", next.label(), self.unique_id());
        if let Some(claim) = self.power_claim {
            info!("[S2] Power claim: {}", claim);
        }

        // Leaving a known mode may start timers on the traversed edge; they
        // gate later transitions via the blocking-timer lists.
        let mut timers_to_start: Vec<String> = Vec::new();
        if let (Some(active), Some(description)) =
            (&self.active_operation_mode, &self.system_description)
        {
            if let Some(edge) = description.transition(&active.id, &next.id) {
                for timer_id in &edge.start_timers {
                    if let Some(timer) = description.timer(timer_id) {
                        info!(
                            "[S2] Transition '{}' -> '{}' on {} starts timer '{}'",
                            active.label(),
                            next.label(),
                            self.unique_id(),
                            timer.label()
                        );
                    }
                    timers_to_start.push(timer_id.clone());
                }
            }
        }
        for timer_id in timers_to_start {
            self.running_timers.insert(timer_id, Instant::now());
        }

        self.active_instruction = Some(instruction.clone());
        self.send_instruction(instruction).await;
        self.active_operation_mode = Some(next);
        self.next_operation_mode = None;
    }

    /// Seconds the pending transition stays blocked, 0 when clear. Expired
    /// timers are removed lazily; the first still-running blocking timer
    /// found wins. Timers missing from the catalog cannot block.
    pub(crate) fn check_timer_block(&mut self) -> u64 {
        let (active_id, next_id) = match (&self.active_operation_mode, &self.next_operation_mode) {
            (Some(active), Some(next)) => (active.id.clone(), next.id.clone()),
            _ => return 0,
        };
        if active_id == next_id {
            return 0;
        }

        let mut expired: Vec<String> = Vec::new();
        if let Some(description) = &self.system_description {
            if let Some(edge) = description.transition(&active_id, &next_id) {
                for timer_id in &edge.blocking_timers {
                    let started = match self.running_timers.get(timer_id) {
                        Some(instant) => *instant,
                        None => continue,
                    };
                    let timer = match description.timer(timer_id) {
                        Some(timer) => timer,
                        None => continue,
                    };

                    let elapsed = started.elapsed();
                    let duration = timer.as_duration();
                    if elapsed >= duration {
                        expired.push(timer_id.clone());
                    } else {
                        let remaining = (duration - elapsed).as_secs_f64().round() as u64;
                        warn!(
                            "[S2] Timer '{}' is preventing {} from transitioning '{}' -> '{}' ({}s remaining)",
                            timer.label(),
                            self.unique_id(),
                            active_id,
                            next_id,
                            remaining
                        );
                        return remaining;
                    }
                }
            }
        }

        for timer_id in expired {
            self.running_timers.remove(&timer_id);
        }
        0
    }
}

// --------------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::s2::transport::testing::RecordingBus;
    use crate::handlers::s2::transport::RmDescriptor;
    use crate::models::phase_models::PhasePower;
    use crate::models::s2_models::{CommodityQuantity, OmbcTimer, OmbcTransition, PowerRange, S2Message};
    use crate::models::system_models::SystemType;
    use std::sync::Arc;

    fn mode(id: &str, watts: f64) -> OmbcOperationMode {
        OmbcOperationMode {
            id: id.to_string(),
            diagnostic_label: Some(id.to_string()),
            power_ranges: vec![PowerRange {
                start_of_range: watts,
                end_of_range: watts,
                commodity_quantity: CommodityQuantity::ElectricPowerL1,
            }],
            abnormal_condition_only: false,
        }
    }

    fn edge(from: &str, to: &str, blocking: &[&str], starting: &[&str]) -> OmbcTransition {
        OmbcTransition {
            id: format!("{}->{}", from, to),
            from: from.to_string(),
            to: to.to_string(),
            start_timers: starting.iter().map(|s| s.to_string()).collect(),
            blocking_timers: blocking.iter().map(|s| s.to_string()).collect(),
            transition_costs: None,
            transition_duration: None,
            abnormal_condition_only: false,
        }
    }

    fn timer(id: &str, duration_ms: u64) -> OmbcTimer {
        OmbcTimer { id: id.to_string(), diagnostic_label: None, duration: duration_ms }
    }

    /// Mirrors receipt-time processing: operation modes sorted most expensive first.
    fn description(
        mut modes: Vec<OmbcOperationMode>,
        transitions: Vec<OmbcTransition>,
        timers: Vec<OmbcTimer>,
    ) -> OmbcSystemDescription {
        modes.sort_by(|a, b| b.max_power().partial_cmp(&a.max_power()).unwrap());
        OmbcSystemDescription {
            message_id: "sd-1".to_string(),
            valid_from: Utc::now(),
            operation_modes: modes,
            transitions,
            timers,
        }
    }

    fn ombc_session(
        bus: Arc<RecordingBus>,
        desc: OmbcSystemDescription,
        active_id: &str,
        class: ConsumerClass,
    ) -> ConsumerSession {
        let descriptor = RmDescriptor { index: 0, priority: 10, consumer_class: class };
        let mut session = ConsumerSession::new("com.acme.boiler", 1, &descriptor, bus);
        session.active_control_type = Some(ControlType::OperationModeBasedControl);
        session.active_operation_mode =
            desc.operation_modes.iter().find(|m| m.id == active_id).cloned();
        session.system_description = Some(desc);
        session
    }

    fn sent_instructions(bus: &RecordingBus) -> Vec<OmbcInstruction> {
        bus.sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                S2Message::OmbcInstruction(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    fn overhead(l1: f64, reservation: f64, system_type: SystemType) -> SolarOverhead {
        SolarOverhead::new(PhasePower::new(l1, 0.0, 0.0, 0.0), reservation, 0.0, 4000.0, system_type)
    }

    #[tokio::test]
    async fn surplus_turns_a_single_phase_consumer_on() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-off", 0.0), mode("om-on", 1400.0)],
            vec![edge("om-off", "om-on", &[], &[]), edge("om-on", "om-off", &[], &[])],
            vec![],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Secondary);
        let mut ledger = overhead(1500.0, 0.0, SystemType::GridConnected1Phase);

        session.self_assign(&mut ledger).unwrap();
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-on");
        assert!((ledger.remaining().l1 - 100.0).abs() < 1e-6);
        assert!(session.is_active_ems_control);

        session.commit().await;
        let instructions = sent_instructions(&bus);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].operation_mode_id, "om-on");
        assert_eq!(instructions[0].operation_mode_factor, 1.0);
        assert!(!instructions[0].abnormal_condition);
        assert_eq!(session.active_operation_mode.as_ref().unwrap().id, "om-on");
    }

    #[tokio::test]
    async fn reservation_keeps_a_secondary_consumer_off() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-off", 0.0), mode("om-on", 1400.0)],
            vec![edge("om-off", "om-on", &[], &[]), edge("om-on", "om-off", &[], &[])],
            vec![],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Secondary);
        let mut ledger = overhead(1500.0, 1600.0, SystemType::GridConnected1Phase);

        session.self_assign(&mut ledger).unwrap();

        // The cheapest reachable mode is the active one; no instruction goes out.
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-off");
        assert!((ledger.remaining().l1 - 1500.0).abs() < 1e-6);

        session.commit().await;
        assert!(sent_instructions(&bus).is_empty());
        assert_eq!(session.active_operation_mode.as_ref().unwrap().id, "om-off");
    }

    #[tokio::test]
    async fn primary_consumers_run_through_the_reservation() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-off", 0.0), mode("om-on", 1400.0)],
            vec![edge("om-off", "om-on", &[], &[]), edge("om-on", "om-off", &[], &[])],
            vec![],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Primary);
        let mut ledger = overhead(1500.0, 1600.0, SystemType::GridConnected1Phase);

        session.self_assign(&mut ledger).unwrap();

        // 100 W of genuine surplus remain, above the 50 W flapping guard.
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-on");
        session.commit().await;
        assert_eq!(sent_instructions(&bus).len(), 1);
    }

    #[tokio::test]
    async fn shrinking_surplus_steps_down_to_the_affordable_mode() {
        // off <-> low <-> high chain, active high, 600 W left. "low" is the
        // most expensive affordable reachable mode; the blocking timer on
        // low->high is irrelevant for the high->low edge.
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-off", 0.0), mode("om-low", 500.0), mode("om-high", 2000.0)],
            vec![
                edge("om-off", "om-low", &[], &[]),
                edge("om-low", "om-off", &[], &[]),
                edge("om-low", "om-high", &["t-warm"], &[]),
                edge("om-high", "om-low", &[], &["t-warm"]),
            ],
            vec![timer("t-warm", 300_000)],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-high", ConsumerClass::Secondary);
        session.running_timers.insert("t-warm".to_string(), Instant::now());
        let mut ledger = overhead(600.0, 0.0, SystemType::GridConnected1Phase);

        session.self_assign(&mut ledger).unwrap();
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-low");
        assert_eq!(session.power_claim.unwrap().total(), 500.0);

        session.commit().await;
        let instructions = sent_instructions(&bus);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].operation_mode_id, "om-low");
    }

    #[tokio::test]
    async fn blocked_ramp_down_keeps_the_prior_claim_pinned() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-low", 300.0), mode("om-high", 1000.0)],
            vec![
                edge("om-low", "om-high", &[], &[]),
                edge("om-high", "om-low", &["t-cool"], &[]),
            ],
            vec![timer("t-cool", 600_000)],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-high", ConsumerClass::Secondary);
        session.running_timers.insert("t-cool".to_string(), Instant::now());
        session.power_claim = Some(PhasePower::new(1000.0, 0.0, 0.0, 0.0));

        let mut ledger = overhead(500.0, 0.0, SystemType::GridConnected1Phase);
        session.self_assign(&mut ledger).unwrap();

        // The proposal stands, but the claim reverts to the prior value and
        // the difference is taken back out of the ledger.
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-low");
        assert_eq!(session.power_claim.unwrap().total(), 1000.0);
        assert!((ledger.remaining().l1 - (-500.0)).abs() < 1e-6);

        // And no instruction leaves while the timer runs.
        session.commit().await;
        assert!(sent_instructions(&bus).is_empty());
        assert_eq!(session.active_operation_mode.as_ref().unwrap().id, "om-high");
    }

    #[tokio::test]
    async fn expired_blocking_timers_are_removed_and_release_the_transition() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-low", 300.0), mode("om-high", 1000.0)],
            vec![
                edge("om-low", "om-high", &[], &[]),
                edge("om-high", "om-low", &["t-cool"], &[]),
            ],
            vec![timer("t-cool", 0)],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-high", ConsumerClass::Secondary);
        session.running_timers.insert("t-cool".to_string(), Instant::now());

        let mut ledger = overhead(400.0, 0.0, SystemType::GridConnected1Phase);
        session.self_assign(&mut ledger).unwrap();
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-low");

        session.commit().await;
        assert_eq!(sent_instructions(&bus).len(), 1);
        assert!(session.running_timers.is_empty());
        assert_eq!(session.active_operation_mode.as_ref().unwrap().id, "om-low");
    }

    #[tokio::test]
    async fn instructions_start_the_edge_timers() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-off", 0.0), mode("om-on", 800.0)],
            vec![
                edge("om-off", "om-on", &[], &["t-minimum-on"]),
                edge("om-on", "om-off", &["t-minimum-on"], &[]),
            ],
            vec![timer("t-minimum-on", 120_000)],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Secondary);
        let mut ledger = overhead(1000.0, 0.0, SystemType::GridConnected1Phase);

        session.self_assign(&mut ledger).unwrap();
        session.commit().await;

        assert!(session.running_timers.contains_key("t-minimum-on"));

        // The freshly started timer now blocks the way back down.
        session.next_operation_mode =
            session.system_description.as_ref().unwrap().operation_modes.iter()
                .find(|m| m.id == "om-off").cloned();
        assert!(session.check_timer_block() > 0);
    }

    #[tokio::test]
    async fn a_zero_power_fallback_is_always_found() {
        // No surplus at all and a towering reservation: the forced fallback
        // still succeeds, so the allocator never ends up without a mode.
        let bus = Arc::new(RecordingBus::new());
        let desc = description(
            vec![mode("om-off", 0.0), mode("om-on", 700.0)],
            vec![edge("om-on", "om-off", &[], &[]), edge("om-off", "om-on", &[], &[])],
            vec![],
        );
        let mut session = ombc_session(bus.clone(), desc, "om-on", ConsumerClass::Secondary);
        let mut ledger = overhead(0.0, 5000.0, SystemType::GridConnected1Phase);

        session.self_assign(&mut ledger).unwrap();
        assert_eq!(session.next_operation_mode.as_ref().unwrap().id, "om-off");
        assert!(!ledger.in_transaction());

        session.commit().await;
        assert_eq!(sent_instructions(&bus)[0].operation_mode_id, "om-off");
    }

    #[tokio::test]
    async fn sessions_without_ombc_control_are_untouched() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(vec![mode("om-off", 0.0)], vec![], vec![]);
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Secondary);
        session.active_control_type = Some(ControlType::NotControllable);

        let mut ledger = overhead(1000.0, 0.0, SystemType::GridConnected1Phase);
        session.self_assign(&mut ledger).unwrap();

        assert!(session.next_operation_mode.is_none());
        assert!((ledger.remaining().l1 - 1000.0).abs() < 1e-6);
        session.commit().await;
        assert!(sent_instructions(&bus).is_empty());
    }

    #[tokio::test]
    async fn missing_description_or_status_is_a_quiet_no_op() {
        let bus = Arc::new(RecordingBus::new());
        let desc = description(vec![mode("om-off", 0.0)], vec![], vec![]);
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Secondary);
        session.system_description = None;

        let mut ledger = overhead(1000.0, 0.0, SystemType::GridConnected1Phase);
        session.self_assign(&mut ledger).unwrap();
        assert!(session.next_operation_mode.is_none());

        // Known description but no reported operation mode yet.
        let desc = description(vec![mode("om-off", 0.0)], vec![], vec![]);
        let mut session = ombc_session(bus.clone(), desc, "om-off", ConsumerClass::Secondary);
        session.active_operation_mode = None;
        session.self_assign(&mut ledger).unwrap();
        assert!(session.next_operation_mode.is_none());
        assert!(!ledger.in_transaction());
    }
}
