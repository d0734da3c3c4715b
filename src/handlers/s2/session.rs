use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::handlers::s2::transport::{RmDescriptor, S2Bus};
use crate::models::phase_models::{Phase, PhasePower};
use crate::models::s2_models::{
    new_message_id, CommodityQuantity, ControlType, Envelope, Handshake, HandshakeResponse,
    OmbcInstruction, OmbcOperationMode, OmbcStatus, OmbcSystemDescription, PowerMeasurement,
    ReceptionStatus, ReceptionStatusValues, ResourceManagerDetails, S2Message, SelectControlType,
    S2_VERSION,
};
use crate::models::system_models::ConsumerClass;

// --------------------------------------------------------------------------------------------------------------
// Per-consumer S2 session: connection handshake, keep-alive, message dispatch and reception-status
// bookkeeping. The OMBC allocation half of the session lives in ombc.rs.

/// Keep-alive interval announced at Connect time.
pub const KEEP_ALIVE_INTERVAL_S: u32 = 30;

/// Pending-reply entries older than this are dropped; an RM that never
/// acknowledges must not grow the table without bound.
const REPLY_EXPIRY: Duration = Duration::from_secs(60);

/// Where the session stands in the S2 connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Connect succeeded, waiting for the RM's handshake.
    Connecting,
    HandshakeReceived,
    DetailsReceived,
    ControlSelected,
    /// An operation-mode status arrived; the session is fully live.
    Operating,
    /// The RM offered nothing we can control; stays connected, never managed.
    Failed,
}

/// What to do once the RM acknowledges one of our messages with OK.
#[derive(Debug, Clone)]
enum PendingReply {
    ControlTypeSelected(ControlType),
}

struct PendingEntry {
    registered: Instant,
    action: PendingReply,
}

// --------------------------------------------------------------------------------------------------------------

pub struct ConsumerSession {
    service: String,
    #[allow(dead_code)]
    instance: u32,
    unique_id: String,
    pub priority: i32,
    pub consumer_class: ConsumerClass,
    bus: Arc<dyn S2Bus>,

    state: ConnectionState,
    keep_alive_missed: u32,
    next_keep_alive: Option<Instant>,
    pending_replies: HashMap<String, PendingEntry>,

    pub(crate) rm_details: Option<ResourceManagerDetails>,
    pub(crate) active_control_type: Option<ControlType>,

    // OMBC sub-state. The system description is immutable after receipt, with
    // its operation modes sorted most expensive first.
    pub(crate) system_description: Option<OmbcSystemDescription>,
    pub(crate) active_operation_mode: Option<OmbcOperationMode>,
    pub(crate) next_operation_mode: Option<OmbcOperationMode>,
    pub(crate) active_instruction: Option<OmbcInstruction>,
    pub(crate) running_timers: HashMap<String, Instant>,

    // Power tracking.
    pub is_active_ems_control: bool,
    pub(crate) power_claim: Option<PhasePower>,
    pub(crate) power_request: PhasePower,
    pub(crate) current_power: PhasePower,
    current_counter: PhasePower,
    sample_timestamps: [Option<DateTime<Utc>>; 3],
    last_pop: Option<DateTime<Utc>>,
}

impl ConsumerSession {
    pub fn new(service: &str, instance: u32, descriptor: &RmDescriptor, bus: Arc<dyn S2Bus>) -> Self {
        Self {
            service: service.to_string(),
            instance,
            unique_id: format!("{}_RM{}", service, descriptor.index),
            priority: descriptor.priority,
            consumer_class: descriptor.consumer_class,
            bus,
            state: ConnectionState::Disconnected,
            keep_alive_missed: 0,
            next_keep_alive: None,
            pending_replies: HashMap::new(),
            rm_details: None,
            active_control_type: None,
            system_description: None,
            active_operation_mode: None,
            next_operation_mode: None,
            active_instruction: None,
            running_timers: HashMap::new(),
            is_active_ems_control: false,
            power_claim: None,
            power_request: PhasePower::default(),
            current_power: PhasePower::default(),
            current_counter: PhasePower::default(),
            sample_timestamps: [None; 3],
            last_pop: None,
        }
    }

    /// Stable id naming this session in every protocol message.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connected in any form; uninitialized sessions are retried on the 35 s timer.
    pub fn is_initialized(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    /// Whether the scheduler may assign power to this session.
    pub fn is_controllable(&self) -> bool {
        matches!(self.active_control_type, Some(ct) if ct != ControlType::NotControllable)
    }

    fn handshaken(&self) -> bool {
        !matches!(self.state, ConnectionState::Disconnected | ConnectionState::Connecting)
    }

    // ----------------------------------------------------------------------------------------------------------
    // Connection lifecycle

    /// Establish the S2 connection. On refusal or transport failure the
    /// session stays Disconnected and the retry timer tries again.
    pub async fn begin(&mut self) {
        match self.bus.connect(&self.unique_id, KEEP_ALIVE_INTERVAL_S).await {
            Ok(true) => {
                info!(
                    "[S2] Connection to {} established with keep-alive {}s",
                    self.unique_id, KEEP_ALIVE_INTERVAL_S
                );
                self.state = ConnectionState::Connecting;
                self.keep_alive_missed = 0;
                self.next_keep_alive =
                    Some(Instant::now() + Duration::from_secs(KEEP_ALIVE_INTERVAL_S as u64));
            }
            Ok(false) => {
                warn!("[S2] Connection to {} refused; will retry", self.unique_id);
                self.end();
            }
            Err(e) => {
                warn!("[S2] Connection to {} failed ({}); will retry", self.unique_id, e);
                self.end();
            }
        }
    }

    /// Tear the session down: called on device removal, disconnect signal or
    /// keep-alive timeout. Pending replies are abandoned and expire later.
    pub fn end(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.is_active_ems_control = false;
        self.next_keep_alive = None;
        info!("[S2] Session is now uninitialized: {}", self.unique_id);
    }

    /// Drive the keep-alive from the 1 Hz tick. Two consecutive misses
    /// (refusals or transport errors) end the session.
    pub async fn poll_keep_alive(&mut self, now: Instant) {
        self.expire_pending_replies(now);

        let due = match self.next_keep_alive {
            Some(deadline) if self.is_initialized() => now >= deadline,
            _ => false,
        };
        if !due {
            return;
        }
        self.next_keep_alive = Some(now + Duration::from_secs(KEEP_ALIVE_INTERVAL_S as u64));

        match self.bus.keep_alive(&self.unique_id).await {
            Ok(true) => self.keep_alive_missed = 0,
            Ok(false) | Err(_) => self.keep_alive_missed += 1,
        }

        if self.keep_alive_missed >= 2 {
            warn!("[S2] Keep-alive MISSED for {} ({})", self.unique_id, self.keep_alive_missed);
            self.end();
        }
    }

    fn expire_pending_replies(&mut self, now: Instant) {
        self.pending_replies
            .retain(|_, entry| now.duration_since(entry.registered) < REPLY_EXPIRY);
    }

    // ----------------------------------------------------------------------------------------------------------
    // Inbound dispatch

    /// Handle one S2 envelope addressed to this session.
    pub async fn handle_message(&mut self, payload: &str) {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("[S2] Unparseable envelope from {}: {}", self.unique_id, e);
                return;
            }
        };

        // Until the handshake went through, nothing but a handshake is admitted.
        if envelope.message_type != "Handshake" && !self.handshaken() {
            warn!(
                "[S2] Received {} from {} before handshake completion",
                envelope.message_type, self.unique_id
            );
            if let Some(id) = &envelope.message_id {
                self.send_reception(
                    ReceptionStatusValues::TemporaryError,
                    id.clone(),
                    Some("Connection not yet established."),
                )
                .await;
            }
            return;
        }

        match envelope.message_type.as_str() {
            "Handshake" | "ResourceManagerDetails" | "OMBC.SystemDescription" | "OMBC.Status"
            | "PowerMeasurement" | "ReceptionStatus" => {
                let message = match S2Message::from_json(payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("[S2] Malformed {} from {}: {}", envelope.message_type, self.unique_id, e);
                        if let Some(id) = &envelope.message_id {
                            self.send_reception(
                                ReceptionStatusValues::InvalidData,
                                id.clone(),
                                Some("Message does not match the S2 schema."),
                            )
                            .await;
                        }
                        return;
                    }
                };

                match message {
                    S2Message::Handshake(m) => self.on_handshake(m).await,
                    S2Message::ResourceManagerDetails(m) => self.on_rm_details(m).await,
                    S2Message::OmbcSystemDescription(m) => self.on_system_description(m).await,
                    S2Message::OmbcStatus(m) => self.on_ombc_status(m).await,
                    S2Message::PowerMeasurement(m) => self.on_power_measurement(m).await,
                    S2Message::ReceptionStatus(m) => self.on_reception_status(m),
                    _ => {}
                }
            }
            other => {
                warn!("[S2] Received an unknown message type {} from {}", other, self.unique_id);
                if let Some(id) = &envelope.message_id {
                    self.send_reception(
                        ReceptionStatusValues::PermanentError,
                        id.clone(),
                        Some("Message type not implemented in EMS."),
                    )
                    .await;
                }
            }
        }
    }

    /// The RM dropped us. The session ends and the retry timer reconnects.
    pub fn on_disconnect(&mut self, reason: &str) {
        info!("[S2] Received Disconnect from {}: {}", self.unique_id, reason);
        self.end();
    }

    // ----------------------------------------------------------------------------------------------------------
    // Message handlers

    async fn on_handshake(&mut self, message: Handshake) {
        info!("[S2] Received handshake from {}", self.unique_id);

        if message.supported_protocol_versions.iter().any(|v| v == S2_VERSION) {
            self.send_reception(ReceptionStatusValues::Ok, message.message_id, None).await;

            let response = HandshakeResponse {
                message_id: new_message_id(),
                selected_protocol_version: S2_VERSION.to_string(),
            };
            self.send(S2Message::HandshakeResponse(response), None).await;

            if self.state == ConnectionState::Connecting {
                self.state = ConnectionState::HandshakeReceived;
            }
        } else {
            warn!(
                "[S2] {} supports versions {:?}; expected {}",
                self.unique_id, message.supported_protocol_versions, S2_VERSION
            );
            self.send_reception(ReceptionStatusValues::InvalidContent, message.message_id, None)
                .await;
        }
    }

    async fn on_rm_details(&mut self, message: ResourceManagerDetails) {
        if message.available_control_types.is_empty() {
            self.send_reception(
                ReceptionStatusValues::TemporaryError,
                message.message_id.clone(),
                Some("No ControlType provided."),
            )
            .await;
            self.rm_details = Some(message);
            return;
        }

        let control_types = message.available_control_types.clone();
        let message_id = message.message_id.clone();
        self.rm_details = Some(message);
        if self.state == ConnectionState::HandshakeReceived {
            self.state = ConnectionState::DetailsReceived;
        }

        // Selection policy: an RM only offering NotControllable does not want
        // to be managed right now; otherwise OMBC is the preferred mode.
        if control_types == [ControlType::NotControllable] {
            warn!("[S2] {} only offered NOT_CONTROLABLE, accepting", self.unique_id);
            self.send_reception(ReceptionStatusValues::Ok, message_id, None).await;
            self.select_control_type(ControlType::NotControllable).await;
        } else if control_types.contains(&ControlType::OperationModeBasedControl) {
            info!("[S2] {} offered OMBC, accepting", self.unique_id);
            self.send_reception(ReceptionStatusValues::Ok, message_id, None).await;
            self.select_control_type(ControlType::OperationModeBasedControl).await;
        } else {
            error!(
                "[S2] {} offered no compatible control type: {:?}",
                self.unique_id, control_types
            );
            self.send_reception(
                ReceptionStatusValues::PermanentError,
                message_id,
                Some("No supported ControlType offered."),
            )
            .await;
            self.state = ConnectionState::Failed;
        }
    }

    /// Ask the RM to switch to the given control type. The type only becomes
    /// active once the RM acknowledges the request with OK.
    async fn select_control_type(&mut self, control_type: ControlType) {
        let message_id = new_message_id();
        let request = SelectControlType { message_id: message_id.clone(), control_type };
        self.send(
            S2Message::SelectControlType(request),
            Some((message_id, PendingReply::ControlTypeSelected(control_type))),
        )
        .await;
    }

    async fn on_system_description(&mut self, mut message: OmbcSystemDescription) {
        // Most expensive mode first; the allocator probes them in this order
        // and treats the last eligible one as the forced fallback.
        message
            .operation_modes
            .sort_by(|a, b| b.max_power().partial_cmp(&a.max_power()).unwrap_or(std::cmp::Ordering::Equal));

        let message_id = message.message_id.clone();
        self.system_description = Some(message);
        self.send_reception(ReceptionStatusValues::Ok, message_id, None).await;
    }

    async fn on_ombc_status(&mut self, message: OmbcStatus) {
        if self.system_description.is_none() {
            self.send_reception(
                ReceptionStatusValues::TemporaryError,
                message.message_id,
                Some("No OMBC.SystemDescription received yet."),
            )
            .await;
            return;
        }

        let mode = self.system_description.as_ref().and_then(|description| {
            description
                .operation_modes
                .iter()
                .find(|m| m.id == message.active_operation_mode_id)
                .cloned()
        });

        match mode {
            Some(mode) => {
                info!("[S2] {} reported operation mode '{}'", self.unique_id, mode.label());

                // An initially consuming mode means the load already runs on
                // our budget; take over control right away.
                if mode.power_ranges.first().map(|r| r.end_of_range > 0.0).unwrap_or(false) {
                    self.is_active_ems_control = true;
                }

                self.active_operation_mode = Some(mode);
                if self.state == ConnectionState::ControlSelected {
                    self.state = ConnectionState::Operating;
                }
                self.send_reception(ReceptionStatusValues::Ok, message.message_id, None).await;
            }
            None => {
                self.send_reception(
                    ReceptionStatusValues::TemporaryError,
                    message.message_id.clone(),
                    Some(&format!("Unknown operationmode-id: {}", message.active_operation_mode_id)),
                )
                .await;
            }
        }
    }

    async fn on_power_measurement(&mut self, message: PowerMeasurement) {
        // Only credit consumption while the consumer actually runs on our
        // budget; a manually running load is not ours to account.
        if self.is_active_ems_control {
            for value in &message.values {
                match value.commodity_quantity {
                    CommodityQuantity::ElectricPower3PhaseSymmetric => {
                        for commodity in [
                            CommodityQuantity::ElectricPowerL1,
                            CommodityQuantity::ElectricPowerL2,
                            CommodityQuantity::ElectricPowerL3,
                        ] {
                            self.integrate_sample(commodity, value.value / 3.0, message.measurement_timestamp);
                        }
                    }
                    c if c.is_electric() => {
                        self.integrate_sample(c, value.value, message.measurement_timestamp);
                    }
                    _ => {}
                }
            }
        } else {
            self.current_power = PhasePower::default();
        }

        self.send_reception(ReceptionStatusValues::Ok, message.message_id, None).await;
    }

    /// Left-edge energy integration: the previous sample's power is assumed to
    /// have held for the whole interval between the two timestamps.
    fn integrate_sample(&mut self, commodity: CommodityQuantity, value: f64, timestamp: DateTime<Utc>) {
        let (index, phase) = match commodity {
            CommodityQuantity::ElectricPowerL1 => (0, Phase::L1),
            CommodityQuantity::ElectricPowerL2 => (1, Phase::L2),
            CommodityQuantity::ElectricPowerL3 => (2, Phase::L3),
            _ => return,
        };

        // On the very first sample there is nothing to integrate against yet.
        if let Some(previous) = self.sample_timestamps[index] {
            let duration_s = (timestamp - previous).num_milliseconds() as f64 / 1000.0;
            let consumption_kwh = self.current_power.get(phase) * duration_s / 3600.0 / 1000.0;
            self.current_counter.add(phase, consumption_kwh);
        }

        self.current_power.set(phase, value);
        self.sample_timestamps[index] = Some(timestamp);
    }

    fn on_reception_status(&mut self, message: ReceptionStatus) {
        // Unsolicited acknowledgements are silently ignored.
        let Some(entry) = self.pending_replies.remove(&message.subject_message_id) else {
            return;
        };

        if message.status != ReceptionStatusValues::Ok {
            warn!(
                "[S2] {} rejected message {} with {:?} ({})",
                self.unique_id,
                message.subject_message_id,
                message.status,
                message.diagnostic_label.as_deref().unwrap_or("-")
            );
            return;
        }

        match entry.action {
            PendingReply::ControlTypeSelected(control_type) => {
                debug!("[S2] {} acknowledged control type {:?}", self.unique_id, control_type);
                self.active_control_type = Some(control_type);
                if self.state == ConnectionState::DetailsReceived {
                    self.state = ConnectionState::ControlSelected;
                }
            }
        }
    }

    // ----------------------------------------------------------------------------------------------------------
    // Outbound helpers

    async fn send_reception(
        &mut self,
        status: ReceptionStatusValues,
        subject_message_id: String,
        diagnostic: Option<&str>,
    ) {
        let reception = ReceptionStatus {
            subject_message_id,
            status,
            diagnostic_label: diagnostic.map(str::to_string),
        };
        self.send(S2Message::ReceptionStatus(reception), None).await;
    }

    /// Serialise and send one message. When a pending action is given, it is
    /// registered under the outbound message id and runs once the RM
    /// acknowledges with OK; on send failure the registration is dropped.
    async fn send(&mut self, message: S2Message, pending: Option<(String, PendingReply)>) {
        let payload = match message.to_json() {
            Ok(p) => p,
            Err(e) => {
                error!("[S2] Failed to serialise a message for {}: {}", self.unique_id, e);
                return;
            }
        };

        if let Some((message_id, action)) = pending {
            self.pending_replies
                .insert(message_id.clone(), PendingEntry { registered: Instant::now(), action });

            if let Err(e) = self.bus.send_message(&self.unique_id, &payload).await {
                error!("[S2] Error sending an S2 message to {}: {}", self.unique_id, e);
                error!("[S2] Message was: {}", payload);
                self.pending_replies.remove(&message_id);
            }
        } else if let Err(e) = self.bus.send_message(&self.unique_id, &payload).await {
            error!("[S2] Error sending an S2 message to {}: {}", self.unique_id, e);
            error!("[S2] Message was: {}", payload);
        }
    }

    pub(crate) async fn send_instruction(&mut self, instruction: OmbcInstruction) {
        self.send(S2Message::OmbcInstruction(instruction), None).await;
    }

    // ----------------------------------------------------------------------------------------------------------
    // Power statistics

    /// Momentary power and the energy accumulated since the previous call;
    /// the counter resets on every pop. Consumers that never report power
    /// measurements get their counters estimated from the approved request.
    pub fn pop_powerstats(&mut self, now: DateTime<Utc>) -> (PhasePower, PhasePower) {
        if let Some(details) = &self.rm_details {
            if details.provides_power_measurement_types.is_empty() {
                if let Some(last) = self.last_pop {
                    let duration_s = (now - last).num_milliseconds() as f64 / 1000.0;
                    for phase in Phase::AC {
                        let consumption_kwh =
                            self.power_request.get(phase) * duration_s / 3600.0 / 1000.0;
                        self.current_counter.set(phase, consumption_kwh);
                    }
                }
            }
        }

        let result = (self.current_power, self.current_counter);
        self.current_counter = PhasePower::default();
        self.last_pop = Some(now);
        result
    }
}

// --------------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::s2::transport::testing::RecordingBus;
    use chrono::TimeZone;

    fn descriptor() -> RmDescriptor {
        RmDescriptor { index: 0, priority: 10, consumer_class: ConsumerClass::Secondary }
    }

    fn session(bus: Arc<RecordingBus>) -> ConsumerSession {
        ConsumerSession::new("com.acme.heatpump", 1, &descriptor(), bus)
    }

    async fn handshaken_session(bus: Arc<RecordingBus>) -> ConsumerSession {
        let mut s = session(bus.clone());
        s.begin().await;
        s.handle_message(&handshake_json("h-1")).await;
        bus.clear_sent();
        s
    }

    fn handshake_json(id: &str) -> String {
        format!(
            r#"{{"message_type":"Handshake","message_id":"{}","role":"RM","supported_protocol_versions":["{}"]}}"#,
            id, S2_VERSION
        )
    }

    fn details_json(id: &str, control_types: &str) -> String {
        format!(
            r#"{{"message_type":"ResourceManagerDetails","message_id":"{}","resource_id":"rm-0",
                 "roles":[{{"role":"ENERGY_CONSUMER","commodity":"ELECTRICITY"}}],
                 "instruction_processing_delay":0,
                 "available_control_types":{},
                 "provides_forecast":false,
                 "provides_power_measurement_types":["ELECTRIC.POWER.L1"]}}"#,
            id, control_types
        )
    }

    fn reception_statuses(bus: &RecordingBus) -> Vec<ReceptionStatus> {
        bus.sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                S2Message::ReceptionStatus(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn unique_id_combines_service_and_rm_index() {
        let bus = Arc::new(RecordingBus::new());
        let s = session(bus);
        assert_eq!(s.unique_id(), "com.acme.heatpump_RM0");
    }

    #[tokio::test]
    async fn refused_connect_leaves_the_session_uninitialized() {
        let bus = Arc::new(RecordingBus::new());
        bus.script_connect(&[Ok(false)]);

        let mut s = session(bus);
        s.begin().await;
        assert!(!s.is_initialized());

        // The retry succeeds with the default scripted reply.
        s.begin().await;
        assert!(s.is_initialized());
        assert_eq!(s.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn non_handshake_messages_bounce_until_handshaken() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = session(bus.clone());
        s.begin().await;

        s.handle_message(&details_json("d-1", "[\"OPERATION_MODE_BASED_CONTROL\"]")).await;

        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].subject_message_id, "d-1");
        assert_eq!(receptions[0].status, ReceptionStatusValues::TemporaryError);
        assert!(s.rm_details.is_none());
        assert_eq!(s.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn matching_handshake_is_acknowledged_and_answered() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = session(bus.clone());
        s.begin().await;

        s.handle_message(&handshake_json("h-1")).await;

        let sent = bus.sent_messages();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            S2Message::ReceptionStatus(r) => {
                assert_eq!(r.subject_message_id, "h-1");
                assert_eq!(r.status, ReceptionStatusValues::Ok);
            }
            other => panic!("expected reception status, got {:?}", other),
        }
        match &sent[1] {
            S2Message::HandshakeResponse(h) => {
                assert_eq!(h.selected_protocol_version, S2_VERSION);
            }
            other => panic!("expected handshake response, got {:?}", other),
        }
        assert_eq!(s.state(), ConnectionState::HandshakeReceived);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected_with_invalid_content() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = session(bus.clone());
        s.begin().await;

        let old = r#"{"message_type":"Handshake","message_id":"h-2","role":"RM","supported_protocol_versions":["0.0.1-beta"]}"#;
        s.handle_message(old).await;

        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].status, ReceptionStatusValues::InvalidContent);
        assert_eq!(s.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn ombc_is_selected_once_the_rm_acknowledges() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        s.handle_message(&details_json("d-1", "[\"OPERATION_MODE_BASED_CONTROL\",\"NOT_CONTROLABLE\"]"))
            .await;

        // Details are acknowledged OK and a SelectControlType goes out.
        let sent = bus.sent_messages();
        assert_eq!(sent.len(), 2);
        let select_id = match &sent[1] {
            S2Message::SelectControlType(sel) => {
                assert_eq!(sel.control_type, ControlType::OperationModeBasedControl);
                sel.message_id.clone()
            }
            other => panic!("expected SelectControlType, got {:?}", other),
        };

        // Not active yet: the RM has not acknowledged.
        assert!(s.active_control_type.is_none());

        let ack = format!(
            r#"{{"message_type":"ReceptionStatus","subject_message_id":"{}","status":"OK"}}"#,
            select_id
        );
        s.handle_message(&ack).await;
        assert_eq!(s.active_control_type, Some(ControlType::OperationModeBasedControl));
        assert!(s.is_controllable());
        assert_eq!(s.state(), ConnectionState::ControlSelected);
    }

    #[tokio::test]
    async fn noctrl_only_rms_are_accepted_but_not_controllable() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        s.handle_message(&details_json("d-1", "[\"NOT_CONTROLABLE\"]")).await;
        let sent = bus.sent_messages();
        let select_id = match &sent[1] {
            S2Message::SelectControlType(sel) => {
                assert_eq!(sel.control_type, ControlType::NotControllable);
                sel.message_id.clone()
            }
            other => panic!("expected SelectControlType, got {:?}", other),
        };

        let ack = format!(
            r#"{{"message_type":"ReceptionStatus","subject_message_id":"{}","status":"OK"}}"#,
            select_id
        );
        s.handle_message(&ack).await;
        assert_eq!(s.active_control_type, Some(ControlType::NotControllable));
        assert!(!s.is_controllable());
    }

    #[tokio::test]
    async fn unsupported_control_types_fail_the_session_permanently() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        s.handle_message(&details_json("d-1", "[\"FILL_RATE_BASED_CONTROL\"]")).await;

        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].status, ReceptionStatusValues::PermanentError);
        assert_eq!(s.state(), ConnectionState::Failed);
        assert!(s.is_initialized()); // stays connected, just never managed
        assert!(!s.is_controllable());
    }

    #[tokio::test]
    async fn empty_control_type_list_is_a_temporary_error() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        s.handle_message(&details_json("d-1", "[]")).await;

        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].status, ReceptionStatusValues::TemporaryError);
    }

    #[tokio::test]
    async fn unknown_message_types_get_a_permanent_error() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        s.handle_message(r#"{"message_type":"FRBC.Instruction","message_id":"f-1"}"#).await;

        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].subject_message_id, "f-1");
        assert_eq!(receptions[0].status, ReceptionStatusValues::PermanentError);
    }

    #[tokio::test]
    async fn every_handled_message_produces_exactly_one_reception_status() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        let description = r#"{"message_type":"OMBC.SystemDescription","message_id":"sd-1",
            "valid_from":"2026-08-01T10:00:00Z",
            "operation_modes":[
                {"id":"om-off","diagnostic_label":"off","power_ranges":[
                    {"start_of_range":0.0,"end_of_range":0.0,"commodity_quantity":"ELECTRIC.POWER.L1"}]},
                {"id":"om-on","diagnostic_label":"on","power_ranges":[
                    {"start_of_range":1400.0,"end_of_range":1400.0,"commodity_quantity":"ELECTRIC.POWER.L1"}]}],
            "transitions":[],"timers":[]}"#;
        s.handle_message(description).await;
        let status = r#"{"message_type":"OMBC.Status","message_id":"st-1","active_operation_mode_id":"om-off"}"#;
        s.handle_message(status).await;

        let receptions = reception_statuses(&bus);
        let subjects: Vec<&str> = receptions.iter().map(|r| r.subject_message_id.as_str()).collect();
        assert_eq!(subjects, vec!["sd-1", "st-1"]);
        assert!(receptions.iter().all(|r| r.status == ReceptionStatusValues::Ok));

        // Modes ended up sorted most expensive first.
        let description = s.system_description.as_ref().unwrap();
        assert_eq!(description.operation_modes[0].id, "om-on");
        assert_eq!(description.operation_modes[1].id, "om-off");
        assert_eq!(s.active_operation_mode.as_ref().unwrap().id, "om-off");
    }

    #[tokio::test]
    async fn unknown_operation_mode_id_is_a_temporary_error() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        let description = r#"{"message_type":"OMBC.SystemDescription","message_id":"sd-1",
            "valid_from":"2026-08-01T10:00:00Z",
            "operation_modes":[{"id":"om-off","power_ranges":[
                {"start_of_range":0.0,"end_of_range":0.0,"commodity_quantity":"ELECTRIC.POWER.L1"}]}],
            "transitions":[],"timers":[]}"#;
        s.handle_message(description).await;
        bus.clear_sent();

        s.handle_message(r#"{"message_type":"OMBC.Status","message_id":"st-1","active_operation_mode_id":"bogus"}"#)
            .await;

        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].status, ReceptionStatusValues::TemporaryError);
        assert!(s.active_operation_mode.is_none());
    }

    #[tokio::test]
    async fn power_measurements_integrate_left_edge_energy() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;
        s.is_active_ems_control = true;

        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(3600);

        let m0 = format!(
            r#"{{"message_type":"PowerMeasurement","message_id":"p-0","measurement_timestamp":"{}",
                "values":[{{"commodity_quantity":"ELECTRIC.POWER.L1","value":2000.0}}]}}"#,
            t0.to_rfc3339()
        );
        let m1 = format!(
            r#"{{"message_type":"PowerMeasurement","message_id":"p-1","measurement_timestamp":"{}",
                "values":[{{"commodity_quantity":"ELECTRIC.POWER.L1","value":500.0}}]}}"#,
            t1.to_rfc3339()
        );
        s.handle_message(&m0).await;
        s.handle_message(&m1).await;

        let (power, counter) = s.pop_powerstats(t1);
        // 2000 W held for one hour = 2 kWh, left-edge; the new sample only
        // replaces the momentary power.
        assert!((counter.l1 - 2.0).abs() < 1e-9);
        assert!((power.l1 - 500.0).abs() < 1e-9);

        // Counter resets after the pop.
        let (_, counter) = s.pop_powerstats(t1);
        assert_eq!(counter.l1, 0.0);
    }

    #[tokio::test]
    async fn symmetric_measurements_split_into_thirds() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;
        s.is_active_ems_control = true;

        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let m = format!(
            r#"{{"message_type":"PowerMeasurement","message_id":"p-0","measurement_timestamp":"{}",
                "values":[{{"commodity_quantity":"ELECTRIC.POWER.3_PHASE_SYMMETRIC","value":900.0}}]}}"#,
            t0.to_rfc3339()
        );
        s.handle_message(&m).await;

        let (power, _) = s.pop_powerstats(t0);
        assert!((power.l1 - 300.0).abs() < 1e-9);
        assert!((power.l2 - 300.0).abs() < 1e-9);
        assert!((power.l3 - 300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn measurements_are_ignored_while_not_under_ems_control() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let m = format!(
            r#"{{"message_type":"PowerMeasurement","message_id":"p-0","measurement_timestamp":"{}",
                "values":[{{"commodity_quantity":"ELECTRIC.POWER.L1","value":2000.0}}]}}"#,
            t0.to_rfc3339()
        );
        s.handle_message(&m).await;

        let (power, counter) = s.pop_powerstats(t0);
        assert_eq!(power, PhasePower::default());
        assert_eq!(counter, PhasePower::default());

        // Still acknowledged OK.
        let receptions = reception_statuses(&bus);
        assert_eq!(receptions.len(), 1);
        assert_eq!(receptions[0].status, ReceptionStatusValues::Ok);
    }

    #[tokio::test]
    async fn two_missed_keep_alives_end_the_session() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = session(bus.clone());
        s.begin().await;
        assert!(s.is_initialized());

        bus.script_keep_alive(&[Ok(false), Err("rpc timeout")]);

        // Force the deadline to "due" twice.
        let now = Instant::now();
        s.next_keep_alive = Some(now);
        s.poll_keep_alive(now).await;
        assert!(s.is_initialized());

        s.next_keep_alive = Some(now);
        s.poll_keep_alive(now).await;
        assert!(!s.is_initialized());
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn one_miss_recovers_on_a_good_reply() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = session(bus.clone());
        s.begin().await;

        bus.script_keep_alive(&[Ok(false), Ok(true), Ok(false)]);

        let now = Instant::now();
        for _ in 0..3 {
            s.next_keep_alive = Some(now);
            s.poll_keep_alive(now).await;
        }
        // false, true (reset), false: never two consecutive misses.
        assert!(s.is_initialized());
    }

    #[tokio::test]
    async fn estimated_counters_come_from_the_power_request() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        // RM announces no measurement types at all.
        s.handle_message(&details_json("d-1", "[\"OPERATION_MODE_BASED_CONTROL\"]").replace(
            r#""provides_power_measurement_types":["ELECTRIC.POWER.L1"]"#,
            r#""provides_power_measurement_types":[]"#,
        ))
        .await;

        s.power_request = PhasePower::new(1000.0, 0.0, 0.0, 0.0);

        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(1800);
        s.pop_powerstats(t0);
        let (_, counter) = s.pop_powerstats(t1);

        // 1000 W requested over half an hour = 0.5 kWh.
        assert!((counter.l1 - 0.5).abs() < 1e-9);
        assert_eq!(counter.l2, 0.0);
    }

    #[tokio::test]
    async fn stale_pending_replies_expire() {
        let bus = Arc::new(RecordingBus::new());
        let mut s = handshaken_session(bus.clone()).await;

        s.handle_message(&details_json("d-1", "[\"OPERATION_MODE_BASED_CONTROL\"]")).await;
        let select_id = match &bus.sent_messages()[1] {
            S2Message::SelectControlType(sel) => sel.message_id.clone(),
            other => panic!("expected SelectControlType, got {:?}", other),
        };

        // Sweep far in the future: the entry is gone, a late ack does nothing.
        s.poll_keep_alive(Instant::now() + Duration::from_secs(120)).await;
        let ack = format!(
            r#"{{"message_type":"ReceptionStatus","subject_message_id":"{}","status":"OK"}}"#,
            select_id
        );
        s.handle_message(&ack).await;
        assert!(s.active_control_type.is_none());
    }
}
