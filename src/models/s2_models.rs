use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// --------------------------------------------------------------------------------------------------------------
// S2 v1 wire types. Every message is a JSON object with a top-level "message_type" discriminator
// and (except ReceptionStatus) a "message_id". Field names and enum literals match the S2 schema
// exactly; only the subset of message types this EMS handles is modelled.

/// Protocol version this EMS speaks. Handshakes offering anything else are rejected.
pub const S2_VERSION: &str = "1.0.0";

// --------------------------------------------------------------------------------------------------------------

/// Which electrical quantity a power value refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommodityQuantity {
    #[serde(rename = "ELECTRIC.POWER.L1")]
    ElectricPowerL1,
    #[serde(rename = "ELECTRIC.POWER.L2")]
    ElectricPowerL2,
    #[serde(rename = "ELECTRIC.POWER.L3")]
    ElectricPowerL3,
    #[serde(rename = "ELECTRIC.POWER.3_PHASE_SYMMETRIC")]
    ElectricPower3PhaseSymmetric,
    // Non-electric commodities are accepted on the wire but never allocated.
    #[serde(rename = "NATURAL_GAS.FLOW_RATE")]
    NaturalGasFlowRate,
    #[serde(rename = "HYDROGEN.FLOW_RATE")]
    HydrogenFlowRate,
    #[serde(rename = "HEAT.TEMPERATURE")]
    HeatTemperature,
    #[serde(rename = "HEAT.FLOW_RATE")]
    HeatFlowRate,
    #[serde(rename = "HEAT.THERMAL_POWER")]
    HeatThermalPower,
    #[serde(rename = "OIL.FLOW_RATE")]
    OilFlowRate,
}

impl CommodityQuantity {
    /// Whether this quantity maps onto one of the electrical rails the EMS allocates.
    pub fn is_electric(&self) -> bool {
        matches!(
            self,
            CommodityQuantity::ElectricPowerL1
                | CommodityQuantity::ElectricPowerL2
                | CommodityQuantity::ElectricPowerL3
                | CommodityQuantity::ElectricPower3PhaseSymmetric
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    PowerEnvelopeBasedControl,
    PowerProfileBasedControl,
    OperationModeBasedControl,
    FillRateBasedControl,
    DemandDrivenBasedControl,
    #[serde(rename = "NOT_CONTROLABLE")] // single L, as in the S2 schema
    NotControllable,
    NoSelection,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceptionStatusValues {
    InvalidData,
    InvalidMessage,
    InvalidContent,
    TemporaryError,
    PermanentError,
    Ok,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyManagementRole {
    #[serde(rename = "CEM")]
    Cem,
    #[serde(rename = "RM")]
    Rm,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleType {
    EnergyProducer,
    EnergyConsumer,
    EnergyStorage,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Commodity {
    Gas,
    Heat,
    Electricity,
    Oil,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Role {
    pub role:      RoleType,
    pub commodity: Commodity,
}

// --------------------------------------------------------------------------------------------------------------
// Common messages

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Handshake {
    pub message_id: String,
    pub role:       EnergyManagementRole,
    #[serde(default)]
    pub supported_protocol_versions: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandshakeResponse {
    pub message_id:                String,
    pub selected_protocol_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResourceManagerDetails {
    pub message_id:  String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Milliseconds the RM needs before an instruction takes effect.
    #[serde(default)]
    pub instruction_processing_delay: u64,
    pub available_control_types: Vec<ControlType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default)]
    pub provides_forecast: bool,
    #[serde(default)]
    pub provides_power_measurement_types: Vec<CommodityQuantity>,
}

impl ResourceManagerDetails {
    /// Display name for logs, falling back to the resource id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.resource_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SelectControlType {
    pub message_id:   String,
    pub control_type: ControlType,
}

/// Acknowledgement for a previously received message. Carries no message_id of
/// its own; `subject_message_id` names the message being answered.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReceptionStatus {
    pub subject_message_id: String,
    pub status:             ReceptionStatusValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_label: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct PowerValue {
    pub commodity_quantity: CommodityQuantity,
    pub value:              f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PowerMeasurement {
    pub message_id:            String,
    pub measurement_timestamp: DateTime<Utc>,
    pub values:                Vec<PowerValue>,
}

// --------------------------------------------------------------------------------------------------------------
// OMBC (Operation-Mode-Based Control) messages

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct PowerRange {
    pub start_of_range:     f64,
    pub end_of_range:       f64,
    pub commodity_quantity: CommodityQuantity,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmbcOperationMode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_label: Option<String>,
    pub power_ranges: Vec<PowerRange>,
    #[serde(default)]
    pub abnormal_condition_only: bool,
}

impl OmbcOperationMode {
    /// Label for logs, falling back to the mode id.
    pub fn label(&self) -> &str {
        self.diagnostic_label.as_deref().unwrap_or(&self.id)
    }

    /// Sort key for the most-expensive-first mode ordering.
    pub fn max_power(&self) -> f64 {
        self.power_ranges.iter().map(|r| r.end_of_range).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmbcTransition {
    pub id:   String,
    pub from: String,
    pub to:   String,
    #[serde(default)]
    pub start_timers: Vec<String>,
    #[serde(default)]
    pub blocking_timers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_costs: Option<f64>,
    /// Milliseconds, when the RM announces how long the transition takes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_duration: Option<u64>,
    #[serde(default)]
    pub abnormal_condition_only: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmbcTimer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_label: Option<String>,
    /// Milliseconds.
    pub duration: u64,
}

impl OmbcTimer {
    pub fn label(&self) -> &str {
        self.diagnostic_label.as_deref().unwrap_or(&self.id)
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.duration)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmbcSystemDescription {
    pub message_id: String,
    pub valid_from: DateTime<Utc>,
    pub operation_modes: Vec<OmbcOperationMode>,
    #[serde(default)]
    pub transitions: Vec<OmbcTransition>,
    #[serde(default)]
    pub timers: Vec<OmbcTimer>,
}

impl OmbcSystemDescription {
    /// The transition edge from one operation mode to another, if the RM declared one.
    pub fn transition(&self, from: &str, to: &str) -> Option<&OmbcTransition> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    /// Timer catalog lookup; RMs may reference timers they never described.
    pub fn timer(&self, id: &str) -> Option<&OmbcTimer> {
        self.timers.iter().find(|t| t.id == id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmbcStatus {
    pub message_id:               String,
    pub active_operation_mode_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmbcInstruction {
    pub message_id: String,
    pub id:         String,
    pub execution_time: DateTime<Utc>,
    pub operation_mode_id: String,
    pub operation_mode_factor: f64,
    #[serde(default)]
    pub abnormal_condition: bool,
}

// --------------------------------------------------------------------------------------------------------------
// Envelope handling

/// Minimal first-pass view of an incoming message: enough to dispatch on the
/// type and to answer unknown types with a reception status.
#[derive(Deserialize, Debug, Clone)]
pub struct Envelope {
    pub message_type: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Every S2 message this EMS sends or receives, tagged by "message_type".
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "message_type")]
pub enum S2Message {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    ResourceManagerDetails(ResourceManagerDetails),
    SelectControlType(SelectControlType),
    ReceptionStatus(ReceptionStatus),
    PowerMeasurement(PowerMeasurement),
    #[serde(rename = "OMBC.SystemDescription")]
    OmbcSystemDescription(OmbcSystemDescription),
    #[serde(rename = "OMBC.Status")]
    OmbcStatus(OmbcStatus),
    #[serde(rename = "OMBC.Instruction")]
    OmbcInstruction(OmbcInstruction),
}

impl S2Message {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Fresh random message/instruction id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// --------------------------------------------------------------------------------------------------------------
