pub mod phase_models;
pub mod s2_models;
pub mod system_models;
