pub mod bridge;
pub mod ems;
pub mod s2;
