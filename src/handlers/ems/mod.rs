pub mod controller;
pub mod overhead;
pub mod reservation;
