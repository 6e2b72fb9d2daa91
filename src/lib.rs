pub mod cli;
pub mod cobertura;
pub mod error;
pub mod ucdb;
