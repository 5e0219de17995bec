//! Configuration, logging and program entry.

pub mod configuration;
pub mod logger;
