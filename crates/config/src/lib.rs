//! Configuration module for the compressarr daemon
//!
//! Handles loading the JSON configuration file from the storage root.

pub mod config;

pub use config::*;
