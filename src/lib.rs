//! Passive scanner for the battery and case status that AirPods broadcast in
//! Apple proximity pairing advertisements.

pub mod config;
pub mod device;
pub mod manager;
pub mod mqtt;
pub mod protocol;
pub mod report;
pub mod scanner;
pub mod watcher;
