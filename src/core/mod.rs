//! Core modules: configuration, persistence, collaborator ports and shared
//! primitives. The roster subsystems in `plugins` build on these.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod output;
pub mod ports;
pub mod registry;
pub mod roster;
pub mod schemas;
pub mod time;
pub mod world;
