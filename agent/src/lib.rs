//! hostagent: host inventory, plugin lifecycle and probe configuration
//! served over HTTP to a central manager.

pub mod api;
pub mod applications;
pub mod command;
pub mod config;
pub mod error;
pub mod files;
pub mod inventory;
pub mod plugin;
pub mod probe;
pub mod register;
pub mod resource;
pub mod service;
pub mod token;
