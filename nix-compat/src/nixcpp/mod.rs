//! Contains code parsing some of the Nixcpp config files
//! left by Nix *on the local disk*.
//!
//! This is only for Nix' own state/config.

pub mod conf;
pub mod machines;
