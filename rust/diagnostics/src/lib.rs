//! Faultline VM crash diagnostics.

pub mod call_stack;
pub mod debug_info;
pub mod image;
pub mod monitor;
