//! Stub back-end for targets without a webview engine.
//!
//! Keeps the portable core (channel, scripts, policy, manager) compiling
//! and testable everywhere; window creation fails at platform startup.

use crate::error::{Error, Result};
use crate::window_manager::Command;

pub struct UnsupportedPlatform {
    _private: (),
}

impl UnsupportedPlatform {
    pub fn new() -> Result<Self> {
        Err(Error::UnsupportedPlatform)
    }

    pub fn process_command(&mut self, cmd: Command) -> Result<()> {
        let _ = cmd.window_id();
        Ok(())
    }

    pub fn pump_events(&mut self) {}

    pub fn destroy_window(&mut self, _id: u32) {}
}
