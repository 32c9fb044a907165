//! Platform webview back-ends.
//!
//! Each back-end is a capability set, not an inheritance hierarchy: the
//! same inherent methods (`new`, `process_command`, `pump_events`,
//! `destroy_window`) implemented per OS, selected statically at compile
//! time by target. Host-bound information flows exclusively through the
//! manager's pending event buffer.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacosPlatform as Platform;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsPlatform as Platform;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
mod unsupported;
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub use unsupported::UnsupportedPlatform as Platform;
