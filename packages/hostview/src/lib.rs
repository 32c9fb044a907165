//! Native OS windows with embedded webviews and a hardened, typed IPC
//! channel between the host process and the pages inside them.
//!
//! The windowing core is main-thread-confined: every UI operation becomes a
//! command on a queue that [`pump_events`] drains on the UI thread at a
//! small fixed cadence (16 ms works well).
//! Any thread may enqueue through a [`NativeWindow`] handle; the queue is
//! the only cross-thread synchronization point. Lifecycle and input events
//! thread back to host callbacks in the same tick that the engine reports
//! them.
//!
//! The typed [`Channel`](channel::Channel) layers schema-validated,
//! origin-filtered, rate-limited messaging over the raw bridge that the
//! document-start script installs into every page.
//!
//! ```no_run
//! use hostview::{Channel, ChannelOptions, NativeWindow, SchemaMap, WindowOptions};
//!
//! fn main() -> hostview::Result<()> {
//!     let window = NativeWindow::new(WindowOptions {
//!         title: "demo".into(),
//!         ..Default::default()
//!     })?;
//!     window.load_url("https://example.com")?;
//!
//!     let schemas = SchemaMap::new().with::<String>("ping");
//!     let channel = Channel::new(&window, schemas, ChannelOptions::default())?;
//!     channel.on("ping", hostview::channel::handler(|payload| {
//!         println!("page says: {payload}");
//!     }));
//!
//!     while hostview::window_count() > 0 {
//!         hostview::pump_events()?;
//!         std::thread::sleep(std::time::Duration::from_millis(16));
//!     }
//!     Ok(())
//! }
//! ```

// Without a webview back-end the platform-facing surface (host events,
// script composition, policy reads) has no native caller.
#![cfg_attr(
    not(any(target_os = "macos", target_os = "windows")),
    allow(dead_code)
)]

pub mod channel;
pub mod cookies;
mod error;
mod events;
mod options;
mod platform;
mod policy;
mod runtime;
mod script;
mod window;
mod window_manager;

pub use channel::{Channel, ChannelId, ChannelOptions, EventHandler, SchemaMap};
pub use cookies::{CookieInfo, SameSite};
pub use error::{Error, Result};
pub use events::PageLoadPhase;
pub use options::WindowOptions;
pub use runtime::{check_runtime, ensure_runtime, RuntimeInfo};
pub use script::client_script;
pub use window::{CookiesFuture, NativeWindow, UnsafeWindow};

use window_manager::{
    dispatch_host_events, drain_commands, drain_host_events, with_manager, HostEvent,
};

/// Initialize the window system eagerly. Optional — creating the first
/// [`NativeWindow`] performs the same startup lazily — but an explicit call
/// surfaces engine-unavailable errors before any window work begins.
/// Must be called on the UI thread.
pub fn init() -> Result<()> {
    with_manager(|mgr| {
        if mgr.initialized {
            return Ok(());
        }
        mgr.platform = Some(platform::Platform::new()?);
        mgr.initialized = true;
        Ok(())
    })
}

/// Number of live windows. The host loop typically keeps ticking
/// [`pump_events`] while this is non-zero.
pub fn window_count() -> usize {
    with_manager(|mgr| mgr.windows.len())
}

/// Run one pump tick: drain and execute queued commands, let the OS engine
/// dispatch its events, then deliver buffered host events to the per-window
/// callbacks. Call this periodically (e.g. every 16 ms) on the UI thread to
/// keep the windows responsive. A no-op before the first window exists and
/// after the last one closes.
///
/// Callbacks run in this call's context and must not block. Commands they
/// enqueue are sampled next tick — the drain happens once, at the start, so
/// reentrant enqueueing is always safe.
///
/// A command that fails logs the error and does not stop the remaining
/// commands; the first failure is returned after the tick completes. No
/// panic or error from a host callback escapes the tick.
pub fn pump_events() -> Result<()> {
    // Phase 1: drain the queue once and extract the platform so engine
    // callbacks fired during command processing can re-enter the manager.
    let (commands, platform) = with_manager(|mgr| {
        if !mgr.initialized {
            // Discard stale commands (e.g. drop-guard closes after the last
            // window went away).
            drain_commands();
            return (Vec::new(), None);
        }
        let Some(platform) = mgr.platform.take() else {
            // Reentrant pump call from a callback; leave the queue for the
            // outer tick.
            return (Vec::new(), None);
        };
        // Cancel commands whose window record is gone. The handle's closed
        // flag is NOT the criterion here: close() sets it before enqueueing
        // the Close command, which must still reach the back-end.
        let commands: Vec<_> = drain_commands()
            .into_iter()
            .filter(|cmd| mgr.windows.contains_key(&cmd.window_id()))
            .collect();
        (commands, Some(platform))
    });

    let Some(mut platform) = platform else {
        return Ok(());
    };

    // Phase 2: execute commands FIFO. Keep going past failures; report the
    // first one after the tick.
    let mut first_err: Option<Error> = None;
    for cmd in commands {
        let id = cmd.window_id();
        let is_create = matches!(cmd, window_manager::Command::CreateWindow { .. });
        if let Err(e) = platform.process_command(cmd) {
            tracing::warn!(window_id = id, "command failed: {e}");
            if is_create {
                // Fatal at creation: the handle never becomes usable.
                // Unwind the registry record through the normal close path.
                window_manager::push_host_event(HostEvent::Closed { id });
            }
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }

    // Phase 3: one non-blocking OS event-loop pass so queued engine
    // callbacks fire.
    platform.pump_events();

    // Phase 4: reap native resources of engine-closed windows, then deliver
    // buffered events with the handler map extracted (callbacks may
    // re-enter the manager to register handlers or create windows).
    let events = drain_host_events();
    for event in &events {
        if let HostEvent::Closed { id } = event {
            platform.destroy_window(*id);
        }
    }
    with_manager(|mgr| {
        mgr.platform = Some(platform);
    });

    let mut handlers = with_manager(|mgr| std::mem::take(&mut mgr.event_handlers));
    dispatch_host_events(events, &mut handlers);

    with_manager(|mgr| {
        // Registrations made during dispatch win over the extracted ones.
        for (id, old) in handlers {
            if !mgr.windows.contains_key(&id) {
                continue;
            }
            match mgr.event_handlers.entry(id) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    e.get_mut().merge_missing(old);
                }
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(old);
                }
            }
        }
        // The pump stops when the last window closes; the next window
        // creation starts a fresh platform.
        if mgr.windows.is_empty() && mgr.initialized {
            mgr.platform = None;
            mgr.initialized = false;
        }
    });

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
