//! Process-wide window registry, command queue, and pump internals.
//!
//! All mutable state lives in a single `thread_local` manager owned by the
//! UI thread. The one exception is the command queue: any thread may enqueue
//! a command, so the queue is a process-wide mutex and the only cross-thread
//! synchronization point in the crate.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cookies;
use crate::error::{Error, Result};
use crate::events::{PageLoadPhase, WindowEventHandlers};
use crate::options::WindowOptions;
use crate::policy;
use crate::window::CookieSlot;

/// Commands executed against one window during a pump tick.
/// Commands carry only value data; they never carry host callbacks.
pub enum Command {
    CreateWindow { id: u32, options: Box<WindowOptions> },
    LoadUrl { id: u32, url: String },
    LoadHtml { id: u32, html: String },
    EvaluateScript { id: u32, script: String },
    SetTitle { id: u32, title: String },
    SetSize { id: u32, width: f64, height: f64 },
    SetMinSize { id: u32, width: f64, height: f64 },
    SetMaxSize { id: u32, width: f64, height: f64 },
    SetPosition { id: u32, x: f64, y: f64 },
    SetResizable { id: u32, resizable: bool },
    SetDecorations { id: u32, decorations: bool },
    SetAlwaysOnTop { id: u32, always_on_top: bool },
    Show { id: u32 },
    Hide { id: u32 },
    Close { id: u32 },
    Focus { id: u32 },
    Maximize { id: u32 },
    Minimize { id: u32 },
    Unmaximize { id: u32 },
    Reload { id: u32 },
    GetCookies { id: u32, url: Option<String> },
    SetIcon { id: u32, path: String },
    /// Install a script that runs in every future document of the window
    /// before any page script.
    InstallDocumentStartScript { id: u32, source: String },
}

impl Command {
    /// The window this command targets.
    pub fn window_id(&self) -> u32 {
        match self {
            Command::CreateWindow { id, .. }
            | Command::LoadUrl { id, .. }
            | Command::LoadHtml { id, .. }
            | Command::EvaluateScript { id, .. }
            | Command::SetTitle { id, .. }
            | Command::SetSize { id, .. }
            | Command::SetMinSize { id, .. }
            | Command::SetMaxSize { id, .. }
            | Command::SetPosition { id, .. }
            | Command::SetResizable { id, .. }
            | Command::SetDecorations { id, .. }
            | Command::SetAlwaysOnTop { id, .. }
            | Command::Show { id }
            | Command::Hide { id }
            | Command::Close { id }
            | Command::Focus { id }
            | Command::Maximize { id }
            | Command::Minimize { id }
            | Command::Unmaximize { id }
            | Command::Reload { id }
            | Command::GetCookies { id, .. }
            | Command::SetIcon { id, .. }
            | Command::InstallDocumentStartScript { id, .. } => *id,
        }
    }
}

/// Events reported by the platform back-ends, buffered until the flush
/// phase of the pump tick delivers them to host callbacks.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Message { id: u32, body: String, source_url: String },
    Closed { id: u32 },
    Resized { id: u32, width: f64, height: f64 },
    Moved { id: u32, x: f64, y: f64 },
    Focused { id: u32 },
    Blurred { id: u32 },
    PageLoad { id: u32, phase: PageLoadPhase, url: String },
    TitleChanged { id: u32, title: String },
    Reload { id: u32 },
    NavigationBlocked { id: u32, url: String },
    Cookies { id: u32, json: String },
}

/// Maximum number of commands in the queue before new commands are dropped
/// with a warning.
const MAX_COMMAND_QUEUE: usize = 10_000;

/// Maximum entries in the pending event buffer. Events other than cookie
/// results are dropped when the buffer reaches this size; cookie results
/// always push because a future is waiting on them.
pub const MAX_PENDING_EVENTS: usize = 50_000;

/// The cross-thread command queue. Enqueueing never blocks on the UI thread;
/// the pump drains the whole queue once per tick.
static COMMAND_QUEUE: Mutex<Vec<Command>> = Mutex::new(Vec::new());

/// Enqueue a command for execution on the next pump tick. Callable from any
/// thread.
pub fn push_command(cmd: Command) {
    let mut queue = match COMMAND_QUEUE.lock() {
        Ok(q) => q,
        Err(poisoned) => poisoned.into_inner(),
    };
    if queue.len() >= MAX_COMMAND_QUEUE {
        tracing::warn!(
            len = queue.len(),
            limit = MAX_COMMAND_QUEUE,
            "command queue full; dropping command. Possible runaway loop or \
             missing pump_events() call."
        );
        return;
    }
    queue.push(cmd);
}

/// Drain every pending command. Called once at the start of a pump tick so
/// that callbacks which enqueue during the tick see their effect next tick.
pub fn drain_commands() -> Vec<Command> {
    let mut queue = match COMMAND_QUEUE.lock() {
        Ok(q) => q,
        Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::take(&mut *queue)
}

/// Per-window bookkeeping held by the manager.
pub struct WindowRecord {
    /// Shared with every clone of the window's `NativeWindow` handle.
    pub closed: Arc<AtomicBool>,
    /// FIFO of outstanding `get_cookies` futures; fulfilled in order by
    /// `HostEvent::Cookies` deliveries.
    pub cookie_waiters: VecDeque<CookieSlot>,
}

/// Global window manager state. Lives in thread_local storage on the UI
/// thread; `with_manager` is the exclusive-borrow accessor.
pub struct WindowManager {
    pub next_id: u32,
    pub windows: HashMap<u32, WindowRecord>,
    pub event_handlers: HashMap<u32, WindowEventHandlers>,
    pub initialized: bool,
    pub platform: Option<crate::platform::Platform>,
}

impl WindowManager {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            windows: HashMap::new(),
            event_handlers: HashMap::new(),
            initialized: false,
            platform: None,
        }
    }

    /// Allocate a monotonically increasing window ID and register its record.
    ///
    /// IDs are never recycled — the u32 space (~4.29 billion) is large enough
    /// that exhaustion is effectively impossible in practice. Returns an
    /// error if overflow would occur.
    pub fn allocate_id(&mut self) -> Result<(u32, Arc<AtomicBool>)> {
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| Error::Creation("window ID space exhausted (u32 overflow)".into()))?;
        let closed = Arc::new(AtomicBool::new(false));
        self.windows.insert(
            id,
            WindowRecord {
                closed: Arc::clone(&closed),
                cookie_waiters: VecDeque::new(),
            },
        );
        self.event_handlers.insert(id, WindowEventHandlers::new());
        Ok((id, closed))
    }
}

thread_local! {
    pub static MANAGER: RefCell<WindowManager> = RefCell::new(WindowManager::new());
    /// Host events reported by the back-ends during command processing and
    /// the OS event-loop pass, delivered at the end of the tick. One FIFO
    /// for every event kind keeps cross-kind ordering intact.
    static PENDING_EVENTS: RefCell<Vec<HostEvent>> = const { RefCell::new(Vec::new()) };
}

/// Execute a closure with mutable access to the global window manager.
pub fn with_manager<F, R>(f: F) -> R
where
    F: FnOnce(&mut WindowManager) -> R,
{
    MANAGER.with(|m| f(&mut m.borrow_mut()))
}

/// Buffer a host event for delivery at the end of the current pump tick.
/// Cookie results always push — a future is waiting for a response; other
/// events are dropped with a warning once the buffer is full.
pub fn push_host_event(event: HostEvent) {
    PENDING_EVENTS.with(|p| {
        let mut buf = p.borrow_mut();
        if buf.len() >= MAX_PENDING_EVENTS && !matches!(event, HostEvent::Cookies { .. }) {
            if buf.len() == MAX_PENDING_EVENTS {
                tracing::warn!(limit = MAX_PENDING_EVENTS, "event buffer full, dropping events");
            }
            return;
        }
        buf.push(event);
    });
}

/// Drain the pending event buffer.
pub fn drain_host_events() -> Vec<HostEvent> {
    PENDING_EVENTS.with(|p| std::mem::take(&mut *p.borrow_mut()))
}

/// Deliver drained host events to the per-window callbacks.
///
/// Called with the handler map temporarily extracted from the manager so
/// that callback code may re-enter `with_manager` (to register handlers or
/// create windows) without hitting the RefCell.
pub fn dispatch_host_events(
    events: Vec<HostEvent>,
    handlers: &mut HashMap<u32, WindowEventHandlers>,
) {
    for event in events {
        match event {
            HostEvent::Message { id, body, source_url } => {
                // Re-check trusted origins for deferred messages.
                if !policy::is_origin_trusted(id, &source_url) {
                    continue;
                }
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_message {
                        cb(&body, &source_url);
                    }
                }
            }
            HostEvent::Closed { id } => {
                finish_close(id, handlers);
            }
            HostEvent::Resized { id, width, height } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_resize {
                        cb(width, height);
                    }
                }
            }
            HostEvent::Moved { id, x, y } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_move {
                        cb(x, y);
                    }
                }
            }
            HostEvent::Focused { id } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_focus {
                        cb();
                    }
                }
            }
            HostEvent::Blurred { id } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_blur {
                        cb();
                    }
                }
            }
            HostEvent::PageLoad { id, phase, url } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_page_load {
                        cb(phase, &url);
                    }
                }
            }
            HostEvent::TitleChanged { id, title } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_title_changed {
                        cb(&title);
                    }
                }
            }
            HostEvent::Reload { id } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_reload {
                        cb();
                    }
                }
            }
            HostEvent::NavigationBlocked { id, url } => {
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_navigation_blocked {
                        cb(&url);
                    }
                }
            }
            HostEvent::Cookies { id, json } => {
                let waiter = with_manager(|mgr| {
                    mgr.windows
                        .get_mut(&id)
                        .and_then(|rec| rec.cookie_waiters.pop_front())
                });
                if let Some(slot) = waiter {
                    slot.fulfill(cookies::parse_cookies(&json));
                }
                if let Some(h) = handlers.get_mut(&id) {
                    if let Some(ref mut cb) = h.on_cookies {
                        cb(&json);
                    }
                }
            }
        }
    }
}

/// Final close bookkeeping for one window: fire `on_close` exactly once,
/// flag the handle closed, fail outstanding cookie futures, and drop the
/// registry record and policy. Duplicate `Closed` events (explicit close
/// racing an OS close) are no-ops because the record is gone.
fn finish_close(id: u32, handlers: &mut HashMap<u32, WindowEventHandlers>) {
    let record = with_manager(|mgr| mgr.windows.remove(&id));
    let Some(record) = record else {
        return;
    };
    record.closed.store(true, Ordering::SeqCst);
    for slot in record.cookie_waiters {
        slot.fulfill(Err(Error::WindowClosed(id)));
    }
    policy::remove_policy(id);
    if let Some(mut h) = handlers.remove(&id) {
        if let Some(ref mut cb) = h.on_close {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let (a, b) = with_manager(|mgr| {
            let (a, _) = mgr.allocate_id().unwrap();
            let (b, _) = mgr.allocate_id().unwrap();
            (a, b)
        });
        assert!(b > a);
        with_manager(|mgr| {
            mgr.windows.remove(&a);
            mgr.windows.remove(&b);
            mgr.event_handlers.remove(&a);
            mgr.event_handlers.remove(&b);
        });
    }

    #[test]
    fn queue_drains_in_fifo_order() {
        // The queue is process-wide and other tests may push concurrently,
        // so assert on this test's ids only.
        push_command(Command::Show { id: 0xC0DE11 });
        push_command(Command::Hide { id: 0xC0DE12 });
        push_command(Command::Focus { id: 0xC0DE13 });
        let drained = drain_commands();
        let ids: Vec<u32> = drained
            .iter()
            .map(|c| c.window_id())
            .filter(|id| (0xC0DE11..=0xC0DE13).contains(id))
            .collect();
        assert_eq!(ids, vec![0xC0DE11, 0xC0DE12, 0xC0DE13]);
    }

    #[test]
    fn close_fires_once_and_fails_cookie_waiters() {
        let (id, closed) = with_manager(|mgr| mgr.allocate_id().unwrap());
        let slot = CookieSlot::new();
        with_manager(|mgr| {
            mgr.windows
                .get_mut(&id)
                .unwrap()
                .cookie_waiters
                .push_back(slot.clone());
        });

        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let fired2 = std::rc::Rc::clone(&fired);
        let mut handlers = with_manager(|mgr| std::mem::take(&mut mgr.event_handlers));
        handlers
            .get_mut(&id)
            .unwrap()
            .on_close = Some(Box::new(move || fired2.set(fired2.get() + 1)));

        dispatch_host_events(
            vec![HostEvent::Closed { id }, HostEvent::Closed { id }],
            &mut handlers,
        );
        assert_eq!(fired.get(), 1);
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(slot.take(), Some(Err(Error::WindowClosed(_)))));
        assert!(!with_manager(|mgr| mgr.windows.contains_key(&id)));
    }

    #[test]
    fn message_dispatch_respects_native_origin_filter() {
        let (id, _closed) = with_manager(|mgr| mgr.allocate_id().unwrap());
        crate::policy::set_policy(
            id,
            crate::policy::WindowPolicy {
                trusted_origins: vec!["https://app.local".into()],
                ..Default::default()
            },
        );

        let seen = std::rc::Rc::new(RefCell::new(Vec::new()));
        let seen2 = std::rc::Rc::clone(&seen);
        let mut handlers = with_manager(|mgr| std::mem::take(&mut mgr.event_handlers));
        handlers.get_mut(&id).unwrap().on_message =
            Some(Box::new(move |msg, _src| seen2.borrow_mut().push(msg.to_string())));

        dispatch_host_events(
            vec![
                HostEvent::Message {
                    id,
                    body: "good".into(),
                    source_url: "https://app.local/p".into(),
                },
                HostEvent::Message {
                    id,
                    body: "bad".into(),
                    source_url: "https://evil.com/".into(),
                },
            ],
            &mut handlers,
        );
        assert_eq!(*seen.borrow(), vec!["good".to_string()]);

        dispatch_host_events(vec![HostEvent::Closed { id }], &mut handlers);
    }
}
