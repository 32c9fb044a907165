use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::cookies::CookieInfo;
use crate::error::{Error, Result};
use crate::events::{
    CloseCallback, CookiesCallback, FocusCallback, MessageCallback, MoveCallback,
    NavigationBlockedCallback, PageLoadCallback, ReloadCallback, ResizeCallback,
    TitleChangedCallback,
};
use crate::options::WindowOptions;
use crate::policy::{self, WindowPolicy};
use crate::script;
use crate::window_manager::{push_command, with_manager, Command};

/// Enqueues a close when the last handle clone for a window goes away
/// without an explicit `close()` call, preventing event handler and policy
/// leaks in the manager maps.
struct CloseOnDrop {
    id: u32,
    closed: Arc<AtomicBool>,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            push_command(Command::Close { id: self.id });
        }
    }
}

/// A native OS window with an embedded webview.
///
/// The handle is cheap to clone and may be moved to other threads; every
/// method translates into a command executed on the UI thread during the
/// next [`pump_events`](crate::pump_events) tick. Construction and handler
/// registration must happen on the UI thread.
///
/// After the window closes — explicitly or by the user — every method
/// fails with [`Error::WindowClosed`].
#[derive(Clone)]
pub struct NativeWindow {
    id: u32,
    closed: Arc<AtomicBool>,
    _drop_guard: Arc<CloseOnDrop>,
}

impl NativeWindow {
    /// Create a new native window with the given options.
    ///
    /// The platform back-end starts lazily on the first creation. The native
    /// window itself is built during the next [`pump_events`] call; the
    /// returned handle is valid immediately.
    ///
    /// [`pump_events`]: crate::pump_events
    pub fn new(options: WindowOptions) -> Result<Self> {
        let (id, closed) = with_manager(|mgr| {
            if !mgr.initialized {
                mgr.platform = Some(crate::platform::Platform::new()?);
                mgr.initialized = true;
            }
            let (id, closed) = mgr.allocate_id()?;
            // Normalize trusted origins through extract_origin() so that
            // user-provided values like "HTTPS://Example.Com:443" are stored
            // as "https://example.com" (WHATWG URL Standard).
            let trusted_origins: Vec<String> = options
                .trusted_origins
                .iter()
                .filter_map(|o| policy::extract_origin(o))
                .collect();
            policy::set_policy(
                id,
                WindowPolicy {
                    trusted_origins,
                    allowed_hosts: options.allowed_hosts.clone(),
                    permissions: options.permission_flags(),
                },
            );
            push_command(Command::CreateWindow {
                id,
                options: Box::new(options),
            });
            Ok::<_, crate::error::Error>((id, closed))
        })?;

        Ok(Self {
            id,
            closed: Arc::clone(&closed),
            _drop_guard: Arc::new(CloseOnDrop { id, closed }),
        })
    }

    /// The unique window ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the window has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::WindowClosed(self.id))
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, cmd: Command) -> Result<()> {
        self.ensure_open()?;
        push_command(cmd);
        Ok(())
    }

    // ---- Content loading ----

    /// Load a URL in the webview. Only `http:` and `https:` URLs are
    /// allowed; use [`load_html`](Self::load_html) for inline content and
    /// [`UnsafeWindow::evaluate_script`] for script execution.
    pub fn load_url(&self, url: &str) -> Result<()> {
        let trimmed = url.trim().to_string();
        let lower = trimmed.to_lowercase();
        // Allowlist: only permit safe schemes
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            return Err(Error::BlockedUrl(format!(
                "only http: and https: URLs are allowed in load_url(), got {trimmed:?}"
            )));
        }
        self.enqueue(Command::LoadUrl {
            id: self.id,
            url: trimmed,
        })
    }

    /// Load an HTML string directly in the webview. The content is served
    /// from an internal synthetic origin that is never gated by
    /// `allowed_hosts`.
    pub fn load_html(&self, html: &str) -> Result<()> {
        self.enqueue(Command::LoadHtml {
            id: self.id,
            html: html.to_string(),
        })
    }

    /// Send a message to the webview. This invokes
    /// `window.__native_message__(msg)` in the page context.
    pub fn post_message(&self, message: &str) -> Result<()> {
        self.enqueue(Command::EvaluateScript {
            id: self.id,
            script: script::post_message_script(message),
        })
    }

    /// Install a script that runs before any page script in every future
    /// document of this window.
    pub(crate) fn install_document_start_script(&self, source: String) -> Result<()> {
        self.enqueue(Command::InstallDocumentStartScript {
            id: self.id,
            source,
        })
    }

    /// Evaluate without the `unsafe` accessor; crate-internal plumbing for
    /// the typed channel's client injection.
    pub(crate) fn evaluate_script_internal(&self, source: String) -> Result<()> {
        self.enqueue(Command::EvaluateScript {
            id: self.id,
            script: source,
        })
    }

    // ---- Window control ----

    /// Set the window title.
    pub fn set_title(&self, title: &str) -> Result<()> {
        self.enqueue(Command::SetTitle {
            id: self.id,
            title: title.to_string(),
        })
    }

    /// Set the window size in logical pixels.
    pub fn set_size(&self, width: f64, height: f64) -> Result<()> {
        self.enqueue(Command::SetSize {
            id: self.id,
            width,
            height,
        })
    }

    /// Set the minimum window size.
    pub fn set_min_size(&self, width: f64, height: f64) -> Result<()> {
        self.enqueue(Command::SetMinSize {
            id: self.id,
            width,
            height,
        })
    }

    /// Set the maximum window size.
    pub fn set_max_size(&self, width: f64, height: f64) -> Result<()> {
        self.enqueue(Command::SetMaxSize {
            id: self.id,
            width,
            height,
        })
    }

    /// Set the window position in screen coordinates.
    pub fn set_position(&self, x: f64, y: f64) -> Result<()> {
        self.enqueue(Command::SetPosition { id: self.id, x, y })
    }

    /// Set whether the window is resizable.
    pub fn set_resizable(&self, resizable: bool) -> Result<()> {
        self.enqueue(Command::SetResizable {
            id: self.id,
            resizable,
        })
    }

    /// Set whether the window has decorations (title bar, borders).
    pub fn set_decorations(&self, decorations: bool) -> Result<()> {
        self.enqueue(Command::SetDecorations {
            id: self.id,
            decorations,
        })
    }

    /// Set whether the window is always on top.
    pub fn set_always_on_top(&self, always_on_top: bool) -> Result<()> {
        self.enqueue(Command::SetAlwaysOnTop {
            id: self.id,
            always_on_top,
        })
    }

    /// Show the window.
    pub fn show(&self) -> Result<()> {
        self.enqueue(Command::Show { id: self.id })
    }

    /// Hide the window.
    pub fn hide(&self) -> Result<()> {
        self.enqueue(Command::Hide { id: self.id })
    }

    /// Close and destroy the window. The handle is unusable afterwards;
    /// subsequent calls fail fast with [`Error::WindowClosed`].
    pub fn close(&self) -> Result<()> {
        self.ensure_open()?;
        // Flag first so racing calls fail before the command executes.
        self.closed.store(true, Ordering::SeqCst);
        push_command(Command::Close { id: self.id });
        Ok(())
    }

    /// Focus the window.
    pub fn focus(&self) -> Result<()> {
        self.enqueue(Command::Focus { id: self.id })
    }

    /// Maximize the window.
    pub fn maximize(&self) -> Result<()> {
        self.enqueue(Command::Maximize { id: self.id })
    }

    /// Minimize the window.
    pub fn minimize(&self) -> Result<()> {
        self.enqueue(Command::Minimize { id: self.id })
    }

    /// Restore the window from maximized state.
    pub fn unmaximize(&self) -> Result<()> {
        self.enqueue(Command::Unmaximize { id: self.id })
    }

    /// Reload the current page in the webview.
    pub fn reload(&self) -> Result<()> {
        self.enqueue(Command::Reload { id: self.id })
    }

    /// Set the window icon from a PNG or ICO file path.
    /// On macOS this is silently ignored.
    pub fn set_icon(&self, path: &str) -> Result<()> {
        self.enqueue(Command::SetIcon {
            id: self.id,
            path: path.to_string(),
        })
    }

    // ---- Cookie access ----

    /// Query cookies from the engine's cookie store (including HttpOnly).
    ///
    /// If `url` is provided, only cookies matching that URL are returned;
    /// otherwise all cookies are returned. The future resolves during a
    /// later [`pump_events`](crate::pump_events) tick, once the engine
    /// delivers the store contents; completion order relative to subsequent
    /// commands on the same window is not guaranteed. Futures outstanding
    /// when the window closes resolve with [`Error::WindowClosed`].
    pub fn get_cookies(&self, url: Option<&str>) -> Result<CookiesFuture> {
        self.ensure_open()?;
        let slot = CookieSlot::new();
        with_manager(|mgr| {
            if let Some(record) = mgr.windows.get_mut(&self.id) {
                record.cookie_waiters.push_back(slot.clone());
            }
        });
        push_command(Command::GetCookies {
            id: self.id,
            url: url.map(str::to_string),
        });
        Ok(CookiesFuture { slot })
    }

    // ---- Unsafe namespace ----

    /// Access operations that execute arbitrary code in the page. The
    /// returned accessor borrows this handle and re-checks the window's
    /// live state on every call; it cannot be cached past the handle.
    pub fn unsafe_api(&self) -> UnsafeWindow<'_> {
        UnsafeWindow { window: self }
    }

    // ---- Event handlers ----

    fn with_handlers<F>(&self, f: F)
    where
        F: FnOnce(&mut crate::events::WindowEventHandlers),
    {
        with_manager(|mgr| {
            if let Some(handlers) = mgr.event_handlers.get_mut(&self.id) {
                f(handlers);
            }
        });
    }

    /// Register a handler for IPC messages from the webview.
    /// In the page, `window.ipc.postMessage(string)` sends messages. The
    /// callback receives the message string and the source page URL.
    /// Replaces any previously registered handler.
    pub fn on_message<F>(&self, callback: F)
    where
        F: FnMut(&str, &str) + 'static,
    {
        self.with_handlers(|h| h.on_message = Some(Box::new(callback) as MessageCallback));
    }

    /// Register a handler for the window close event. The pump bookkeeping
    /// relies on this firing exactly once, so re-registering replaces the
    /// previous handler and logs a warning.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        let id = self.id;
        self.with_handlers(|h| {
            if h.on_close.is_some() {
                tracing::warn!(
                    window_id = id,
                    "on_close re-registered; the previous handler is replaced and \
                     will never fire"
                );
            }
            h.on_close = Some(Box::new(callback) as CloseCallback);
        });
    }

    /// Register a handler for window resize events (logical pixels).
    pub fn on_resize<F>(&self, callback: F)
    where
        F: FnMut(f64, f64) + 'static,
    {
        self.with_handlers(|h| h.on_resize = Some(Box::new(callback) as ResizeCallback));
    }

    /// Register a handler for window move events.
    pub fn on_move<F>(&self, callback: F)
    where
        F: FnMut(f64, f64) + 'static,
    {
        self.with_handlers(|h| h.on_move = Some(Box::new(callback) as MoveCallback));
    }

    /// Register a handler for window focus events.
    pub fn on_focus<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.with_handlers(|h| h.on_focus = Some(Box::new(callback) as FocusCallback));
    }

    /// Register a handler for window blur (lost focus) events.
    pub fn on_blur<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.with_handlers(|h| h.on_blur = Some(Box::new(callback) as FocusCallback));
    }

    /// Register a handler for page load events.
    pub fn on_page_load<F>(&self, callback: F)
    where
        F: FnMut(crate::events::PageLoadPhase, &str) + 'static,
    {
        self.with_handlers(|h| h.on_page_load = Some(Box::new(callback) as PageLoadCallback));
    }

    /// Register a handler for document title change events.
    pub fn on_title_changed<F>(&self, callback: F)
    where
        F: FnMut(&str) + 'static,
    {
        self.with_handlers(|h| {
            h.on_title_changed = Some(Box::new(callback) as TitleChangedCallback)
        });
    }

    /// Register a handler for the window reload event.
    pub fn on_reload<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.with_handlers(|h| h.on_reload = Some(Box::new(callback) as ReloadCallback));
    }

    /// Register a handler for blocked navigation events, fired when a
    /// navigation is rejected by the `allowed_hosts` restriction.
    pub fn on_navigation_blocked<F>(&self, callback: F)
    where
        F: FnMut(&str) + 'static,
    {
        self.with_handlers(|h| {
            h.on_navigation_blocked = Some(Box::new(callback) as NavigationBlockedCallback)
        });
    }

    /// Register a handler for raw cookie query results (a JSON array
    /// string). Most hosts should use [`get_cookies`](Self::get_cookies)
    /// instead.
    pub fn on_cookies<F>(&self, callback: F)
    where
        F: FnMut(&str) + 'static,
    {
        self.with_handlers(|h| h.on_cookies = Some(Box::new(callback) as CookiesCallback));
    }
}

impl std::fmt::Debug for NativeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeWindow")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Operations that execute arbitrary code in the page context, reached via
/// [`NativeWindow::unsafe_api`]. Borrowing the handle keeps a cached
/// accessor from outliving it; the live-state check happens per call.
pub struct UnsafeWindow<'a> {
    window: &'a NativeWindow,
}

impl UnsafeWindow<'_> {
    /// Execute JavaScript in the page. Fire-and-forget: there is no return
    /// channel by design — code that needs a result must use a
    /// `postMessage` round-trip.
    pub fn evaluate_script(&self, source: &str) -> Result<()> {
        self.window.enqueue(Command::EvaluateScript {
            id: self.window.id,
            script: source.to_string(),
        })
    }
}

// ── Cookie futures ──────────────────────────────────────────────

struct CookieSlotInner {
    result: Option<Result<Vec<CookieInfo>>>,
    waker: Option<Waker>,
}

/// Shared completion slot between a [`CookiesFuture`] and the manager's
/// per-window waiter queue.
#[derive(Clone)]
pub(crate) struct CookieSlot {
    inner: Arc<Mutex<CookieSlotInner>>,
}

impl CookieSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CookieSlotInner {
                result: None,
                waker: None,
            })),
        }
    }

    /// Store the outcome and wake the future, if one is waiting.
    pub(crate) fn fulfill(&self, result: Result<Vec<CookieInfo>>) {
        let waker = {
            let mut inner = match self.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.result.is_some() {
                return;
            }
            inner.result = Some(result);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    #[cfg(test)]
    pub(crate) fn take(&self) -> Option<Result<Vec<CookieInfo>>> {
        match self.inner.lock() {
            Ok(mut g) => g.result.take(),
            Err(poisoned) => poisoned.into_inner().result.take(),
        }
    }
}

/// Future returned by [`NativeWindow::get_cookies`], fulfilled when the
/// engine delivers the cookie store contents during a later pump tick.
///
/// Hosts without an async executor can keep pumping and poll with
/// [`try_take`](Self::try_take).
pub struct CookiesFuture {
    slot: CookieSlot,
}

impl CookiesFuture {
    /// Non-blocking check: returns the result once the engine has
    /// delivered it, `None` while still pending.
    pub fn try_take(&self) -> Option<Result<Vec<CookieInfo>>> {
        let mut inner = match self.slot.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.result.take()
    }
}

impl Future for CookiesFuture {
    type Output = Result<Vec<CookieInfo>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = match self.slot.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match inner.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Window construction needs a platform back-end, so handle-level checks
    // are built around a record registered by hand.
    fn fake_window(id: u32) -> NativeWindow {
        let closed = Arc::new(AtomicBool::new(false));
        NativeWindow {
            id,
            closed: Arc::clone(&closed),
            _drop_guard: Arc::new(CloseOnDrop { id, closed }),
        }
    }

    #[test]
    fn closed_flag_fails_every_mutation() {
        let w = fake_window(7001);
        w.close().unwrap();
        assert!(w.is_closed());
        assert!(matches!(w.set_title("x"), Err(Error::WindowClosed(7001))));
        assert!(matches!(w.load_html("<p/>"), Err(Error::WindowClosed(7001))));
        assert!(matches!(w.close(), Err(Error::WindowClosed(7001))));
        assert!(matches!(
            w.unsafe_api().evaluate_script("1"),
            Err(Error::WindowClosed(7001))
        ));
        assert!(matches!(
            w.get_cookies(None),
            Err(Error::WindowClosed(7001))
        ));
    }

    #[test]
    fn clones_share_the_closed_flag() {
        let w = fake_window(7002);
        let clone = w.clone();
        w.close().unwrap();
        assert!(clone.is_closed());
        assert!(matches!(clone.show(), Err(Error::WindowClosed(7002))));
    }

    #[test]
    fn load_url_allows_only_http_schemes() {
        let w = fake_window(7003);
        assert!(w.load_url("https://example.com").is_ok());
        assert!(w.load_url("  HTTP://example.com  ").is_ok());
        assert!(matches!(w.load_url("file:///etc/passwd"), Err(Error::BlockedUrl(_))));
        assert!(matches!(w.load_url("javascript:alert(1)"), Err(Error::BlockedUrl(_))));
        assert!(matches!(w.load_url("data:text/html,hi"), Err(Error::BlockedUrl(_))));
    }

    #[test]
    fn cookie_slot_fulfills_once_and_wakes() {
        let slot = CookieSlot::new();
        slot.fulfill(Ok(Vec::new()));
        slot.fulfill(Err(Error::WindowClosed(1))); // ignored
        assert!(matches!(slot.take(), Some(Ok(_))));
    }

    #[test]
    fn cookies_future_try_take_transitions() {
        let slot = CookieSlot::new();
        let future = CookiesFuture { slot: slot.clone() };
        assert!(future.try_take().is_none());
        slot.fulfill(Ok(Vec::new()));
        assert!(matches!(future.try_take(), Some(Ok(_))));
        assert!(future.try_take().is_none());
    }
}
