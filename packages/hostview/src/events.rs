//! Per-window host callbacks.
//!
//! Handlers are plain boxed closures stored in the manager registry and
//! invoked from the pump on the UI thread. Handler code must not block —
//! it runs inside the tick that drains engine events.

/// Phase of a page load reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoadPhase {
    Started,
    Finished,
}

/// Callback for string messages from the webview IPC: (message, source_url).
pub type MessageCallback = Box<dyn FnMut(&str, &str)>;

/// Callback for window close events.
pub type CloseCallback = Box<dyn FnMut()>;

/// Callback for resize events: (width, height) in logical pixels.
pub type ResizeCallback = Box<dyn FnMut(f64, f64)>;

/// Callback for move events: (x, y) in screen coordinates.
pub type MoveCallback = Box<dyn FnMut(f64, f64)>;

/// Callback for focus/blur events (no payload).
pub type FocusCallback = Box<dyn FnMut()>;

/// Callback for page load events: (phase, url).
pub type PageLoadCallback = Box<dyn FnMut(PageLoadPhase, &str)>;

/// Callback for document title change events.
pub type TitleChangedCallback = Box<dyn FnMut(&str)>;

/// Callback for reload events (no payload).
pub type ReloadCallback = Box<dyn FnMut()>;

/// Callback for cookie query results. The payload is a JSON array of cookie
/// objects; [`NativeWindow::get_cookies`] parses it into [`CookieInfo`]
/// records before fulfilling its future.
///
/// [`NativeWindow::get_cookies`]: crate::NativeWindow::get_cookies
/// [`CookieInfo`]: crate::cookies::CookieInfo
pub type CookiesCallback = Box<dyn FnMut(&str)>;

/// Callback for blocked navigation events: (url).
pub type NavigationBlockedCallback = Box<dyn FnMut(&str)>;

/// Stored event handlers for a window.
#[derive(Default)]
pub struct WindowEventHandlers {
    pub on_message: Option<MessageCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_resize: Option<ResizeCallback>,
    pub on_move: Option<MoveCallback>,
    pub on_focus: Option<FocusCallback>,
    pub on_blur: Option<FocusCallback>,
    pub on_page_load: Option<PageLoadCallback>,
    pub on_title_changed: Option<TitleChangedCallback>,
    pub on_reload: Option<ReloadCallback>,
    pub on_cookies: Option<CookiesCallback>,
    pub on_navigation_blocked: Option<NavigationBlockedCallback>,
}

impl WindowEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore handlers from `old` into any slot left empty. Used when the
    /// pump merges the extracted handler map back after dispatch:
    /// registrations made inside a callback win over the pre-dispatch ones.
    pub fn merge_missing(&mut self, old: Self) {
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if self.$field.is_none() { self.$field = old.$field; })*
            };
        }
        merge!(
            on_message,
            on_close,
            on_resize,
            on_move,
            on_focus,
            on_blur,
            on_page_load,
            on_title_changed,
            on_reload,
            on_cookies,
            on_navigation_blocked
        );
    }
}
