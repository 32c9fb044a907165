//! macOS back-end: NSWindow + WKWebView.
//!
//! Delegate objects translate WebKit and AppKit callbacks into buffered
//! host events; nothing here touches host callbacks directly. Permission
//! prompts are answered from the window's policy flags without user
//! interaction, and popups are denied at the UI-delegate layer in addition
//! to the injected `window.open` override.

use std::cell::RefCell;
use std::collections::HashMap;

use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2::{define_class, msg_send, ClassType, DefinedClass, MainThreadMarker, MainThreadOnly};
use objc2_app_kit::{
    NSApplication, NSApplicationActivationPolicy, NSBackingStoreType, NSEvent, NSEventMask,
    NSFloatingWindowLevel, NSNormalWindowLevel, NSRunningApplication, NSWindow, NSWindowDelegate,
    NSWindowStyleMask,
};
use objc2_foundation::{
    ns_string, NSArray, NSDate, NSDefaultRunLoopMode, NSNotification, NSObjectProtocol, NSPoint,
    NSRect, NSSize, NSString,
};
use objc2_web_kit::{
    WKHTTPCookieStore, WKNavigation, WKNavigationAction, WKNavigationDelegate, WKScriptMessage,
    WKScriptMessageHandler, WKUIDelegate, WKUserContentController, WKUserScript,
    WKUserScriptInjectionTime, WKWebView, WKWebViewConfiguration,
};

use crate::cookies::{self, CookieInfo, SameSite, SESSION_EXPIRES};
use crate::error::{Error, Result};
use crate::events::PageLoadPhase;
use crate::options::WindowOptions;
use crate::policy;
use crate::script;
use crate::window_manager::{push_host_event, Command, HostEvent};

/// Maximum IPC message size in bytes (10 MB). Messages exceeding this are
/// silently dropped to prevent memory exhaustion from the webview.
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Engine-native posting expression for the injected `window.ipc` bridge.
const NATIVE_POST: &str =
    "window.webkit.messageHandlers.ipc.postMessage.bind(window.webkit.messageHandlers.ipc)";

/// WKNavigationType.reload
const NAV_TYPE_RELOAD: isize = 3;
/// WKPermissionDecision values.
const PERMISSION_GRANT: isize = 1;
const PERMISSION_DENY: isize = 2;
/// WKMediaCaptureType values.
const CAPTURE_CAMERA: isize = 0;
const CAPTURE_MICROPHONE: isize = 1;
const CAPTURE_CAMERA_AND_MICROPHONE: isize = 2;

/// Tracks the last loaded content for reliable reload.
enum LoadedContent {
    Url,
    Html(String),
}

thread_local! {
    /// Last loaded HTML content per window id, read by the navigation
    /// delegate when intercepting reloads. Separate from the platform
    /// struct because delegates fire while it is mutably borrowed.
    static LOADED_HTML: RefCell<HashMap<u32, String>> = RefCell::new(HashMap::new());
}

/// A window entry containing the native window and webview.
struct WindowEntry {
    window: Retained<NSWindow>,
    webview: Retained<WKWebView>,
    /// Prevent the delegates from being deallocated while the window lives.
    _window_delegate: Retained<ProtocolObject<dyn NSWindowDelegate>>,
    _nav_delegate: Retained<ProtocolObject<dyn WKNavigationDelegate>>,
    _ui_delegate: Retained<ProtocolObject<dyn WKUIDelegate>>,
    title_observer: Retained<TitleObserver>,
    /// Last loaded content for reload support.
    loaded_content: Option<LoadedContent>,
}

/// macOS platform state.
pub struct MacosPlatform {
    windows: HashMap<u32, WindowEntry>,
    mtm: MainThreadMarker,
}

// IPC message handler delegate
define_class!(
    #[unsafe(super(objc2::runtime::NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "HostviewIpcHandler"]
    #[ivars = u32] // window id
    struct IpcMessageHandler;

    unsafe impl NSObjectProtocol for IpcMessageHandler {}

    unsafe impl WKScriptMessageHandler for IpcMessageHandler {
        #[unsafe(method(userContentController:didReceiveScriptMessage:))]
        fn did_receive_script_message(
            &self,
            _controller: &WKUserContentController,
            message: &WKScriptMessage,
        ) {
            let window_id = *self.ivars();
            let body = unsafe { message.body() };
            let body_str: Retained<NSString> = unsafe { msg_send![&body, description] };
            let message_string = body_str.to_string();

            // Drop oversized messages to prevent memory exhaustion
            if message_string.len() > MAX_MESSAGE_SIZE {
                return;
            }

            // Extract source URL from frameInfo → request → URL.
            // The engine reports the full URL of the posting frame.
            let source_url: String = unsafe {
                let frame_info: *const AnyObject = msg_send![message, frameInfo];
                if frame_info.is_null() {
                    String::new()
                } else {
                    let request: *const AnyObject = msg_send![frame_info, request];
                    if request.is_null() {
                        String::new()
                    } else {
                        let url: *const AnyObject = msg_send![request, URL];
                        if url.is_null() {
                            String::new()
                        } else {
                            let abs: Retained<NSString> = msg_send![url, absoluteString];
                            abs.to_string()
                        }
                    }
                }
            };

            // Trusted-origin prefilter at the native layer (defense-in-depth;
            // the flush re-checks before the host callback fires).
            if !policy::is_origin_trusted(window_id, &source_url) {
                return;
            }

            push_host_event(HostEvent::Message {
                id: window_id,
                body: message_string,
                source_url,
            });
        }
    }
);

impl IpcMessageHandler {
    fn new(mtm: MainThreadMarker, window_id: u32) -> Retained<Self> {
        let handler = Self::alloc(mtm).set_ivars(window_id);
        unsafe { msg_send![super(handler), init] }
    }
}

// Window delegate — close, resize, move, and focus events
define_class!(
    #[unsafe(super(objc2::runtime::NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "HostviewWindowDelegate"]
    #[ivars = u32] // window id
    struct WindowDelegate;

    unsafe impl NSObjectProtocol for WindowDelegate {}

    unsafe impl NSWindowDelegate for WindowDelegate {
        #[unsafe(method(windowWillClose:))]
        fn window_will_close(&self, _notification: &NSNotification) {
            push_host_event(HostEvent::Closed { id: *self.ivars() });
        }

        #[unsafe(method(windowDidResize:))]
        fn window_did_resize(&self, notification: &NSNotification) {
            let id = *self.ivars();
            if let Some(window) = unsafe { notification.object() } {
                unsafe {
                    let frame: NSRect = msg_send![&*window, frame];
                    let content: NSRect = msg_send![&*window, contentRectForFrameRect: frame];
                    push_host_event(HostEvent::Resized {
                        id,
                        width: content.size.width,
                        height: content.size.height,
                    });
                }
            }
        }

        #[unsafe(method(windowDidMove:))]
        fn window_did_move(&self, notification: &NSNotification) {
            let id = *self.ivars();
            if let Some(window) = unsafe { notification.object() } {
                unsafe {
                    let frame: NSRect = msg_send![&*window, frame];
                    push_host_event(HostEvent::Moved {
                        id,
                        x: frame.origin.x,
                        y: frame.origin.y,
                    });
                }
            }
        }

        #[unsafe(method(windowDidBecomeKey:))]
        fn window_did_become_key(&self, _notification: &NSNotification) {
            push_host_event(HostEvent::Focused { id: *self.ivars() });
        }

        #[unsafe(method(windowDidResignKey:))]
        fn window_did_resign_key(&self, _notification: &NSNotification) {
            push_host_event(HostEvent::Blurred { id: *self.ivars() });
        }
    }
);

impl WindowDelegate {
    fn new(mtm: MainThreadMarker, window_id: u32) -> Retained<Self> {
        let delegate = Self::alloc(mtm).set_ivars(window_id);
        unsafe { msg_send![super(delegate), init] }
    }
}

// Navigation delegate — page-load events, reload interception for HTML
// content, scheme blocking, and allowed-hosts gating
define_class!(
    #[unsafe(super(objc2::runtime::NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "HostviewNavigationDelegate"]
    #[ivars = u32] // window id
    struct NavigationDelegate;

    unsafe impl NSObjectProtocol for NavigationDelegate {}

    unsafe impl WKNavigationDelegate for NavigationDelegate {
        #[unsafe(method(webView:decidePolicyForNavigationAction:decisionHandler:))]
        fn decide_policy(
            &self,
            web_view: &WKWebView,
            navigation_action: &WKNavigationAction,
            decision_handler: &block2::Block<dyn Fn(objc2_web_kit::WKNavigationActionPolicy)>,
        ) {
            let window_id = *self.ivars();
            let nav_type: isize = unsafe { msg_send![navigation_action, navigationType] };

            if nav_type == NAV_TYPE_RELOAD {
                let html = LOADED_HTML.with(|h| h.borrow().get(&window_id).cloned());
                if let Some(html) = html {
                    // Cancel the native reload — it would show a blank page
                    // for HTML content — and re-apply the stored HTML with
                    // the synthetic base URL.
                    decision_handler.call((objc2_web_kit::WKNavigationActionPolicy::Cancel,));
                    unsafe {
                        load_html_string(web_view, &html);
                    }
                    push_host_event(HostEvent::Reload { id: window_id });
                    return;
                }
            }

            let url = unsafe { navigation_action_url(navigation_action) };

            // Block dangerous URL schemes (javascript:, file:, data:, blob:)
            let lower = url.to_lowercase();
            if lower.starts_with("javascript:")
                || lower.starts_with("file:")
                || lower.starts_with("data:")
                || lower.starts_with("blob:")
            {
                decision_handler.call((objc2_web_kit::WKNavigationActionPolicy::Cancel,));
                return;
            }

            // Enforce allowed_hosts — applies to ALL navigations; internal
            // URLs (about:, the load_html synthetic origin) pass the check.
            if !url.is_empty() && !policy::is_host_allowed(window_id, &url) {
                decision_handler.call((objc2_web_kit::WKNavigationActionPolicy::Cancel,));
                push_host_event(HostEvent::NavigationBlocked { id: window_id, url });
                return;
            }

            decision_handler.call((objc2_web_kit::WKNavigationActionPolicy::Allow,));
        }

        #[unsafe(method(webView:didStartProvisionalNavigation:))]
        fn did_start_provisional_navigation(
            &self,
            web_view: &WKWebView,
            _navigation: Option<&WKNavigation>,
        ) {
            push_host_event(HostEvent::PageLoad {
                id: *self.ivars(),
                phase: PageLoadPhase::Started,
                url: unsafe { webview_url(web_view) },
            });
        }

        #[unsafe(method(webView:didFinishNavigation:))]
        fn did_finish_navigation(
            &self,
            web_view: &WKWebView,
            _navigation: Option<&WKNavigation>,
        ) {
            push_host_event(HostEvent::PageLoad {
                id: *self.ivars(),
                phase: PageLoadPhase::Finished,
                url: unsafe { webview_url(web_view) },
            });
        }
    }
);

impl NavigationDelegate {
    fn new(mtm: MainThreadMarker, window_id: u32) -> Retained<Self> {
        let delegate = Self::alloc(mtm).set_ivars(window_id);
        unsafe { msg_send![super(delegate), init] }
    }
}

// UI delegate — denies popups and answers media-capture permission
// requests from the window's policy flags without prompting
define_class!(
    #[unsafe(super(objc2::runtime::NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "HostviewUiDelegate"]
    #[ivars = u32] // window id
    struct UiDelegate;

    unsafe impl NSObjectProtocol for UiDelegate {}

    unsafe impl WKUIDelegate for UiDelegate {
        #[unsafe(method(webView:createWebViewWithConfiguration:forNavigationAction:windowFeatures:))]
        fn create_web_view(
            &self,
            _web_view: &WKWebView,
            _configuration: &WKWebViewConfiguration,
            _navigation_action: &WKNavigationAction,
            _window_features: &AnyObject,
        ) -> *mut WKWebView {
            // Returning nil denies window.open at the engine level.
            std::ptr::null_mut()
        }

        #[unsafe(method(webView:requestMediaCapturePermissionForOrigin:initiatedByFrame:type:decisionHandler:))]
        fn request_media_capture_permission(
            &self,
            _web_view: &WKWebView,
            _origin: &AnyObject,
            _frame: &AnyObject,
            capture_type: isize,
            decision_handler: &block2::Block<dyn Fn(isize)>,
        ) {
            let flags = policy::get_permissions(*self.ivars());
            let allowed = match capture_type {
                CAPTURE_CAMERA => flags.camera,
                CAPTURE_MICROPHONE => flags.microphone,
                CAPTURE_CAMERA_AND_MICROPHONE => flags.camera && flags.microphone,
                _ => false,
            };
            decision_handler.call((if allowed { PERMISSION_GRANT } else { PERMISSION_DENY },));
        }
    }
);

impl UiDelegate {
    fn new(mtm: MainThreadMarker, window_id: u32) -> Retained<Self> {
        let delegate = Self::alloc(mtm).set_ivars(window_id);
        unsafe { msg_send![super(delegate), init] }
    }
}

// KVO observer for the webview's document title
define_class!(
    #[unsafe(super(objc2::runtime::NSObject))]
    #[thread_kind = MainThreadOnly]
    #[name = "HostviewTitleObserver"]
    #[ivars = u32] // window id
    struct TitleObserver;

    unsafe impl NSObjectProtocol for TitleObserver {}

    impl TitleObserver {
        #[unsafe(method(observeValueForKeyPath:ofObject:change:context:))]
        fn observe_value(
            &self,
            key_path: Option<&NSString>,
            object: Option<&AnyObject>,
            _change: Option<&AnyObject>,
            _context: *mut std::ffi::c_void,
        ) {
            let is_title = key_path.map(|k| k.to_string() == "title").unwrap_or(false);
            if !is_title {
                return;
            }
            let Some(object) = object else { return };
            let title: Option<Retained<NSString>> = unsafe { msg_send![object, title] };
            push_host_event(HostEvent::TitleChanged {
                id: *self.ivars(),
                title: title.map(|t| t.to_string()).unwrap_or_default(),
            });
        }
    }
);

impl TitleObserver {
    fn new(mtm: MainThreadMarker, window_id: u32) -> Retained<Self> {
        let observer = Self::alloc(mtm).set_ivars(window_id);
        unsafe { msg_send![super(observer), init] }
    }
}

/// Current URL of a webview as a string; empty when none.
unsafe fn webview_url(web_view: &WKWebView) -> String {
    let url: *const AnyObject = msg_send![web_view, URL];
    if url.is_null() {
        return String::new();
    }
    let abs: Option<Retained<NSString>> = msg_send![url, absoluteString];
    abs.map(|s| s.to_string()).unwrap_or_default()
}

/// Target URL of a navigation action; empty when none.
unsafe fn navigation_action_url(action: &WKNavigationAction) -> String {
    let request: *const AnyObject = msg_send![action, request];
    if request.is_null() {
        return String::new();
    }
    let url: *const AnyObject = msg_send![request, URL];
    if url.is_null() {
        return String::new();
    }
    let abs: Option<Retained<NSString>> = msg_send![url, absoluteString];
    abs.map(|s| s.to_string()).unwrap_or_default()
}

/// Load an HTML string with the synthetic base URL so the page has a proper
/// security origin instead of about:blank (a null base URL weakens the
/// same-origin policy).
unsafe fn load_html_string(web_view: &WKWebView, html: &str) {
    let html_string = NSString::from_str(html);
    let base_url_str = NSString::from_str(policy::INTERNAL_BASE_URL);
    let base_url: Option<Retained<objc2_foundation::NSURL>> =
        msg_send![objc2_foundation::NSURL::class(), URLWithString: &*base_url_str];
    let base_url_ptr = base_url
        .as_deref()
        .map(|u| u as *const objc2_foundation::NSURL)
        .unwrap_or(std::ptr::null());
    let _: Option<Retained<WKNavigation>> =
        msg_send![web_view, loadHTMLString: &*html_string, baseURL: base_url_ptr];
}

impl MacosPlatform {
    pub fn new() -> Result<Self> {
        let mtm = MainThreadMarker::new()
            .ok_or_else(|| Error::Init("must be called from the main thread".into()))?;

        let app = NSApplication::sharedApplication(mtm);
        app.setActivationPolicy(NSApplicationActivationPolicy::Regular);

        // Activate the application
        {
            let current_app = NSRunningApplication::currentApplication();
            #[allow(deprecated)]
            current_app.activateWithOptions(
                objc2_app_kit::NSApplicationActivationOptions::ActivateIgnoringOtherApps,
            );
        }

        Ok(Self {
            windows: HashMap::new(),
            mtm,
        })
    }

    fn create_window(&mut self, id: u32, options: &WindowOptions) -> Result<()> {
        // Build style mask
        let mut style = NSWindowStyleMask::Closable
            | NSWindowStyleMask::Miniaturizable
            | NSWindowStyleMask::Titled;

        if options.resizable {
            style |= NSWindowStyleMask::Resizable;
        }

        if !options.decorations {
            style = NSWindowStyleMask::Borderless;
            if options.resizable {
                style |= NSWindowStyleMask::Resizable;
            }
        }

        let frame = NSRect::new(
            NSPoint::new(options.x.unwrap_or(100.0), options.y.unwrap_or(100.0)),
            NSSize::new(options.width, options.height),
        );

        let window = unsafe {
            NSWindow::initWithContentRect_styleMask_backing_defer(
                NSWindow::alloc(self.mtm),
                frame,
                style,
                NSBackingStoreType::Buffered,
                false,
            )
        };

        window.setTitle(&NSString::from_str(&options.title));

        if let Some((min_w, min_h)) = options.min_size {
            window.setMinSize(NSSize::new(min_w, min_h));
        }
        if let Some((max_w, max_h)) = options.max_size {
            window.setMaxSize(NSSize::new(max_w, max_h));
        }
        if options.always_on_top {
            window.setLevel(NSFloatingWindowLevel);
        }
        if options.transparent {
            window.setOpaque(false);
            window.setBackgroundColor(Some(&objc2_app_kit::NSColor::clearColor()));
        }
        // macOS has no per-window icons; options.icon is silently ignored.

        // Create WKWebView configuration
        let config = unsafe { WKWebViewConfiguration::new(self.mtm) };

        // Set up IPC handler
        let content_controller = unsafe { config.userContentController() };
        let ipc_handler = IpcMessageHandler::new(self.mtm, id);
        let ipc_handler_proto = ProtocolObject::from_retained(ipc_handler);
        unsafe {
            content_controller.addScriptMessageHandler_name(&ipc_handler_proto, ns_string!("ipc"));
        }

        // Document-start bundle: frozen ipc bridge, CSP meta, permission
        // shims, window.open override, scheme hardening. Runs in every
        // frame before any page script.
        let bundle = script::compose_document_start(NATIVE_POST, options);
        unsafe {
            add_document_start_script(&content_controller, self.mtm, &bundle);
        }

        // Create webview
        let content_rect = window.contentRectForFrameRect(window.frame());
        let webview = unsafe {
            WKWebView::initWithFrame_configuration(WKWebView::alloc(self.mtm), content_rect, &config)
        };

        // Enable Safari Web Inspector (macOS 13.3+)
        if options.devtools {
            unsafe {
                let _: () = msg_send![&webview, setInspectable: true];
            }
        }

        // Make webview fill the window
        webview.setAutoresizingMask(
            objc2_app_kit::NSAutoresizingMaskOptions::ViewWidthSizable
                | objc2_app_kit::NSAutoresizingMaskOptions::ViewHeightSizable,
        );
        window.setContentView(Some(&webview));

        // Window delegate: close, resize, move, focus, blur
        let window_delegate = WindowDelegate::new(self.mtm, id);
        let window_delegate_proto = ProtocolObject::from_retained(window_delegate);
        window.setDelegate(Some(&window_delegate_proto));

        // Navigation delegate: page-load events, reload interception,
        // scheme blocking, allowed-hosts gating
        let nav_delegate = NavigationDelegate::new(self.mtm, id);
        let nav_delegate_proto: Retained<ProtocolObject<dyn WKNavigationDelegate>> =
            ProtocolObject::from_retained(nav_delegate);
        unsafe {
            webview.setNavigationDelegate(Some(&nav_delegate_proto));
        }

        // UI delegate: popup denial + permission answers
        let ui_delegate = UiDelegate::new(self.mtm, id);
        let ui_delegate_proto: Retained<ProtocolObject<dyn WKUIDelegate>> =
            ProtocolObject::from_retained(ui_delegate);
        unsafe {
            webview.setUIDelegate(Some(&ui_delegate_proto));
        }

        // Document title changes via KVO
        let title_observer = TitleObserver::new(self.mtm, id);
        unsafe {
            let _: () = msg_send![
                &webview,
                addObserver: &*title_observer,
                forKeyPath: ns_string!("title"),
                options: 0x01usize, // NSKeyValueObservingOptionNew
                context: std::ptr::null_mut::<std::ffi::c_void>()
            ];
        }

        if options.visible {
            window.makeKeyAndOrderFront(None);
        }

        self.windows.insert(
            id,
            WindowEntry {
                window,
                webview,
                _window_delegate: window_delegate_proto,
                _nav_delegate: nav_delegate_proto,
                _ui_delegate: ui_delegate_proto,
                title_observer,
                loaded_content: None,
            },
        );

        Ok(())
    }

    fn load_url(&mut self, id: u32, url: &str) {
        let Some(entry) = self.windows.get_mut(&id) else {
            return;
        };
        unsafe {
            let url_string = NSString::from_str(url);
            let nsurl: Option<Retained<objc2_foundation::NSURL>> =
                msg_send![objc2_foundation::NSURL::class(), URLWithString: &*url_string];
            let Some(nsurl) = nsurl else {
                tracing::warn!(window_id = id, url, "load_url: URL did not parse");
                return;
            };
            let request: Retained<objc2_foundation::NSURLRequest> =
                msg_send![objc2_foundation::NSURLRequest::class(), requestWithURL: &*nsurl];
            let _: Option<Retained<WKNavigation>> =
                msg_send![&entry.webview, loadRequest: &*request];
        }
        entry.loaded_content = Some(LoadedContent::Url);
        LOADED_HTML.with(|h| h.borrow_mut().remove(&id));
    }

    fn load_html(&mut self, id: u32, html: &str) {
        let Some(entry) = self.windows.get_mut(&id) else {
            return;
        };
        unsafe {
            load_html_string(&entry.webview, html);
        }
        entry.loaded_content = Some(LoadedContent::Html(html.to_string()));
        LOADED_HTML.with(|h| h.borrow_mut().insert(id, html.to_string()));
    }

    fn evaluate_script(&self, id: u32, source: &str) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        unsafe {
            let js_string = NSString::from_str(source);
            let null_handler: *const block2::Block<
                dyn Fn(*const AnyObject, *const AnyObject),
            > = std::ptr::null();
            let _: () = msg_send![
                &entry.webview,
                evaluateJavaScript: &*js_string,
                completionHandler: null_handler
            ];
        }
    }

    fn install_document_start_script(&self, id: u32, source: &str) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        unsafe {
            let config = entry.webview.configuration();
            let controller = config.userContentController();
            add_document_start_script(&controller, self.mtm, source);
        }
    }

    fn set_resizable(&self, id: u32, resizable: bool) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        let mut style = entry.window.styleMask();
        if resizable {
            style |= NSWindowStyleMask::Resizable;
        } else {
            style &= !NSWindowStyleMask::Resizable;
        }
        entry.window.setStyleMask(style);
    }

    fn set_decorations(&self, id: u32, decorations: bool) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        let resizable = entry
            .window
            .styleMask()
            .contains(NSWindowStyleMask::Resizable);

        let mut style = if decorations {
            NSWindowStyleMask::Closable
                | NSWindowStyleMask::Miniaturizable
                | NSWindowStyleMask::Titled
        } else {
            NSWindowStyleMask::Borderless
        };
        if resizable {
            style |= NSWindowStyleMask::Resizable;
        }
        entry.window.setStyleMask(style);
    }

    fn reload(&mut self, id: u32) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        match &entry.loaded_content {
            Some(LoadedContent::Html(html)) => {
                let html = html.clone();
                self.load_html(id, &html);
            }
            _ => {
                // URL or no content — use native reload
                unsafe {
                    let _: () = msg_send![&entry.webview, reload];
                }
            }
        }
    }

    fn get_cookies(&self, id: u32, url: Option<String>) {
        let Some(entry) = self.windows.get(&id) else {
            // The waiter queue expects a response for every request.
            push_host_event(HostEvent::Cookies {
                id,
                json: "[]".to_string(),
            });
            return;
        };
        unsafe {
            let config = entry.webview.configuration();
            let data_store = config.websiteDataStore();
            let cookie_store: Retained<WKHTTPCookieStore> = data_store.httpCookieStore();

            // WKHTTPCookieStore returns the whole store; URL scoping is a
            // domain + path-prefix filter on our side.
            let handler = block2::RcBlock::new(
                move |cookie_array: *mut NSArray<objc2_foundation::NSHTTPCookie>| {
                    let mut collected: Vec<CookieInfo> = Vec::new();
                    if !cookie_array.is_null() {
                        // The engine hands a live NSArray for the duration
                        // of the block call.
                        let array = &*cookie_array;
                        for cookie in array.iter() {
                            collected.push(convert_cookie(&cookie));
                        }
                    }
                    let filtered = match &url {
                        Some(u) => cookies::filter_cookies_for_url(collected, u),
                        None => collected,
                    };
                    push_host_event(HostEvent::Cookies {
                        id,
                        json: cookies::serialize_cookies(&filtered),
                    });
                },
            );
            let _: () = msg_send![&cookie_store, getAllCookies: &*handler];
        }
    }

    /// Remove and release a window's native resources. Idempotent; also
    /// used to reap windows closed by the user before callbacks fire.
    pub fn destroy_window(&mut self, id: u32) {
        let Some(entry) = self.windows.remove(&id) else {
            return;
        };
        unsafe {
            let _: () = msg_send![
                &entry.webview,
                removeObserver: &*entry.title_observer,
                forKeyPath: ns_string!("title")
            ];
        }
        entry.window.setDelegate(None);
        LOADED_HTML.with(|h| h.borrow_mut().remove(&id));
        drop(entry);
    }

    fn close(&mut self, id: u32) {
        let Some(entry) = self.windows.remove(&id) else {
            return;
        };
        unsafe {
            let _: () = msg_send![
                &entry.webview,
                removeObserver: &*entry.title_observer,
                forKeyPath: ns_string!("title")
            ];
        }
        // Detach the delegate first so windowWillClose does not push a
        // second Closed event.
        entry.window.setDelegate(None);
        entry.window.close();
        LOADED_HTML.with(|h| h.borrow_mut().remove(&id));
        push_host_event(HostEvent::Closed { id });
    }

    /// Pump the macOS event loop: process all pending events and run-loop
    /// sources without blocking.
    ///
    /// WebKit relies on **both** NSApp events and CFRunLoop sources (GCD
    /// dispatch queues, Mach port notifications) for internal processing,
    /// and each can generate work for the other. Alternate between draining
    /// all immediately-available NSApp events and processing one pending
    /// CFRunLoop source until both queues are empty; without the source
    /// pass, page rendering stalls a tick per cascading step.
    pub fn pump_events(&mut self) {
        // Raw FFI to CoreFoundation for processing GCD/Mach-port sources.
        // CoreFoundation.framework is always linked on macOS.
        extern "C" {
            static kCFRunLoopDefaultMode: *const std::ffi::c_void;
            fn CFRunLoopRunInMode(
                mode: *const std::ffi::c_void,
                seconds: f64,
                return_after_source_handled: u8,
            ) -> i32;
        }
        /// `CFRunLoopRunInMode` return value when a source was dispatched.
        const K_CF_RUN_LOOP_RUN_HANDLED_SOURCE: i32 = 4;

        unsafe {
            let app = NSApplication::sharedApplication(self.mtm);
            loop {
                let mut did_work = false;

                // Phase 1: drain all immediately-available NSApp events
                loop {
                    let event: Option<Retained<NSEvent>> = app
                        .nextEventMatchingMask_untilDate_inMode_dequeue(
                            NSEventMask::Any,
                            Some(&NSDate::distantPast()),
                            NSDefaultRunLoopMode,
                            true,
                        );
                    match event {
                        Some(evt) => {
                            // Intercept Cmd+R to reload the focused webview
                            if !self.handle_key_shortcut(&evt) {
                                app.sendEvent(&evt);
                            }
                            did_work = true;
                        }
                        None => break,
                    }
                }

                // Phase 2: process one pending CFRunLoop source
                // (GCD dispatch blocks, Mach-port notifications, timers)
                let result = CFRunLoopRunInMode(kCFRunLoopDefaultMode, 0.0, 1);
                if result == K_CF_RUN_LOOP_RUN_HANDLED_SOURCE {
                    did_work = true;
                }

                if !did_work {
                    break;
                }
            }
        }
    }

    /// Check for keyboard shortcuts and handle them.
    /// Returns `true` if the event was consumed.
    fn handle_key_shortcut(&mut self, event: &NSEvent) -> bool {
        unsafe {
            // NSEventType::KeyDown == 10
            let event_type: usize = msg_send![event, type];
            if event_type != 10 {
                return false;
            }

            let modifier_flags: usize = msg_send![event, modifierFlags];
            let key_code: u16 = msg_send![event, keyCode];

            // NSEventModifierFlagCommand = 1 << 20 = 0x100000
            let cmd_pressed = (modifier_flags & 0x100000) != 0;
            // Exclude Shift(0x20000), Ctrl(0x40000), Alt/Opt(0x80000)
            let other_modifiers = (modifier_flags & 0xE0000) != 0;

            // keyCode 15 = 'R' on macOS (hardware virtual key code)
            if cmd_pressed && !other_modifiers && key_code == 15 {
                let app = NSApplication::sharedApplication(self.mtm);
                if let Some(key_window) = app.keyWindow() {
                    // Find which managed window is focused
                    let target_id = self.windows.iter().find_map(|(id, entry)| {
                        if *entry.window == *key_window {
                            Some(*id)
                        } else {
                            None
                        }
                    });
                    if let Some(id) = target_id {
                        self.reload(id);
                        push_host_event(HostEvent::Reload { id });
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Process a single command from the command queue. Operations on a
    /// window that no longer exists are dropped silently.
    pub fn process_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::CreateWindow { id, options } => self.create_window(id, &options)?,
            Command::LoadUrl { id, url } => self.load_url(id, &url),
            Command::LoadHtml { id, html } => self.load_html(id, &html),
            Command::EvaluateScript { id, script } => self.evaluate_script(id, &script),
            Command::InstallDocumentStartScript { id, source } => {
                self.install_document_start_script(id, &source)
            }
            Command::SetTitle { id, title } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.setTitle(&NSString::from_str(&title));
                }
            }
            Command::SetSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    let frame = entry.window.frame();
                    let new_frame = NSRect::new(frame.origin, NSSize::new(width, height));
                    entry.window.setFrame_display(new_frame, true);
                }
            }
            Command::SetMinSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.setMinSize(NSSize::new(width, height));
                }
            }
            Command::SetMaxSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.setMaxSize(NSSize::new(width, height));
                }
            }
            Command::SetPosition { id, x, y } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.setFrameOrigin(NSPoint::new(x, y));
                }
            }
            Command::SetResizable { id, resizable } => self.set_resizable(id, resizable),
            Command::SetDecorations { id, decorations } => self.set_decorations(id, decorations),
            Command::SetAlwaysOnTop { id, always_on_top } => {
                if let Some(entry) = self.windows.get(&id) {
                    if always_on_top {
                        entry.window.setLevel(NSFloatingWindowLevel);
                    } else {
                        entry.window.setLevel(NSNormalWindowLevel);
                    }
                }
            }
            Command::Show { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.makeKeyAndOrderFront(None);
                }
            }
            Command::Hide { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.orderOut(None);
                }
            }
            Command::Close { id } => self.close(id),
            Command::Focus { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.makeKeyAndOrderFront(None);
                }
            }
            Command::Maximize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    if !entry.window.isZoomed() {
                        entry.window.zoom(None);
                    }
                }
            }
            Command::Minimize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    entry.window.miniaturize(None);
                }
            }
            Command::Unmaximize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    if entry.window.isZoomed() {
                        entry.window.zoom(None);
                    }
                }
            }
            Command::Reload { id } => {
                self.reload(id);
                push_host_event(HostEvent::Reload { id });
            }
            Command::GetCookies { id, url } => self.get_cookies(id, url),
            Command::SetIcon { id: _, path: _ } => {
                // macOS doesn't support per-window icons; silently ignore.
            }
        }
        Ok(())
    }
}

/// Register `source` to run at document start in every frame.
unsafe fn add_document_start_script(
    controller: &WKUserContentController,
    mtm: MainThreadMarker,
    source: &str,
) {
    let script_string = NSString::from_str(source);
    let user_script = WKUserScript::initWithSource_injectionTime_forMainFrameOnly(
        WKUserScript::alloc(mtm),
        &script_string,
        WKUserScriptInjectionTime::AtDocumentStart,
        false,
    );
    controller.addUserScript(&user_script);
}

/// Convert an NSHTTPCookie into the wire record shape.
unsafe fn convert_cookie(cookie: &objc2_foundation::NSHTTPCookie) -> CookieInfo {
    let name: Retained<NSString> = msg_send![cookie, name];
    let value: Retained<NSString> = msg_send![cookie, value];
    let domain: Retained<NSString> = msg_send![cookie, domain];
    let path: Retained<NSString> = msg_send![cookie, path];
    let http_only: bool = msg_send![cookie, isHTTPOnly];
    let secure: bool = msg_send![cookie, isSecure];

    let same_site: Option<Retained<NSString>> = msg_send![cookie, sameSitePolicy];
    let same_site = match same_site.map(|s| s.to_string().to_lowercase()) {
        Some(ref s) if s == "lax" => SameSite::Lax,
        Some(ref s) if s == "strict" => SameSite::Strict,
        _ => SameSite::None,
    };

    let expires_date: Option<Retained<NSDate>> = msg_send![cookie, expiresDate];
    let expires = expires_date
        .map(|d| {
            let secs: f64 = msg_send![&d, timeIntervalSince1970];
            secs as i64
        })
        .unwrap_or(SESSION_EXPIRES);

    CookieInfo {
        name: name.to_string(),
        value: value.to_string(),
        domain: domain.to_string(),
        path: path.to_string(),
        http_only,
        secure,
        same_site,
        expires,
    }
}
