//! Windows back-end: Win32 window + WebView2.
//!
//! The window procedure and the COM event handlers translate engine
//! callbacks into buffered host events. Permission requests are answered
//! from the window's policy flags without prompting, and new-window
//! requests are always suppressed.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::cookies::{self, CookieInfo, SameSite, SESSION_EXPIRES};
use crate::error::{Error, Result};
use crate::events::PageLoadPhase;
use crate::options::WindowOptions;
use crate::policy;
use crate::script;
use crate::window_manager::{push_host_event, Command, HostEvent};

use windows::core::*;
use windows::Win32::Foundation::*;
use windows::Win32::Graphics::Gdi::*;
use windows::Win32::System::Com::*;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Input::KeyboardAndMouse::SetFocus;
use windows::Win32::UI::WindowsAndMessaging::*;

use webview2_com::Microsoft::Web::WebView2::Win32::*;
use webview2_com::{
    CreateCoreWebView2ControllerCompletedHandler, CreateCoreWebView2EnvironmentCompletedHandler,
};

/// Maximum IPC message size in bytes (10 MB). Messages exceeding this are
/// silently dropped to prevent memory exhaustion from the webview.
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Engine-native posting expression for the injected `window.ipc` bridge.
const NATIVE_POST: &str = "window.chrome.webview.postMessage.bind(window.chrome.webview)";

/// Tracks the last loaded content for reliable reload.
enum LoadedContent {
    Url,
    Html(String),
}

/// A window entry containing the native window handle and webview
/// controller.
struct WindowEntry {
    hwnd: HWND,
    controller: Option<ICoreWebView2Controller>,
    webview: Option<ICoreWebView2>,
    /// Last loaded content for reload support.
    loaded_content: Option<LoadedContent>,
}

/// Windows platform state.
pub struct WindowsPlatform {
    windows: HashMap<u32, WindowEntry>,
    class_registered: bool,
    /// Maps HWND to window id for the window procedure.
    hwnd_to_id: HashMap<isize, u32>,
}

// The window procedure cannot reach the platform struct (it is mutably
// borrowed during the pump), so the lookups it needs live in thread-locals.
thread_local! {
    static HWND_MAP: RefCell<HashMap<isize, u32>> = RefCell::new(HashMap::new());
    /// Min/max track sizes consulted by WM_GETMINMAXINFO, keyed by HWND.
    static MINMAX: RefCell<HashMap<isize, (Option<(f64, f64)>, Option<(f64, f64)>)>> =
        RefCell::new(HashMap::new());
    /// Deferred SetBounds calls from WM_SIZE: (window_id, hwnd as isize).
    static PENDING_RESIZES: RefCell<Vec<(u32, isize)>> = const { RefCell::new(Vec::new()) };
    /// Temporary storage for WebView2 init results passed from the
    /// completion callback back to init_webview2(). Drained immediately
    /// after wait_for_async_operation returns.
    static WEBVIEW_INIT_RESULT: RefCell<Option<(ICoreWebView2Controller, ICoreWebView2)>> =
        const { RefCell::new(None) };
    /// Window IDs with pending programmatic Navigate/NavigateToString
    /// calls. The NavigationStarting handler checks and removes entries to
    /// skip scheme blocking for our own navigations.
    static PROGRAMMATIC_NAV: RefCell<std::collections::HashSet<u32>> =
        RefCell::new(std::collections::HashSet::new());
}

impl WindowsPlatform {
    pub fn new() -> Result<Self> {
        // Initialize COM for WebView2
        unsafe {
            CoInitializeEx(None, COINIT_APARTMENTTHREADED)
                .ok()
                .map_err(|e| Error::Init(format!("COM init failed: {e}")))?;
        }

        Ok(Self {
            windows: HashMap::new(),
            class_registered: false,
            hwnd_to_id: HashMap::new(),
        })
    }

    fn ensure_class_registered(&mut self) -> Result<()> {
        if self.class_registered {
            return Ok(());
        }

        unsafe {
            let hinstance = GetModuleHandleW(None)
                .map_err(|e| Error::Creation(format!("GetModuleHandle failed: {e}")))?;

            let class_name = w!("HostviewWindowClass");

            let wc = WNDCLASSEXW {
                cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
                style: CS_HREDRAW | CS_VREDRAW,
                lpfnWndProc: Some(Self::wnd_proc),
                hInstance: hinstance.into(),
                hCursor: LoadCursorW(None, IDC_ARROW).unwrap_or_default(),
                hbrBackground: HBRUSH((COLOR_WINDOW.0 + 1) as _),
                lpszClassName: class_name,
                ..Default::default()
            };

            RegisterClassExW(&wc);
            self.class_registered = true;
        }

        Ok(())
    }

    unsafe extern "system" fn wnd_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        match msg {
            WM_DESTROY => {
                HWND_MAP.with(|map| {
                    let mut map = map.borrow_mut();
                    if let Some(id) = map.remove(&(hwnd.0 as isize)) {
                        push_host_event(HostEvent::Closed { id });
                    }
                });
                MINMAX.with(|m| {
                    m.borrow_mut().remove(&(hwnd.0 as isize));
                });
                LRESULT(0)
            }
            WM_SIZE => {
                let width = (lparam.0 & 0xFFFF) as f64;
                let height = ((lparam.0 >> 16) & 0xFFFF) as f64;

                HWND_MAP.with(|map| {
                    let map = map.borrow();
                    if let Some(&id) = map.get(&(hwnd.0 as isize)) {
                        // The controller lives in the platform struct, which
                        // is borrowed while messages dispatch — defer the
                        // SetBounds to flush_deferred().
                        PENDING_RESIZES.with(|p| {
                            p.borrow_mut().push((id, hwnd.0 as isize));
                        });
                        push_host_event(HostEvent::Resized { id, width, height });
                    }
                });
                DefWindowProcW(hwnd, msg, wparam, lparam)
            }
            WM_MOVE => {
                let x = (lparam.0 & 0xFFFF) as i16 as f64;
                let y = ((lparam.0 >> 16) & 0xFFFF) as i16 as f64;

                HWND_MAP.with(|map| {
                    let map = map.borrow();
                    if let Some(&id) = map.get(&(hwnd.0 as isize)) {
                        push_host_event(HostEvent::Moved { id, x, y });
                    }
                });
                DefWindowProcW(hwnd, msg, wparam, lparam)
            }
            WM_SETFOCUS => {
                HWND_MAP.with(|map| {
                    let map = map.borrow();
                    if let Some(&id) = map.get(&(hwnd.0 as isize)) {
                        push_host_event(HostEvent::Focused { id });
                    }
                });
                DefWindowProcW(hwnd, msg, wparam, lparam)
            }
            WM_KILLFOCUS => {
                HWND_MAP.with(|map| {
                    let map = map.borrow();
                    if let Some(&id) = map.get(&(hwnd.0 as isize)) {
                        push_host_event(HostEvent::Blurred { id });
                    }
                });
                DefWindowProcW(hwnd, msg, wparam, lparam)
            }
            WM_GETMINMAXINFO => {
                let constraints =
                    MINMAX.with(|m| m.borrow().get(&(hwnd.0 as isize)).copied());
                if let Some((min, max)) = constraints {
                    let info = lparam.0 as *mut MINMAXINFO;
                    if !info.is_null() {
                        if let Some((w, h)) = min {
                            (*info).ptMinTrackSize = POINT {
                                x: w as i32,
                                y: h as i32,
                            };
                        }
                        if let Some((w, h)) = max {
                            (*info).ptMaxTrackSize = POINT {
                                x: w as i32,
                                y: h as i32,
                            };
                        }
                    }
                    return LRESULT(0);
                }
                DefWindowProcW(hwnd, msg, wparam, lparam)
            }
            _ => DefWindowProcW(hwnd, msg, wparam, lparam),
        }
    }

    fn create_window(&mut self, id: u32, options: &WindowOptions) -> Result<()> {
        self.ensure_class_registered()?;

        let width = options.width as i32;
        let height = options.height as i32;
        let x = options.x.map(|v| v as i32).unwrap_or(CW_USEDEFAULT);
        let y = options.y.map(|v| v as i32).unwrap_or(CW_USEDEFAULT);

        let mut style = WS_OVERLAPPEDWINDOW;
        if !options.decorations {
            style = WS_POPUP | WS_SYSMENU;
        }
        if !options.resizable {
            style &= !WS_THICKFRAME & !WS_MAXIMIZEBOX;
        }
        if options.visible {
            style |= WS_VISIBLE;
        }

        let title_wide: Vec<u16> = options
            .title
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        let hwnd = unsafe {
            CreateWindowExW(
                if options.always_on_top {
                    WS_EX_TOPMOST
                } else {
                    WINDOW_EX_STYLE::default()
                },
                w!("HostviewWindowClass"),
                PCWSTR(title_wide.as_ptr()),
                style,
                x,
                y,
                width,
                height,
                None,
                None,
                GetModuleHandleW(None).unwrap_or_default(),
                None,
            )
            .map_err(|e| Error::Creation(format!("CreateWindow failed: {e}")))?
        };

        // Store HWND -> id mapping
        HWND_MAP.with(|map| {
            map.borrow_mut().insert(hwnd.0 as isize, id);
        });
        self.hwnd_to_id.insert(hwnd.0 as isize, id);

        // Size constraints answered in WM_GETMINMAXINFO
        if options.min_size.is_some() || options.max_size.is_some() {
            MINMAX.with(|m| {
                m.borrow_mut()
                    .insert(hwnd.0 as isize, (options.min_size, options.max_size));
            });
        }

        if let Some(ref icon_path) = options.icon {
            match create_hicon(icon_path) {
                Ok(hicon) => unsafe {
                    SendMessageW(
                        hwnd,
                        WM_SETICON,
                        WPARAM(ICON_BIG as usize),
                        LPARAM(hicon.0 as isize),
                    );
                },
                Err(e) => tracing::warn!(window_id = id, "icon load failed: {e}"),
            }
        }

        // Store the entry (webview is created synchronously below via the
        // nested completion handlers)
        self.windows.insert(
            id,
            WindowEntry {
                hwnd,
                controller: None,
                webview: None,
                loaded_content: None,
            },
        );

        // Create WebView2 environment and controller
        self.init_webview2(id, options)?;

        Ok(())
    }

    fn init_webview2(&mut self, id: u32, options: &WindowOptions) -> Result<()> {
        let entry = self
            .windows
            .get(&id)
            .ok_or_else(|| Error::Creation(format!("window {id} not found")))?;
        let hwnd = entry.hwnd;
        let devtools = options.devtools;
        let document_start = script::compose_document_start(NATIVE_POST, options);
        let permissions = options.permission_flags();

        unsafe {
            CreateCoreWebView2EnvironmentCompletedHandler::wait_for_async_operation(
                // Launch the async environment creation
                Box::new(|handler| {
                    CreateCoreWebView2Environment(&handler)?;
                    Ok(())
                }),
                // Handle environment creation completion
                Box::new(move |error_code, env| {
                    error_code?;
                    let env = env.ok_or_else(|| windows::core::Error::from(E_FAIL))?;

                    CreateCoreWebView2ControllerCompletedHandler::wait_for_async_operation(
                        // Launch the async controller creation
                        Box::new(move |handler| {
                            env.CreateCoreWebView2Controller(hwnd, &handler)?;
                            Ok(())
                        }),
                        // Handle controller creation completion
                        Box::new(move |error_code, controller| {
                            error_code?;
                            let controller =
                                controller.ok_or_else(|| windows::core::Error::from(E_FAIL))?;

                            // Resize to fill the window
                            let mut rect = RECT::default();
                            GetClientRect(hwnd, &mut rect)?;
                            controller.SetBounds(rect)?;
                            controller.SetIsVisible(true)?;

                            let webview = controller.CoreWebView2()?;

                            // Harden the WebView2 surface
                            if let Ok(settings) = webview.Settings() {
                                let _ = settings.SetAreDevToolsEnabled(devtools);
                                let _ = settings.SetAreDefaultContextMenusEnabled(false);
                                let _ = settings.SetIsStatusBarEnabled(false);
                                let _ = settings.SetIsBuiltInErrorPageEnabled(false);
                            }

                            // Messages from window.ipc.postMessage()
                            let mut token = std::mem::zeroed();
                            let _ = webview.add_WebMessageReceived(
                                &webview2_com::WebMessageReceivedEventHandler::create(Box::new(
                                    move |_webview, args| {
                                        if let Some(args) = args {
                                            let mut message = PWSTR::null();
                                            args.TryGetWebMessageAsString(&mut message)?;
                                            let msg = message.to_string()?;
                                            CoTaskMemFree(Some(message.0 as *const _));

                                            // Drop oversized messages
                                            if msg.len() > MAX_MESSAGE_SIZE {
                                                return Ok(());
                                            }

                                            // Full URL of the posting frame
                                            let source_url = {
                                                let mut source = PWSTR::null();
                                                match args.Source(&mut source) {
                                                    Ok(()) => {
                                                        let url = source
                                                            .to_string()
                                                            .unwrap_or_default();
                                                        if !source.is_null() {
                                                            CoTaskMemFree(Some(
                                                                source.0 as *const _,
                                                            ));
                                                        }
                                                        url
                                                    }
                                                    Err(_) => String::new(),
                                                }
                                            };

                                            // Trusted-origin prefilter
                                            // (defense-in-depth)
                                            if !policy::is_origin_trusted(id, &source_url) {
                                                return Ok(());
                                            }

                                            push_host_event(HostEvent::Message {
                                                id,
                                                body: msg,
                                                source_url,
                                            });
                                        }
                                        Ok(())
                                    },
                                )),
                                &mut token,
                            );

                            // Document-start bundle: frozen ipc bridge, CSP
                            // meta, permission shims, window.open override,
                            // scheme hardening.
                            let script_wide: Vec<u16> = document_start
                                .encode_utf16()
                                .chain(std::iter::once(0))
                                .collect();
                            let _ = webview.AddScriptToExecuteOnDocumentCreated(
                                PCWSTR(script_wide.as_ptr()),
                                None,
                            );

                            // Scheme blocking + allowedHosts + page-load
                            // started
                            let nav_start_id = id;
                            let mut nav_token = std::mem::zeroed();
                            let _ = webview.add_NavigationStarting(
                                &webview2_com::NavigationStartingEventHandler::create(Box::new(
                                    move |_webview, args| {
                                        if let Some(args) = args {
                                            let mut uri = PWSTR::null();
                                            args.Uri(&mut uri)?;
                                            let url = uri.to_string().unwrap_or_default();
                                            if !uri.is_null() {
                                                CoTaskMemFree(Some(uri.0 as *const _));
                                            }

                                            push_host_event(HostEvent::PageLoad {
                                                id: nav_start_id,
                                                phase: PageLoadPhase::Started,
                                                url: url.clone(),
                                            });

                                            // allowedHosts applies to ALL
                                            // navigations
                                            if !policy::is_host_allowed(nav_start_id, &url) {
                                                args.SetCancel(true)?;
                                                push_host_event(HostEvent::NavigationBlocked {
                                                    id: nav_start_id,
                                                    url,
                                                });
                                                return Ok(());
                                            }

                                            // Block dangerous URL schemes for
                                            // non-programmatic navigations only.
                                            let programmatic = PROGRAMMATIC_NAV
                                                .with(|f| f.borrow_mut().remove(&nav_start_id));
                                            if !programmatic {
                                                let lower = url.to_lowercase();
                                                if lower.starts_with("javascript:")
                                                    || lower.starts_with("file:")
                                                    || lower.starts_with("data:")
                                                    || lower.starts_with("blob:")
                                                {
                                                    args.SetCancel(true)?;
                                                }
                                            }
                                        }
                                        Ok(())
                                    },
                                )),
                                &mut nav_token,
                            );

                            // Page-load finished
                            let nav_complete_id = id;
                            let mut nav_completed_token = std::mem::zeroed();
                            let _ = webview.add_NavigationCompleted(
                                &webview2_com::NavigationCompletedEventHandler::create(Box::new(
                                    move |webview, _args| {
                                        let url = if let Some(ref wv) = webview {
                                            let mut source = PWSTR::null();
                                            match wv.Source(&mut source) {
                                                Ok(()) => {
                                                    let u =
                                                        source.to_string().unwrap_or_default();
                                                    if !source.is_null() {
                                                        CoTaskMemFree(Some(source.0 as *const _));
                                                    }
                                                    u
                                                }
                                                Err(_) => String::new(),
                                            }
                                        } else {
                                            String::new()
                                        };

                                        push_host_event(HostEvent::PageLoad {
                                            id: nav_complete_id,
                                            phase: PageLoadPhase::Finished,
                                            url,
                                        });
                                        Ok(())
                                    },
                                )),
                                &mut nav_completed_token,
                            );

                            // Document title changes
                            let title_id = id;
                            let mut title_token = std::mem::zeroed();
                            let _ = webview.add_DocumentTitleChanged(
                                &webview2_com::DocumentTitleChangedEventHandler::create(Box::new(
                                    move |webview, _args| {
                                        if let Some(ref wv) = webview {
                                            let mut title = PWSTR::null();
                                            if wv.DocumentTitle(&mut title).is_ok() {
                                                let t = title.to_string().unwrap_or_default();
                                                if !title.is_null() {
                                                    CoTaskMemFree(Some(title.0 as *const _));
                                                }
                                                push_host_event(HostEvent::TitleChanged {
                                                    id: title_id,
                                                    title: t,
                                                });
                                            }
                                        }
                                        Ok(())
                                    },
                                )),
                                &mut title_token,
                            );

                            // Answer permission prompts from the window's
                            // flags; default deny, never prompt.
                            let mut permission_token = std::mem::zeroed();
                            let _ = webview.add_PermissionRequested(
                                &webview2_com::PermissionRequestedEventHandler::create(Box::new(
                                    move |_webview, args| {
                                        if let Some(args) = args {
                                            let mut kind = COREWEBVIEW2_PERMISSION_KIND(0);
                                            args.PermissionKind(&mut kind)?;
                                            let allowed = match kind {
                                                COREWEBVIEW2_PERMISSION_KIND_CAMERA => {
                                                    permissions.camera
                                                }
                                                COREWEBVIEW2_PERMISSION_KIND_MICROPHONE => {
                                                    permissions.microphone
                                                }
                                                COREWEBVIEW2_PERMISSION_KIND_FILE_READ_WRITE => {
                                                    permissions.file_system
                                                }
                                                COREWEBVIEW2_PERMISSION_KIND_GEOLOCATION => {
                                                    permissions.geolocation
                                                }
                                                _ => false,
                                            };
                                            args.SetState(if allowed {
                                                COREWEBVIEW2_PERMISSION_STATE_ALLOW
                                            } else {
                                                COREWEBVIEW2_PERMISSION_STATE_DENY
                                            })?;
                                        }
                                        Ok(())
                                    },
                                )),
                                &mut permission_token,
                            );

                            // Suppress popups entirely (window.open is also
                            // overridden in-page).
                            let mut new_window_token = std::mem::zeroed();
                            let _ = webview.add_NewWindowRequested(
                                &webview2_com::NewWindowRequestedEventHandler::create(Box::new(
                                    move |_webview, args| {
                                        if let Some(args) = args {
                                            args.SetHandled(true)?;
                                        }
                                        Ok(())
                                    },
                                )),
                                &mut new_window_token,
                            );

                            // Pass controller and webview back via
                            // thread-local; init_webview2() picks this up
                            // after wait_for_async_operation returns.
                            WEBVIEW_INIT_RESULT.with(|r| {
                                *r.borrow_mut() = Some((controller, webview));
                            });

                            Ok(())
                        }),
                    )
                    .map_err(|e| windows::core::Error::new(E_FAIL, format!("{e}")))?;
                    Ok(())
                }),
            )
            .map_err(|e| Error::Creation(format!("WebView2 init failed: {e}")))?;
        }

        // Retrieve the controller and webview from the completion callback
        let init_result = WEBVIEW_INIT_RESULT.with(|r| r.borrow_mut().take());
        if let Some((controller, webview)) = init_result {
            if let Some(entry) = self.windows.get_mut(&id) {
                entry.controller = Some(controller);
                entry.webview = Some(webview);
            }
        }

        Ok(())
    }

    fn load_url(&mut self, id: u32, url: &str) {
        let Some(entry) = self.windows.get_mut(&id) else {
            return;
        };
        if let Some(ref webview) = entry.webview {
            let url_wide: Vec<u16> = url.encode_utf16().chain(std::iter::once(0)).collect();
            PROGRAMMATIC_NAV.with(|f| {
                f.borrow_mut().insert(id);
            });
            unsafe {
                if let Err(e) = webview.Navigate(PCWSTR(url_wide.as_ptr())) {
                    tracing::warn!(window_id = id, "Navigate failed: {e}");
                }
            }
        }
        entry.loaded_content = Some(LoadedContent::Url);
    }

    fn load_html(&mut self, id: u32, html: &str) {
        let Some(entry) = self.windows.get_mut(&id) else {
            return;
        };
        if let Some(ref webview) = entry.webview {
            let html_wide: Vec<u16> = html.encode_utf16().chain(std::iter::once(0)).collect();
            // NavigateToString loads content at the about:blank origin; that
            // synthetic origin is exempt from allowed_hosts gating.
            PROGRAMMATIC_NAV.with(|f| {
                f.borrow_mut().insert(id);
            });
            unsafe {
                if let Err(e) = webview.NavigateToString(PCWSTR(html_wide.as_ptr())) {
                    tracing::warn!(window_id = id, "NavigateToString failed: {e}");
                }
            }
        }
        entry.loaded_content = Some(LoadedContent::Html(html.to_string()));
    }

    fn evaluate_script(&self, id: u32, source: &str) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        if let Some(ref webview) = entry.webview {
            let script_wide: Vec<u16> = source.encode_utf16().chain(std::iter::once(0)).collect();
            unsafe {
                if let Err(e) = webview.ExecuteScript(PCWSTR(script_wide.as_ptr()), None) {
                    tracing::warn!(window_id = id, "ExecuteScript failed: {e}");
                }
            }
        }
    }

    fn install_document_start_script(&self, id: u32, source: &str) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        if let Some(ref webview) = entry.webview {
            let script_wide: Vec<u16> = source.encode_utf16().chain(std::iter::once(0)).collect();
            unsafe {
                let _ = webview.AddScriptToExecuteOnDocumentCreated(
                    PCWSTR(script_wide.as_ptr()),
                    None,
                );
            }
        }
    }

    fn set_resizable(&self, id: u32, resizable: bool) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        unsafe {
            let style = GetWindowLongW(entry.hwnd, GWL_STYLE) as u32;
            let new_style = if resizable {
                style | WS_THICKFRAME.0 | WS_MAXIMIZEBOX.0
            } else {
                style & !WS_THICKFRAME.0 & !WS_MAXIMIZEBOX.0
            };
            SetWindowLongW(entry.hwnd, GWL_STYLE, new_style as i32);
            let _ = SetWindowPos(
                entry.hwnd,
                None,
                0,
                0,
                0,
                0,
                SWP_NOMOVE | SWP_NOSIZE | SWP_NOZORDER | SWP_FRAMECHANGED,
            );
        }
    }

    fn set_decorations(&self, id: u32, decorations: bool) {
        let Some(entry) = self.windows.get(&id) else {
            return;
        };
        unsafe {
            let style = GetWindowLongW(entry.hwnd, GWL_STYLE) as u32;
            let resizable = style & WS_THICKFRAME.0 != 0;
            let visible = style & WS_VISIBLE.0 != 0;
            let mut new_style = if decorations {
                WS_OVERLAPPEDWINDOW.0
            } else {
                WS_POPUP.0 | WS_SYSMENU.0
            };
            if !resizable {
                new_style &= !WS_THICKFRAME.0 & !WS_MAXIMIZEBOX.0;
            }
            if visible {
                new_style |= WS_VISIBLE.0;
            }
            SetWindowLongW(entry.hwnd, GWL_STYLE, new_style as i32);
            let _ = SetWindowPos(
                entry.hwnd,
                None,
                0,
                0,
                0,
                0,
                SWP_NOMOVE | SWP_NOSIZE | SWP_NOZORDER | SWP_FRAMECHANGED,
            );
        }
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
                if let Some(ref webview) = entry.webview {
                    unsafe {
                        if let Err(e) = webview.Reload() {
                            tracing::warn!(window_id = id, "Reload failed: {e}");
                        }
                    }
                }
            }
        }
    }

    fn get_cookies(&self, id: u32, url: Option<String>) {
        let Some(entry) = self.windows.get(&id) else {
            push_host_event(HostEvent::Cookies {
                id,
                json: "[]".to_string(),
            });
            return;
        };
        let Some(ref webview) = entry.webview else {
            push_host_event(HostEvent::Cookies {
                id,
                json: "[]".to_string(),
            });
            return;
        };

        // WebView2's cookie API is URL-scoped: an empty URI returns the
        // whole store, so the argument passes straight through.
        let uri = url.unwrap_or_default();
        let uri_wide: Vec<u16> = uri.encode_utf16().chain(std::iter::once(0)).collect();

        let result: windows::core::Result<()> = unsafe {
            let webview2: ICoreWebView2_2 = webview
                .cast()
                .map_err(|e| windows::core::Error::new(E_FAIL, format!("{e}")))?;
            let cookie_manager = webview2.CookieManager()?;
            cookie_manager.GetCookies(
                PCWSTR(uri_wide.as_ptr()),
                &webview2_com::GetCookiesCompletedHandler::create(Box::new(
                    move |result, cookie_list| {
                        result?;
                        let mut collected: Vec<CookieInfo> = Vec::new();
                        if let Some(cookie_list) = cookie_list {
                            let mut count = 0u32;
                            cookie_list.Count(&mut count)?;
                            for i in 0..count {
                                let cookie = cookie_list.GetValueAtIndex(i)?;
                                collected.push(convert_cookie(&cookie)?);
                            }
                        }
                        push_host_event(HostEvent::Cookies {
                            id,
                            json: cookies::serialize_cookies(&collected),
                        });
                        Ok(())
                    },
                )),
            )?;
            Ok(())
        };

        if let Err(e) = result {
            tracing::warn!(window_id = id, "GetCookies failed: {e}");
            push_host_event(HostEvent::Cookies {
                id,
                json: "[]".to_string(),
            });
        }
    }

    /// Remove a window's native resources and bookkeeping. Idempotent;
    /// reaps both explicit closes and user-initiated WM_DESTROY.
    pub fn destroy_window(&mut self, id: u32) {
        let Some(entry) = self.windows.remove(&id) else {
            return;
        };
        let hwnd_key = entry.hwnd.0 as isize;
        let still_mapped = HWND_MAP.with(|map| map.borrow_mut().remove(&hwnd_key).is_some());
        MINMAX.with(|m| {
            m.borrow_mut().remove(&hwnd_key);
        });
        self.hwnd_to_id.remove(&hwnd_key);
        if still_mapped {
            // Explicit close path: the OS window still exists.
            unsafe {
                let _ = DestroyWindow(entry.hwnd);
            }
        }
    }

    fn close(&mut self, id: u32) {
        // Remove the HWND mapping first so WM_DESTROY does not push a
        // second Closed event.
        self.destroy_window(id);
        push_host_event(HostEvent::Closed { id });
    }

    /// Flush deferred SetBounds calls queued by WM_SIZE while the platform
    /// struct was borrowed.
    fn flush_deferred(&mut self) {
        let pending: Vec<(u32, isize)> =
            PENDING_RESIZES.with(|p| std::mem::take(&mut *p.borrow_mut()));
        for (id, hwnd_val) in pending {
            if let Some(entry) = self.windows.get(&id) {
                if let Some(ref controller) = entry.controller {
                    let hwnd = HWND(hwnd_val as *mut _);
                    unsafe {
                        let mut rect = RECT::default();
                        let _ = GetClientRect(hwnd, &mut rect);
                        let _ = controller.SetBounds(rect);
                    }
                }
            }
        }
    }

    /// Pump the Windows message loop: process all pending messages without
    /// blocking.
    pub fn pump_events(&mut self) {
        unsafe {
            let mut msg = MSG::default();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
        self.flush_deferred();
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
                    let title_wide: Vec<u16> =
                        title.encode_utf16().chain(std::iter::once(0)).collect();
                    unsafe {
                        if let Err(e) = SetWindowTextW(entry.hwnd, PCWSTR(title_wide.as_ptr())) {
                            tracing::warn!(window_id = id, "SetWindowText failed: {e}");
                        }
                    }
                }
            }
            Command::SetSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = SetWindowPos(
                            entry.hwnd,
                            None,
                            0,
                            0,
                            width as i32,
                            height as i32,
                            SWP_NOMOVE | SWP_NOZORDER,
                        );
                    }
                }
            }
            Command::SetMinSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    MINMAX.with(|m| {
                        let mut map = m.borrow_mut();
                        let slot = map.entry(entry.hwnd.0 as isize).or_insert((None, None));
                        slot.0 = Some((width, height));
                    });
                }
            }
            Command::SetMaxSize { id, width, height } => {
                if let Some(entry) = self.windows.get(&id) {
                    MINMAX.with(|m| {
                        let mut map = m.borrow_mut();
                        let slot = map.entry(entry.hwnd.0 as isize).or_insert((None, None));
                        slot.1 = Some((width, height));
                    });
                }
            }
            Command::SetPosition { id, x, y } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = SetWindowPos(
                            entry.hwnd,
                            None,
                            x as i32,
                            y as i32,
                            0,
                            0,
                            SWP_NOSIZE | SWP_NOZORDER,
                        );
                    }
                }
            }
            Command::SetResizable { id, resizable } => self.set_resizable(id, resizable),
            Command::SetDecorations { id, decorations } => self.set_decorations(id, decorations),
            Command::SetAlwaysOnTop { id, always_on_top } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let insert_after = if always_on_top {
                            HWND_TOPMOST
                        } else {
                            HWND_NOTOPMOST
                        };
                        let _ = SetWindowPos(
                            entry.hwnd,
                            insert_after,
                            0,
                            0,
                            0,
                            0,
                            SWP_NOMOVE | SWP_NOSIZE,
                        );
                    }
                }
            }
            Command::Show { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = ShowWindow(entry.hwnd, SW_SHOW);
                    }
                }
            }
            Command::Hide { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = ShowWindow(entry.hwnd, SW_HIDE);
                    }
                }
            }
            Command::Close { id } => self.close(id),
            Command::Focus { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = SetForegroundWindow(entry.hwnd);
                        let _ = SetFocus(entry.hwnd);
                    }
                }
            }
            Command::Maximize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = ShowWindow(entry.hwnd, SW_MAXIMIZE);
                    }
                }
            }
            Command::Minimize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = ShowWindow(entry.hwnd, SW_MINIMIZE);
                    }
                }
            }
            Command::Unmaximize { id } => {
                if let Some(entry) = self.windows.get(&id) {
                    unsafe {
                        let _ = ShowWindow(entry.hwnd, SW_RESTORE);
                    }
                }
            }
            Command::Reload { id } => {
                self.reload(id);
                push_host_event(HostEvent::Reload { id });
            }
            Command::GetCookies { id, url } => self.get_cookies(id, url),
            Command::SetIcon { id, path } => {
                if let Some(entry) = self.windows.get(&id) {
                    match create_hicon(&path) {
                        Ok(hicon) => unsafe {
                            SendMessageW(
                                entry.hwnd,
                                WM_SETICON,
                                WPARAM(ICON_BIG as usize),
                                LPARAM(hicon.0 as isize),
                            );
                        },
                        Err(e) => tracing::warn!(window_id = id, "icon load failed: {e}"),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Decode a PNG or ICO file into an HICON. For ICO files the entry with the
/// highest color depth and largest size is selected by the decoder.
/// Relative paths resolve against the process working directory.
fn create_hicon(path: &str) -> Result<HICON> {
    let img = image::open(path)
        .map_err(|e| Error::Platform(format!("failed to load icon '{path}': {e}")))?;
    let rgba = img.into_rgba8();
    let (width, height) = rgba.dimensions();
    let mut bgra = rgba.into_raw();
    for px in bgra.chunks_exact_mut(4) {
        px.swap(0, 2);
    }

    unsafe {
        let color = CreateBitmap(
            width as i32,
            height as i32,
            1,
            32,
            Some(bgra.as_ptr() as *const _),
        );
        let mask = CreateBitmap(width as i32, height as i32, 1, 1, None);
        let info = ICONINFO {
            fIcon: TRUE,
            xHotspot: 0,
            yHotspot: 0,
            hbmMask: mask,
            hbmColor: color,
        };
        let hicon = CreateIconIndirect(&info)
            .map_err(|e| Error::Platform(format!("CreateIconIndirect failed: {e}")));
        let _ = DeleteObject(color.into());
        let _ = DeleteObject(mask.into());
        hicon
    }
}

/// Convert an ICoreWebView2Cookie into the wire record shape.
unsafe fn convert_cookie(cookie: &ICoreWebView2Cookie) -> windows::core::Result<CookieInfo> {
    let mut name = PWSTR::null();
    cookie.Name(&mut name)?;
    let name_str = name.to_string().unwrap_or_default();
    if !name.is_null() {
        CoTaskMemFree(Some(name.0 as *const _));
    }

    let mut value = PWSTR::null();
    cookie.Value(&mut value)?;
    let value_str = value.to_string().unwrap_or_default();
    if !value.is_null() {
        CoTaskMemFree(Some(value.0 as *const _));
    }

    let mut domain = PWSTR::null();
    cookie.Domain(&mut domain)?;
    let domain_str = domain.to_string().unwrap_or_default();
    if !domain.is_null() {
        CoTaskMemFree(Some(domain.0 as *const _));
    }

    let mut path = PWSTR::null();
    cookie.Path(&mut path)?;
    let path_str = path.to_string().unwrap_or_default();
    if !path.is_null() {
        CoTaskMemFree(Some(path.0 as *const _));
    }

    let mut http_only = BOOL::default();
    cookie.IsHttpOnly(&mut http_only)?;

    let mut secure = BOOL::default();
    cookie.IsSecure(&mut secure)?;

    // Unix seconds; WebView2 reports -1 for session cookies.
    let mut expires = 0.0f64;
    cookie.Expires(&mut expires)?;
    let expires = if expires < 0.0 {
        SESSION_EXPIRES
    } else {
        expires as i64
    };

    let mut same_site = COREWEBVIEW2_COOKIE_SAME_SITE_KIND(0);
    cookie.SameSite(&mut same_site)?;
    let same_site = if same_site == COREWEBVIEW2_COOKIE_SAME_SITE_KIND_LAX {
        SameSite::Lax
    } else if same_site == COREWEBVIEW2_COOKIE_SAME_SITE_KIND_STRICT {
        SameSite::Strict
    } else {
        SameSite::None
    };

    Ok(CookieInfo {
        name: name_str,
        value: value_str,
        domain: domain_str,
        path: path_str,
        http_only: http_only.as_bool(),
        secure: secure.as_bool(),
        same_site,
        expires,
    })
}
