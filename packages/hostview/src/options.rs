use crate::policy::PermissionFlags;

/// Options for creating a new native window.
///
/// Construct with struct-update syntax over [`WindowOptions::default`]:
///
/// ```
/// use hostview::WindowOptions;
/// let opts = WindowOptions {
///     title: "demo".into(),
///     width: 1024.0,
///     ..Default::default()
/// };
/// ```
///
/// Security: when loading untrusted content, use the `csp` field to restrict
/// what the page can do. Without a CSP, loaded content can execute inline
/// scripts and load resources from any origin.
#[derive(Debug, Clone)]
pub struct WindowOptions {
    /// Window title. Default: ""
    pub title: String,
    /// Inner width in logical pixels. Default: 800
    pub width: f64,
    /// Inner height in logical pixels. Default: 600
    pub height: f64,
    /// X position in screen coordinates. Default: OS-chosen.
    pub x: Option<f64>,
    /// Y position in screen coordinates. Default: OS-chosen.
    pub y: Option<f64>,
    /// Minimum inner size (width, height).
    pub min_size: Option<(f64, f64)>,
    /// Maximum inner size (width, height).
    pub max_size: Option<(f64, f64)>,
    /// Allow resizing. Default: true
    pub resizable: bool,
    /// Show window decorations (title bar, borders). Default: true
    pub decorations: bool,
    /// Transparent window background. Default: false
    pub transparent: bool,
    /// Always on top of other windows. Default: false
    pub always_on_top: bool,
    /// Initially visible. Default: true
    pub visible: bool,
    /// Enable devtools. Default: false
    pub devtools: bool,
    /// Content Security Policy to inject via a `<meta>` tag at document start.
    /// When set, a `<meta http-equiv="Content-Security-Policy" content="...">`
    /// tag is injected before any page scripts run.
    ///
    /// Example: `"default-src 'self'; script-src 'self' 'unsafe-inline'"`
    pub csp: Option<String>,
    /// Trusted origins for IPC messages at the native layer.
    /// When non-empty, only messages whose source URL origin matches one of
    /// these entries are forwarded to the host. Messages from other origins
    /// are silently dropped. Each entry should be a full origin string, e.g.
    /// `"https://example.com"` (scheme + host + optional port, no trailing
    /// slash). Entries are normalized through the WHATWG URL parser; entries
    /// that do not parse are dropped silently.
    ///
    /// This is a defense-in-depth mechanism. For application-level origin
    /// filtering, use [`ChannelOptions::trusted_origins`].
    ///
    /// [`ChannelOptions::trusted_origins`]: crate::channel::ChannelOptions
    pub trusted_origins: Vec<String>,
    /// Allowed hosts for navigation restriction.
    /// When non-empty, ALL navigations (programmatic and user-initiated) are
    /// restricted to URLs whose host matches one of these patterns. Supports
    /// wildcard prefixes: `"*.example.com"` matches any subdomain of
    /// example.com (and example.com itself). Empty = all hosts allowed.
    ///
    /// Internal navigations (`about:blank`, the `load_html()` synthetic
    /// origin) are always permitted regardless of this setting.
    pub allowed_hosts: Vec<String>,
    /// Allow the webview to access the camera when requested.
    /// Default: false (all camera permission requests are denied).
    pub allow_camera: bool,
    /// Allow the webview to access the microphone when requested.
    /// Default: false (all microphone permission requests are denied).
    pub allow_microphone: bool,
    /// Allow the webview to use the File System Access API
    /// (showOpenFilePicker, showSaveFilePicker, showDirectoryPicker).
    /// Default: false (all file system access requests are denied).
    pub allow_file_system: bool,
    /// Allow the webview to access geolocation when requested.
    /// Default: false (navigator.geolocation is removed from the page).
    pub allow_geolocation: bool,
    /// Path to a PNG or ICO file for the window icon (title bar).
    /// On macOS this option is silently ignored (macOS doesn't support
    /// per-window icons). Relative paths resolve from the working directory.
    pub icon: Option<String>,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            width: 800.0,
            height: 600.0,
            x: None,
            y: None,
            min_size: None,
            max_size: None,
            resizable: true,
            decorations: true,
            transparent: false,
            always_on_top: false,
            visible: true,
            devtools: false,
            csp: None,
            trusted_origins: Vec::new(),
            allowed_hosts: Vec::new(),
            allow_camera: false,
            allow_microphone: false,
            allow_file_system: false,
            allow_geolocation: false,
            icon: None,
        }
    }
}

impl WindowOptions {
    /// Collapse the permission fields into the flags stored in the policy map.
    pub(crate) fn permission_flags(&self) -> PermissionFlags {
        PermissionFlags {
            camera: self.allow_camera,
            microphone: self.allow_microphone,
            file_system: self.allow_file_system,
            geolocation: self.allow_geolocation,
        }
    }
}
