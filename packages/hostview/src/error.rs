use thiserror::Error;

/// Result type alias for hostview operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the windowing core and the typed channel.
#[derive(Error, Debug)]
pub enum Error {
    /// The window system has not been initialized, or initialization failed.
    #[error("window system not initialized: {0}")]
    Init(String),

    /// Engine or OS failure while building a window. Detected on the pump
    /// tick that processes the creation command — the constructor has
    /// already handed out a handle by then; the failure closes that handle
    /// through the normal close path, and the error is returned from that
    /// `pump_events` call.
    #[error("window creation failed: {0}")]
    Creation(String),

    /// An API call against a window that has already been closed.
    #[error("window {0} is closed")]
    WindowClosed(u32),

    /// The platform engine rejected a state change.
    #[error("platform error: {0}")]
    Platform(String),

    /// Webview runtime detection or installation failed.
    #[error("webview runtime error: {0}")]
    Runtime(String),

    /// JSON encoding of an outgoing payload failed, or a cookie query
    /// response could not be parsed into `CookieInfo` records.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL was rejected before being handed to the engine.
    #[error("blocked URL: {0}")]
    BlockedUrl(String),

    /// This build has no webview back-end for the current target.
    #[error("unsupported platform: only macOS and Windows are supported")]
    UnsupportedPlatform,
}
