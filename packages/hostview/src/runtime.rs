//! Webview runtime detection and installation.
//!
//! macOS ships WKWebView as a system framework, so detection is trivial
//! and installation is a no-op. Windows needs the WebView2 Evergreen
//! runtime; [`ensure_runtime`] can fetch Microsoft's bootstrapper and run
//! it, treating the downloaded binary as hostile until its Authenticode
//! signature and signer have been checked from Rust.

use crate::error::Result;

/// Information about the native webview runtime.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    /// Whether the webview runtime is available.
    pub available: bool,
    /// The version string of the runtime, if available.
    pub version: Option<String>,
    /// The current platform: "macos", "windows", or "unsupported".
    pub platform: &'static str,
}

/// Check if the native webview runtime is available. Never touches the
/// network.
///
/// - **macOS**: always available (WKWebView is part of the OS).
/// - **Windows**: probes the registered WebView2 browser version.
/// - **Other**: unavailable, platform "unsupported".
pub fn check_runtime() -> RuntimeInfo {
    #[cfg(target_os = "macos")]
    {
        RuntimeInfo {
            available: true,
            version: None,
            platform: "macos",
        }
    }

    #[cfg(target_os = "windows")]
    {
        let version = webview2::installed_version();
        RuntimeInfo {
            available: version.is_some(),
            version,
            platform: "windows",
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        RuntimeInfo {
            available: false,
            version: None,
            platform: "unsupported",
        }
    }
}

/// Make sure the webview runtime is present, installing it when the
/// platform supports that.
///
/// On Windows a missing runtime triggers a download of the Evergreen
/// bootstrapper (~2 MB) from Microsoft's stable link and a silent,
/// system-wide install, after which the runtime is probed again. Call
/// [`check_runtime`] first if you only want to know the current state.
///
/// **Do not call this while elevated (Administrator) without explicit
/// user consent** — the silent installer applies system-wide.
///
/// # Security
///
/// This function downloads and executes a binary from the internet. The
/// binary runs only if every step of the chain holds:
///
/// - the URL is a compile-time constant (Microsoft's
///   `go.microsoft.com/fwlink` redirect), never derived from input;
/// - the download must be at least 1 KB, rejecting truncated or
///   intercepted responses;
/// - the Authenticode status must be `Valid` **and** the signer subject
///   must name Microsoft Corporation — both read back into Rust and
///   checked here, so an inspection failure of any kind means nothing
///   executes;
/// - the installer file is deleted when the flow exits, on success and on
///   every error path alike.
pub fn ensure_runtime() -> Result<RuntimeInfo> {
    #[cfg(target_os = "macos")]
    {
        Ok(check_runtime())
    }

    #[cfg(target_os = "windows")]
    {
        let current = check_runtime();
        if current.available {
            return Ok(current);
        }
        webview2::install()?;
        let after = check_runtime();
        if after.available {
            Ok(after)
        } else {
            Err(crate::error::Error::Runtime(
                "WebView2 installed without error but the runtime still does not probe; \
                 restart the application or install manually from \
                 https://developer.microsoft.com/microsoft-edge/webview2/"
                    .to_string(),
            ))
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Err(crate::error::Error::UnsupportedPlatform)
    }
}

#[cfg(target_os = "windows")]
mod webview2 {
    use std::path::{Path, PathBuf};
    use std::process::{Command, Output};

    use webview2_com::Microsoft::Web::WebView2::Win32::GetAvailableCoreWebView2BrowserVersionString;
    use windows::core::PWSTR;

    use crate::error::{Error, Result};

    /// Microsoft's stable redirect to the Evergreen bootstrapper.
    const BOOTSTRAPPER_URL: &str = "https://go.microsoft.com/fwlink/p/?LinkId=2124703";

    /// Downloads smaller than this are treated as truncated or intercepted.
    const MIN_BOOTSTRAPPER_BYTES: u64 = 1024;

    /// The registered WebView2 browser version, or `None` when no usable
    /// runtime is installed.
    pub(super) fn installed_version() -> Option<String> {
        unsafe {
            let mut raw = PWSTR::null();
            if GetAvailableCoreWebView2BrowserVersionString(None, &mut raw).is_err()
                || raw.is_null()
            {
                return None;
            }
            let version = raw.to_string().ok();
            windows::Win32::System::Com::CoTaskMemFree(Some(raw.0 as *const _));
            // An empty or all-zero version string means the probe found a
            // registration stub, not a runtime.
            version.filter(|v| !v.is_empty() && v != "0.0.0.0")
        }
    }

    /// Fetch, verify, and silently run the bootstrapper.
    pub(super) fn install() -> Result<()> {
        let download = fetch_bootstrapper()?;
        verify_microsoft_signature(download.path())?;
        run_silent_install(download.path())
        // `download` drops here, deleting the installer file.
    }

    /// Owns the downloaded installer file; deletes it on drop so no exit
    /// path can leave the binary behind.
    struct Download(PathBuf);

    impl Download {
        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for Download {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    /// Run a PowerShell snippet non-interactively. PowerShell is the one
    /// dependable downloader and signature reader on a machine that, by
    /// definition, has no WebView2 yet.
    fn powershell(snippet: &str) -> Result<Output> {
        Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", snippet])
            .output()
            .map_err(|e| Error::Runtime(format!("cannot launch PowerShell: {e}")))
    }

    /// Single-quote a path for embedding in a PowerShell snippet.
    fn ps_quote(path: &Path) -> String {
        format!("'{}'", path.to_string_lossy().replace('\'', "''"))
    }

    fn fetch_bootstrapper() -> Result<Download> {
        let guard = Download(std::env::temp_dir().join("MicrosoftEdgeWebview2Setup.exe"));
        let output = powershell(&format!(
            "Invoke-WebRequest -Uri '{BOOTSTRAPPER_URL}' -OutFile {} -UseBasicParsing",
            ps_quote(guard.path())
        ))?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "bootstrapper download failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let size = std::fs::metadata(guard.path())
            .map_err(|e| Error::Runtime(format!("bootstrapper missing after download: {e}")))?
            .len();
        if size < MIN_BOOTSTRAPPER_BYTES {
            return Err(Error::Runtime(format!(
                "bootstrapper is {size} bytes, under the {MIN_BOOTSTRAPPER_BYTES}-byte floor; \
                 refusing a likely truncated download"
            )));
        }
        Ok(guard)
    }

    /// Read the Authenticode status and signer subject back into Rust and
    /// make the trust decision here: a `Valid` signature from a Microsoft
    /// Corporation subject is the only combination that may execute.
    fn verify_microsoft_signature(installer: &Path) -> Result<()> {
        let output = powershell(&format!(
            "$sig = Get-AuthenticodeSignature -FilePath {}; \
             Write-Output $sig.Status; \
             Write-Output $sig.SignerCertificate.Subject",
            ps_quote(installer)
        ))?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "signature inspection failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().map(str::trim);
        let status = lines.next().unwrap_or_default();
        let signer = lines.next().unwrap_or_default();
        if status != "Valid" {
            return Err(Error::Runtime(format!(
                "bootstrapper signature status is {status:?}, expected Valid"
            )));
        }
        if !signer.contains("O=Microsoft Corporation") {
            return Err(Error::Runtime(format!(
                "bootstrapper signer is {signer:?}, expected a Microsoft Corporation subject"
            )));
        }
        Ok(())
    }

    fn run_silent_install(installer: &Path) -> Result<()> {
        let output = Command::new(installer)
            .args(["/silent", "/install"])
            .output()
            .map_err(|e| Error::Runtime(format!("cannot start the bootstrapper: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Runtime(format!(
                "bootstrapper exited with {}",
                output.status
            )))
        }
    }
}
