//! Cookie records returned by [`NativeWindow::get_cookies`].
//!
//! The platform back-ends serialize the engine cookie store (including
//! HttpOnly cookies) to a JSON array of these records; the façade parses
//! that payload back into typed values when fulfilling the future.
//!
//! [`NativeWindow::get_cookies`]: crate::NativeWindow::get_cookies

use serde::{Deserialize, Serialize};

/// Timestamp value used for session cookies (no expiry).
pub const SESSION_EXPIRES: i64 = -1;

/// SameSite attribute of a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    #[default]
    None,
    Lax,
    Strict,
}

/// One cookie from the engine's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieInfo {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
    /// Unix timestamp in seconds; [`SESSION_EXPIRES`] for session cookies.
    #[serde(default = "default_expires")]
    pub expires: i64,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_expires() -> i64 {
    SESSION_EXPIRES
}

/// Parse the JSON array delivered by a platform back-end.
pub fn parse_cookies(json: &str) -> crate::Result<Vec<CookieInfo>> {
    Ok(serde_json::from_str(json)?)
}

/// Serialize cookie records to the wire shape the back-ends emit.
pub fn serialize_cookies(cookies: &[CookieInfo]) -> String {
    serde_json::to_string(cookies).unwrap_or_else(|_| "[]".to_string())
}

/// Keep only cookies visible to `url`: exact domain match (with leading-dot
/// domain cookies matching the host and its subdomains) and path-prefix
/// match. Used on engines whose cookie API returns the whole store.
pub fn filter_cookies_for_url(cookies: Vec<CookieInfo>, url: &str) -> Vec<CookieInfo> {
    let parsed = match url::Url::parse(url) {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };
    let host = match parsed.host_str() {
        Some(h) => h.to_lowercase(),
        None => return Vec::new(),
    };
    let path = parsed.path();

    cookies
        .into_iter()
        .filter(|c| {
            let domain = c.domain.to_lowercase();
            let domain_ok = if let Some(bare) = domain.strip_prefix('.') {
                host == bare || host.ends_with(&format!(".{bare}"))
            } else {
                host == domain
            };
            domain_ok && path.starts_with(&c.path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_payload() {
        let json = r#"[{"name":"sid","value":"abc","domain":".app.local","path":"/",
            "httpOnly":true,"secure":true,"sameSite":"lax","expires":1924992000}]"#;
        let cookies = parse_cookies(json).unwrap();
        assert_eq!(cookies.len(), 1);
        let c = &cookies[0];
        assert_eq!(c.name, "sid");
        assert!(c.http_only);
        assert_eq!(c.same_site, SameSite::Lax);
        assert_eq!(c.expires, 1924992000);
    }

    #[test]
    fn session_cookie_defaults() {
        let json = r#"[{"name":"t","value":"1"}]"#;
        let c = &parse_cookies(json).unwrap()[0];
        assert_eq!(c.expires, SESSION_EXPIRES);
        assert_eq!(c.path, "/");
        assert_eq!(c.same_site, SameSite::None);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_cookies("{\"not\":\"an array\"}").is_err());
        assert!(parse_cookies("[{\"value\":\"missing name\"}]").is_err());
    }

    #[test]
    fn round_trips_through_wire_shape() {
        let cookies = vec![CookieInfo {
            name: "a".into(),
            value: "b".into(),
            domain: "app.local".into(),
            path: "/x".into(),
            http_only: false,
            secure: true,
            same_site: SameSite::Strict,
            expires: SESSION_EXPIRES,
        }];
        let json = serialize_cookies(&cookies);
        assert!(json.contains("\"sameSite\":\"strict\""));
        assert!(json.contains("\"httpOnly\":false"));
        assert_eq!(parse_cookies(&json).unwrap(), cookies);
    }

    #[test]
    fn url_filter_matches_domain_and_path_prefix() {
        let all = vec![
            CookieInfo {
                name: "exact".into(),
                value: "1".into(),
                domain: "app.local".into(),
                path: "/".into(),
                http_only: false,
                secure: false,
                same_site: SameSite::None,
                expires: SESSION_EXPIRES,
            },
            CookieInfo {
                name: "dotted".into(),
                value: "2".into(),
                domain: ".app.local".into(),
                path: "/api".into(),
                http_only: false,
                secure: false,
                same_site: SameSite::None,
                expires: SESSION_EXPIRES,
            },
            CookieInfo {
                name: "other".into(),
                value: "3".into(),
                domain: "other.net".into(),
                path: "/".into(),
                http_only: false,
                secure: false,
                same_site: SameSite::None,
                expires: SESSION_EXPIRES,
            },
        ];
        let got = filter_cookies_for_url(all.clone(), "https://sub.app.local/api/v1");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "dotted");

        let got = filter_cookies_for_url(all, "https://app.local/");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "exact");
    }
}
