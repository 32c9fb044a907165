//! Generation of every script the core injects into pages.
//!
//! The document-start bundle is composed, in order, of: the frozen
//! `window.ipc` bridge, the CSP `<meta>` inserter, permission shims, the
//! `window.open` override, and the dangerous-scheme DOM hardening patches.
//! The typed-channel client is generated separately and installed by
//! [`Channel`](crate::channel::Channel), which decides when a page may see
//! the bridge at all.
//!
//! The exact byte-level layout of these templates is an external interface:
//! tests assert literal substrings for the hardening properties.

use crate::options::WindowOptions;
use crate::policy::{json_escape, PermissionFlags};

/// Frozen `window.ipc` definition. `native_post` is the engine-native
/// posting expression, e.g.
/// `window.webkit.messageHandlers.ipc.postMessage.bind(...)` on WebKit or
/// `window.chrome.webview.postMessage.bind(...)` on WebView2. The native
/// reference is captured before any page script runs so a page cannot
/// intercept the pathway, and `postMessage` is installed non-writable and
/// non-configurable.
pub(crate) fn bridge_script(native_post: &str) -> String {
    format!(
        "(function(){{var _post={native_post};\
         Object.defineProperty(window,'ipc',{{value:Object.freeze({{postMessage:function(msg){{_post(msg)}}}}),\
         writable:false,configurable:false}})}})();"
    )
}

/// Insert a `<meta http-equiv="Content-Security-Policy">` tag at the
/// earliest DOM-ready moment. The CSP value is embedded via [`json_escape`]
/// so newlines, quotes, and `</script>` cannot break out of the literal.
pub(crate) fn csp_script(csp: &str) -> String {
    let safe_csp = json_escape(csp);
    format!(
        "document.addEventListener('DOMContentLoaded',function(){{\
         var m=document.createElement('meta');\
         m.httpEquiv='Content-Security-Policy';\
         m.content={safe_csp};\
         document.head.insertBefore(m,document.head.firstChild)}},{{once:true}});"
    )
}

/// Shims for permissions the window denies. The engine permission callback
/// layer is the primary enforcement; these pre-empt the APIs in-page so a
/// denied request fails fast instead of waiting on a callback round-trip.
pub(crate) fn permission_shim_script(flags: &PermissionFlags) -> String {
    let mut out = String::from("(function(){");
    if !flags.geolocation {
        out.push_str("try{delete navigator.geolocation}catch(e){}");
    }
    if !flags.camera || !flags.microphone {
        let video_check = if flags.camera { "" } else { "if(c&&c.video)return _deny();" };
        let audio_check = if flags.microphone { "" } else { "if(c&&c.audio)return _deny();" };
        out.push_str(&format!(
            "try{{if(navigator.mediaDevices&&navigator.mediaDevices.getUserMedia){{\
             var _gum=navigator.mediaDevices.getUserMedia.bind(navigator.mediaDevices);\
             var _deny=function(){{return Promise.reject(new DOMException('Permission denied','NotAllowedError'))}};\
             navigator.mediaDevices.getUserMedia=function(c){{{video_check}{audio_check}return _gum(c)}}\
             }}}}catch(e){{}}"
        ));
    }
    out.push_str("})();");
    out
}

/// Unconditional `window.open` override. Popups are always denied; the
/// engine-level new-window handlers are the second layer.
pub(crate) const WINDOW_OPEN_OVERRIDE: &str = "(function(){try{Object.defineProperty(window,'open',\
    {value:function(){return null},writable:false,configurable:false})}catch(e){window.open=function(){return null}}})();";

/// JS-level dangerous-scheme blocking — patches that prevent `data:`,
/// `file:`, and `blob:` URIs from executing in the webview via DOM element
/// properties, anchor clicks, and dynamic element injection.
///
/// NOTE: `javascript:` is intentionally NOT blocked here. It can only be
/// triggered by code already running in the webview (client-side JS), so
/// blocking it adds no security value. On WebView2 (Chromium),
/// Location.prototype is non-configurable at the C++ level, making JS-level
/// interception impossible anyway. `javascript:` is still blocked by the
/// native navigation handlers and the Rust `load_url()` allowlist.
///
/// Each section is wrapped in its own try/catch so that a failure in one
/// patch never disables subsequent protections.
pub(crate) const SCHEME_HARDENING_SCRIPT: &str = r#"(function () {
  var BLOCKED_SCHEMES = ["data:", "file:", "blob:"];

  function isBlocked(url) {
    var lower = (url + "").trim().toLowerCase();
    return BLOCKED_SCHEMES.some(function (scheme) {
      return lower.startsWith(scheme);
    });
  }

  // Helper: try to redefine an accessor property on a target object.
  // Returns true on success, false if the property is non-configurable.
  function tryPatchAccessor(target, prop, wrapSet) {
    try {
      var d = Object.getOwnPropertyDescriptor(target, prop);
      if (d && d.set) {
        var orig = d.set;
        Object.defineProperty(target, prop, {
          set: wrapSet(orig),
          get: d.get,
          enumerable: d.enumerable,
          configurable: d.configurable,
        });
        return true;
      }
    } catch (e) {}
    return false;
  }

  // Helper: try to redefine a data (method) property via defineProperty.
  // Direct assignment (proto.method = fn) silently fails when writable is false.
  function tryPatchMethod(target, prop, wrapFn) {
    try {
      var d = Object.getOwnPropertyDescriptor(target, prop);
      if (d && typeof d.value === "function") {
        var orig = d.value;
        Object.defineProperty(target, prop, {
          value: wrapFn(orig),
          writable: d.writable,
          enumerable: d.enumerable,
          configurable: d.configurable,
        });
        return true;
      }
    } catch (e) {}
    return false;
  }

  // ---- Location patches (href setter) ----
  // On Chromium/WebView2, Location.prototype.href is configurable: false,
  // so the first attempt throws. We try multiple levels:
  //   1. Location.prototype
  //   2. Object.getPrototypeOf(location) (may differ from Location.prototype)
  //   3. Own property on the location instance itself
  var hrefWrap = function (orig) {
    return function (value) {
      if (!isBlocked(value)) orig.call(this, value);
    };
  };
  if (!tryPatchAccessor(Location.prototype, "href", hrefWrap)) {
    try {
      var locProto = Object.getPrototypeOf(location);
      if (locProto && locProto !== Location.prototype) {
        tryPatchAccessor(locProto, "href", hrefWrap);
      }
    } catch (e) {}
    // Last resort: try defining an own property on the location instance.
    try {
      var ld = Object.getOwnPropertyDescriptor(location, "href")
            || Object.getOwnPropertyDescriptor(Object.getPrototypeOf(location), "href");
      if (ld && ld.set) {
        var origLocSet = ld.set;
        Object.defineProperty(location, "href", {
          set: function (value) {
            if (!isBlocked(value)) origLocSet.call(this, value);
          },
          get: ld.get,
          enumerable: true,
          configurable: true,
        });
      }
    } catch (e) {}
  }

  // ---- Location patches (assign / replace) ----
  // Use defineProperty instead of direct assignment — direct assignment
  // silently fails when the property is non-writable on Chromium.
  var assignWrap = function (orig) {
    return function (url) {
      if (!isBlocked(url)) orig.call(this, url);
    };
  };
  tryPatchMethod(Location.prototype, "assign", assignWrap);
  tryPatchMethod(Location.prototype, "replace", assignWrap);

  // ---- Click listener for <a>/<area> with blocked-scheme hrefs ----
  // Capturing phase so it fires before any page-level handlers.
  // Walks up the DOM to handle clicks on child elements inside anchors.
  try {
    document.addEventListener("click", function (e) {
      var t = e.target;
      while (t && t !== document) {
        if ((t.tagName === "A" || t.tagName === "AREA") && t.href && isBlocked(t.href)) {
          e.preventDefault();
          e.stopImmediatePropagation();
          return;
        }
        t = t.parentElement;
      }
    }, true);
  } catch (e) {}

  // ---- DOM property setter patches ----
  // Block setting dangerous-scheme URLs on element properties that
  // can trigger navigation or script execution.
  var setterWrap = function (orig) {
    return function (v) { if (!isBlocked(v)) orig.call(this, v); };
  };
  try { tryPatchAccessor(HTMLAnchorElement.prototype, "href", setterWrap); } catch (e) {}
  try { tryPatchAccessor(HTMLAreaElement.prototype, "href", setterWrap); } catch (e) {}
  try { tryPatchAccessor(HTMLIFrameElement.prototype, "src", setterWrap); } catch (e) {}
  try { tryPatchAccessor(HTMLFormElement.prototype, "action", setterWrap); } catch (e) {}

  // ---- MutationObserver for dynamically injected elements ----
  // Sanitizes elements added via innerHTML, insertAdjacentHTML, etc.
  try {
    function sanitize(el) {
      var tag = el.tagName;
      if ((tag === "A" || tag === "AREA") && el.hasAttribute("href") && isBlocked(el.getAttribute("href"))) {
        el.removeAttribute("href");
      } else if (tag === "IFRAME" && el.hasAttribute("src") && isBlocked(el.getAttribute("src"))) {
        el.removeAttribute("src");
      } else if (tag === "FORM" && el.hasAttribute("action") && isBlocked(el.getAttribute("action"))) {
        el.removeAttribute("action");
      }
    }
    var root = document.documentElement || document;
    new MutationObserver(function (mutations) {
      mutations.forEach(function (m) {
        m.addedNodes.forEach(function (n) {
          if (n.nodeType === 1) {
            sanitize(n);
            if (n.querySelectorAll) {
              n.querySelectorAll("a[href],area[href],iframe[src],form[action]").forEach(sanitize);
            }
          }
        });
      });
    }).observe(root, { childList: true, subtree: true });
  } catch (e) {}
})();"#;

/// Compose the document-start bundle installed into every new document of a
/// window: bridge, CSP, permission shims, `window.open` override, scheme
/// hardening. The typed-channel client is not part of this bundle — it is
/// installed by `Channel`, which gates exposure by origin.
pub(crate) fn compose_document_start(native_post: &str, options: &WindowOptions) -> String {
    let mut parts = vec![bridge_script(native_post)];
    if let Some(ref csp) = options.csp {
        parts.push(csp_script(csp));
    }
    parts.push(permission_shim_script(&options.permission_flags()));
    parts.push(WINDOW_OPEN_OVERRIDE.to_string());
    parts.push(SCHEME_HARDENING_SCRIPT.to_string());
    parts.join("\n")
}

/// Script that delivers one host→page message through the installed
/// dispatcher. The message is embedded via [`json_escape`] — handles all
/// control chars, quotes, backslashes, and `</script>` in a single pass.
pub(crate) fn post_message_script(message: &str) -> String {
    let safe_msg = json_escape(message);
    format!("if(window.__native_message__)window.__native_message__({safe_msg});")
}

/// Generate the typed-channel client installed into pages.
///
/// The client must survive hostile pages: the document may run arbitrary
/// scripts after the document-start bundle but before any observable page
/// action, so every prototype method the client depends on is captured into
/// locals at the very top, and the three globals are each installed with a
/// single `defineProperty` call whose value is fully prepared beforehand —
/// never assigned and then frozen.
///
/// Listener storage is keyed by the full prefixed event name, so dispatch
/// needs no string manipulation at all: a message whose `$ch` lacks the
/// channel prefix simply matches no key and falls through to external
/// listeners and the previously installed handler.
pub fn client_script(channel_id: Option<&str>, max_message_size: usize) -> String {
    let pfx = json_escape(channel_id.unwrap_or(""));
    format!(
        r#"(function () {{
  var _slice = Array.prototype.slice;
  var _filter = Array.prototype.filter;
  var _push = Array.prototype.push;
  var _indexOf = Array.prototype.indexOf;
  var _splice = Array.prototype.splice;
  var _stringify = JSON.stringify;
  var _parse = JSON.parse;
  var _defineProperty = Object.defineProperty;
  var _freeze = Object.freeze;
  var _create = Object.create;
  var _hasOwn = Object.prototype.hasOwnProperty;
  if (window.__channel__) return;
  var _pfx = {pfx};
  var _max = {max_message_size};
  var _l = _create(null);
  var _el = [];
  var _orig = window.__native_message__;
  function _key(t) {{ return _pfx ? _pfx + ":" + t : t; }}
  function _e(t, p) {{
    var env = {{ $ch: _key(t) }};
    if (p !== undefined) env.p = p;
    return _stringify(env);
  }}
  function _d(r) {{
    if (typeof r !== "string" || r.length > _max) return null;
    var v;
    try {{ v = _parse(r); }} catch (err) {{ return null; }}
    if (v && typeof v === "object") {{
      if (_hasOwn.call(v, "__proto__")) delete v["__proto__"];
      if (typeof v.$ch === "string") return v;
    }}
    return null;
  }}
  function _fallthrough(msg) {{
    var ext = _slice.call(_el);
    for (var i = 0; i < ext.length; i++) {{
      try {{ ext[i](msg); }} catch (err) {{}}
    }}
    if (typeof _orig === "function") {{
      try {{ _orig(msg); }} catch (err) {{}}
    }}
  }}
  function _dispatch(msg) {{
    var env = _d(msg);
    if (!env) return _fallthrough(msg);
    var hs = _l[env.$ch];
    if (!hs) return _fallthrough(msg);
    var snapshot = _slice.call(hs);
    for (var i = 0; i < snapshot.length; i++) {{
      try {{ snapshot[i](env.p); }} catch (err) {{}}
    }}
  }}
  var _channel = _freeze({{
    send: function (t, p) {{
      if (window.ipc && window.ipc.postMessage) window.ipc.postMessage(_e(t, p));
    }},
    on: function (t, h) {{
      if (typeof h !== "function") return;
      var k = _key(t);
      if (!_l[k]) _l[k] = [];
      if (_indexOf.call(_l[k], h) < 0) _push.call(_l[k], h);
    }},
    off: function (t, h) {{
      var k = _key(t);
      if (!_l[k]) return;
      var i = _indexOf.call(_l[k], h);
      if (i >= 0) _splice.call(_l[k], i, 1);
    }}
  }});
  var _listeners = _freeze({{
    add: function (fn) {{
      if (typeof fn === "function") _push.call(_el, fn);
    }},
    remove: function (fn) {{
      var i = _indexOf.call(_el, fn);
      if (i >= 0) _splice.call(_el, i, 1);
    }}
  }});
  _defineProperty(window, "__native_message__", {{ value: _dispatch, writable: false, configurable: false }});
  _defineProperty(window, "__native_message_listeners__", {{ value: _listeners, writable: false, configurable: false }});
  _defineProperty(window, "__channel__", {{ value: _channel, writable: false, configurable: false }});
}})();"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_is_frozen_and_locked() {
        let s = bridge_script("window.chrome.webview.postMessage.bind(window.chrome.webview)");
        assert!(s.contains("Object.freeze({postMessage:"));
        assert!(s.contains("writable:false,configurable:false"));
        assert!(s.starts_with("(function(){var _post=window.chrome.webview.postMessage"));
    }

    #[test]
    fn csp_value_cannot_break_out() {
        let s = csp_script("default-src 'self'; img-src *\n</script>");
        assert!(s.contains("http-equiv") || s.contains("httpEquiv"));
        assert!(!s.contains("</script>"));
        assert!(s.contains("<\\/script>"));
    }

    #[test]
    fn permission_shims_follow_flags() {
        let deny_all = permission_shim_script(&PermissionFlags::default());
        assert!(deny_all.contains("delete navigator.geolocation"));
        assert!(deny_all.contains("getUserMedia"));
        assert!(deny_all.contains("NotAllowedError"));

        let allow_all = permission_shim_script(&PermissionFlags {
            camera: true,
            microphone: true,
            file_system: true,
            geolocation: true,
        });
        assert!(!allow_all.contains("delete navigator.geolocation"));
        assert!(!allow_all.contains("getUserMedia"));

        let mic_only = permission_shim_script(&PermissionFlags {
            camera: false,
            microphone: true,
            file_system: false,
            geolocation: false,
        });
        assert!(mic_only.contains("if(c&&c.video)return _deny();"));
        assert!(!mic_only.contains("if(c&&c.audio)return _deny();"));
    }

    #[test]
    fn client_captures_prototypes_first() {
        let s = client_script(None, 1_048_576);
        let capture_block = &s[..s.find("if (window.__channel__)").unwrap()];
        for capture in [
            "var _slice = Array.prototype.slice",
            "var _filter = Array.prototype.filter",
            "var _push = Array.prototype.push",
            "var _indexOf = Array.prototype.indexOf",
            "var _splice = Array.prototype.splice",
            "var _stringify = JSON.stringify",
            "var _parse = JSON.parse",
            "var _defineProperty = Object.defineProperty",
            "var _freeze = Object.freeze",
            "var _create = Object.create",
        ] {
            assert!(capture_block.contains(capture), "missing capture: {capture}");
        }
    }

    #[test]
    fn client_installs_with_locked_descriptors() {
        let s = client_script(Some("ns"), 1_048_576);
        for global in ["__native_message__", "__native_message_listeners__", "__channel__"] {
            let needle = format!(
                "_defineProperty(window, \"{global}\", {{ value:"
            );
            assert!(s.contains(&needle), "missing locked install for {global}");
        }
        assert_eq!(s.matches("writable: false, configurable: false").count(), 3);
        // Values are frozen before install, never after.
        assert!(s.contains("var _channel = _freeze({"));
        assert!(s.contains("var _listeners = _freeze({"));
    }

    #[test]
    fn client_embeds_prefix_and_size_cap() {
        let s = client_script(Some("a1b2"), 1_048_576);
        assert!(s.contains("var _pfx = \"a1b2\";"));
        assert!(s.contains("var _max = 1048576;"));
        let unprefixed = client_script(None, 65536);
        assert!(unprefixed.contains("var _pfx = \"\";"));
        assert!(unprefixed.contains("var _max = 65536;"));
    }

    #[test]
    fn client_strips_proto_and_requires_string_channel() {
        let s = client_script(None, 1_048_576);
        assert!(s.contains("delete v[\"__proto__\"]"));
        assert!(s.contains("typeof v.$ch === \"string\""));
        assert!(s.contains("_l = _create(null)"));
    }

    #[test]
    fn compose_orders_bridge_before_hardening() {
        let opts = WindowOptions {
            csp: Some("default-src 'self'".into()),
            ..Default::default()
        };
        let s = compose_document_start("nativePost", &opts);
        let bridge_at = s.find("Object.freeze({postMessage:").unwrap();
        let csp_at = s.find("Content-Security-Policy").unwrap();
        let open_at = s.find("window,'open'").unwrap();
        let schemes_at = s.find("BLOCKED_SCHEMES").unwrap();
        assert!(bridge_at < csp_at && csp_at < open_at && open_at < schemes_at);
    }

    #[test]
    fn post_message_script_escapes_payload() {
        let s = post_message_script("{\"$ch\":\"ping\",\"p\":\"hi\"}");
        assert!(s.starts_with("if(window.__native_message__)"));
        assert!(s.contains("\\\"$ch\\\""));
    }
}
