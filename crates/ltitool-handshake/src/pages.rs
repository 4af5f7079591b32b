//! Server-rendered pages that drive the handshake in the browser
//!
//! Three interstitials exist:
//!
//! - the cookie-check page, served on OIDC login when third-party cookies
//!   may be blocked: it probes with a test cookie and either reloads with
//!   the original parameters, falls back to `lti_storage_frame` targeting,
//!   or shows the "cookies required" warning;
//! - the storing redirect page, which pushes resolved session-binding
//!   values (`lti.put_data`) toward the platform frame before completing a
//!   redirect, with a bounded give-up timer;
//! - the fetching redirect page, served when a launch arrives without its
//!   session cookie: it recovers the values stored earlier (`lti.get_data`
//!   per key) and re-enters the launch flow carrying them.
//!
//! Injection contract: every request parameter reflected into these pages
//! is attacker-influenced. Values are HTML-escaped first and the resulting
//! map is embedded as JSON with `<` encoded, so a crafted parameter can
//! never break out of the script context. The client unescapes the HTML
//! entities before re-encoding values into the recovered URL.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// User-facing strings on the cookie-check page.
#[derive(Debug, Clone)]
pub struct CookieCheckTexts {
    pub main_text: String,
    pub click_text: String,
    pub loading_text: String,
}

impl Default for CookieCheckTexts {
    fn default() -> Self {
        Self {
            main_text: "Your browser prohibits saving cookies in an iframe.".to_string(),
            click_text: "Open the tool in a new window".to_string(),
            loading_text: "Loading...".to_string(),
        }
    }
}

/// Escape a string for an HTML text or attribute context.
///
/// The entity set matches what the client-side `unescapeHtmlEntities`
/// reverses; keep the two in sync.
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Serialize a value to JSON safe for direct embedding in a `<script>`
/// block (`<` is encoded so `</script>` cannot appear in the output).
fn js_embed<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace('<', "\\u003c")
}

/// Render the third-party-cookie check page.
///
/// `params` are the login parameters to carry through the probe; each value
/// is HTML-escaped before being embedded. `protocol` is `"http"` or
/// `"https"` for the probing cookie's attributes.
pub fn render_cookie_check_page(
    params: &BTreeMap<String, String>,
    protocol: &str,
    texts: &CookieCheckTexts,
) -> String {
    let escaped: BTreeMap<&str, String> = params
        .iter()
        .map(|(k, v)| (k.as_str(), html_escape(v)))
        .collect();
    let url_params = js_embed(&escaped);
    let site_protocol = js_embed(&protocol);

    format!(
        r##"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{loading}</title></head>
<body>
<div id="lti-loading-msg" style="display:none">{loading}</div>
<div id="lti-warning-msg" style="display:none">
  <p>{main}</p>
  <p><a id="lti-new-tab-link" href="#">{click}</a></p>
</div>
<script type="text/javascript">
var siteProtocol = {site_protocol};
var urlParams = {url_params};
var htmlEntities = {{
    "&lt;": "<",
    "&gt;": ">",
    "&amp;": "&",
    "&quot;": '"',
    "&#x27;": "'"
}};

function unescapeHtmlEntities(str) {{
    for (var htmlCode in htmlEntities) {{
        str = str.replace(new RegExp(htmlCode, "g"), htmlEntities[htmlCode]);
    }}
    return str;
}}

function getUpdatedUrl(ltiStorageFrame) {{
    var newSearchParams = [];
    for (var key in urlParams) {{
        if (window.location.search.indexOf(key + '=') === -1) {{
            newSearchParams.push(key + '=' + encodeURIComponent(
                unescapeHtmlEntities(urlParams[key])));
        }}
    }}
    if (ltiStorageFrame) {{
        newSearchParams.push('lti_storage_frame=' +
                             encodeURIComponent(ltiStorageFrame));
    }}
    var searchParamsStr = newSearchParams.join('&');
    if (window.location.search !== '') {{
        searchParamsStr = window.location.search + '&' + searchParamsStr;
    }} else {{
        searchParamsStr = '?' + searchParamsStr;
    }}
    return window.location.protocol + '//' + window.location.hostname +
        (window.location.port ? (":" + window.location.port) : "") +
        window.location.pathname + searchParamsStr;
}}

function displayLoadingBlock() {{
    document.getElementById("lti-loading-msg").style.display = "block";
}}

function displayWarningBlock() {{
    document.getElementById("lti-warning-msg").style.display = "block";
    var newTabLink = document.getElementById("lti-new-tab-link");
    var contentUrl = getUpdatedUrl();
    newTabLink.onclick = function() {{
        window.open(contentUrl, '_blank');
        newTabLink.parentNode.removeChild(newTabLink);
    }};
}}

function checkCookiesAllowed() {{
    var cookie = "lti_test_cookie=1; path=/";
    if (siteProtocol === 'https') {{
        cookie = cookie + '; Partitioned; SameSite=None; Secure';
    }}

    document.cookie = cookie;
    var res = document.cookie.indexOf("lti_test_cookie") !== -1;
    if (res) {{
        document.cookie = "lti_test_cookie=1; " +
                          "expires=Thu, 01-Jan-1970 00:00:01 GMT";
        displayLoadingBlock();
        window.location.href = getUpdatedUrl();
    }} else if ('lti_storage_target' in urlParams) {{
        displayLoadingBlock();
        window.location.href = getUpdatedUrl(urlParams.lti_storage_target);
    }} else {{
        displayWarningBlock();
    }}
}}

document.addEventListener("DOMContentLoaded", checkCookiesAllowed);
</script>
</body>
</html>
"##,
        loading = html_escape(&texts.loading_text),
        main = html_escape(&texts.main_text),
        click = html_escape(&texts.click_text),
        site_protocol = site_protocol,
        url_params = url_params,
    )
}

/// Render the storing redirect page: push `values` through the platform
/// frame (`lti.put_data`) and then navigate to `location`.
///
/// `auth_origin` restricts the postMessage target origin to the platform's
/// authorization endpoint origin. The give-up timer mirrors the state
/// machine's timeout.
pub fn render_redirect(
    location: &str,
    auth_origin: &str,
    values: &BTreeMap<String, String>,
    timeout: Duration,
) -> String {
    let location_js = js_embed(&location);
    let origin_js = js_embed(&auth_origin);
    let values_js = js_embed(values);
    let timeout_ms = timeout.as_millis();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body>
<script type="text/javascript">
var redirectLocation = {location_js};
var targetOrigin = {origin_js};
var clientData = {values_js};

function doRedirection() {{
    window.location = redirectLocation;
}}

function putData(frame, key, value) {{
    window.parent.frames[frame].postMessage({{
        subject: 'lti.put_data',
        key: key,
        value: value,
        message_id: crypto.randomUUID()
    }}, targetOrigin);
}}

function storageResponse(event) {{
    var message = event.data;
    switch (message.subject) {{
        case 'lti.capabilities.response':
            var supported = message.supported_messages;
            for (var i = 0; i < supported.length; i++) {{
                if (supported[i].subject === "lti.put_data") {{
                    for (var key in clientData) {{
                        putData(supported[i].frame, key, clientData[key]);
                    }}
                }}
            }}
        break;
    }}
    if (message.error) {{
        console.error("event " + message.subject +
                      " error (" + message.error.code +
                      "): " + message.error.message);
    }}
}}

function storeAndRedirect() {{
    if (Object.keys(clientData).length > 0) {{
        window.parent.postMessage({{subject: 'lti.capabilities'}}, '*');
        setTimeout(doRedirection, {timeout_ms});
    }} else {{
        doRedirection();
    }}
}}

window.addEventListener("message", storageResponse);
document.addEventListener("DOMContentLoaded", storeAndRedirect);
</script>
</body>
</html>
"#
    )
}

/// Render the fetching redirect page: recover `keys` through the platform
/// frame (`lti.get_data`) and then navigate to `location` with each
/// recovered value appended as a query parameter.
///
/// `scope` is the launch's `state` value; it namespaces the per-key message
/// ids the same way the fetch state machine does, so a response minted for
/// another launch in another tab is ignored. The give-up timer redirects
/// with whatever resolved, and the validator downstream decides whether the
/// launch can proceed.
pub fn render_launch_redirect(
    location: &str,
    auth_origin: &str,
    scope: &str,
    keys: &[&str],
    timeout: Duration,
) -> String {
    let pending: BTreeMap<&str, ()> = keys.iter().map(|k| (*k, ())).collect();
    let location_js = js_embed(&location);
    let origin_js = js_embed(&auth_origin);
    let scope_js = js_embed(&scope);
    let pending_js = js_embed(&pending);
    let timeout_ms = timeout.as_millis();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body>
<script type="text/javascript">
var redirectLocation = {location_js};
var targetOrigin = {origin_js};
var messageScope = {scope_js};
var clientData = {pending_js};

function doRedirection() {{
    var url = new URL(redirectLocation);
    for (var key in clientData) {{
        if (clientData[key] !== null) {{
            url.searchParams.set(key, clientData[key]);
        }}
    }}
    window.location = url.toString();
}}

function getData(frame, key) {{
    window.parent.frames[frame].postMessage({{
        subject: 'lti.get_data',
        key: key,
        message_id: key + '_' + messageScope
    }}, targetOrigin);
}}

function allFetched() {{
    for (var key in clientData) {{
        if (clientData[key] === null) {{
            return false;
        }}
    }}
    return true;
}}

function storageResponse(event) {{
    var message = event.data;
    switch (message.subject) {{
        case 'lti.capabilities.response':
            var supported = message.supported_messages;
            for (var i = 0; i < supported.length; i++) {{
                if (supported[i].subject === "lti.get_data") {{
                    for (var key in clientData) {{
                        getData(supported[i].frame, key);
                    }}
                }}
            }}
        break;
        case 'lti.get_data.response':
            if (message.message_id !== message.key + '_' + messageScope) {{
                break;
            }}
            if (message.key in clientData && clientData[message.key] === null) {{
                clientData[message.key] = message.value;
                if (allFetched()) {{
                    doRedirection();
                }}
            }}
        break;
    }}
    if (message.error) {{
        console.error("event " + message.subject +
                      " error (" + message.error.code +
                      "): " + message.error.message);
    }}
}}

function fetchAndRedirect() {{
    window.parent.postMessage({{subject: 'lti.capabilities'}}, '*');
    setTimeout(doRedirection, {timeout_ms});
}}

window.addEventListener("message", storageResponse);
document.addEventListener("DOMContentLoaded", fetchAndRedirect);
</script>
</body>
</html>
"#
    )
}
