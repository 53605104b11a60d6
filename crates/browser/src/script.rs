//! JavaScript snippets evaluated in the page through `Runtime.evaluate`.
//!
//! Every user-provided string is embedded as a JSON literal so selectors and
//! labels never need manual escaping.

use serde_json::Value;
use voxnav_core::Selector;

/// Elements considered when resolving a `text=` selector.
const TEXT_CANDIDATES: &str = "button, a, input, textarea, select, label, [role=button], [role=link], \
[role=tab], [role=menuitem], summary, h1, h2, h3, h4, h5, h6, li, td, th, p, span, div";

/// Matches of these win over plain text containers.
const INTERACTIVE: &str = "button, a, input, textarea, select, [role=button], [role=link], [role=tab], \
[role=menuitem], summary";

fn js_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// An expression evaluating to the first matching visible element, or null.
pub fn find_element(selector: &Selector) -> String {
    match selector {
        Selector::Css(css) => format!("document.querySelector({})", js_str(css)),
        Selector::Text(label) => format!(
            concat!(
                "(function() {{",
                " var needle = {}.toLowerCase();",
                " var visible = function(el) {{ return !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length); }};",
                " var text = function(el) {{ return [el.innerText, el.value, el.placeholder,",
                " el.getAttribute && el.getAttribute('aria-label'), el.title]",
                ".filter(Boolean).join(' ').toLowerCase(); }};",
                " var best = null, bestScore = Infinity;",
                " var nodes = document.querySelectorAll({});",
                " for (var i = 0; i < nodes.length; i++) {{",
                "  var el = nodes[i];",
                "  if (!visible(el)) continue;",
                "  var t = text(el);",
                "  if (t.indexOf(needle) === -1) continue;",
                "  var score = t.length + (el.matches({}) ? 0 : 1000000);",
                "  if (score <= bestScore) {{ best = el; bestScore = score; }}",
                " }}",
                " if (!best) {{",
                "  var labels = document.querySelectorAll('label');",
                "  for (var j = 0; j < labels.length; j++) {{",
                "   if (labels[j].innerText.toLowerCase().indexOf(needle) !== -1 && labels[j].control) return labels[j].control;",
                "  }}",
                " }}",
                " return best; }})()"
            ),
            js_str(label),
            js_str(TEXT_CANDIDATES),
            js_str(INTERACTIVE)
        ),
    }
}

pub fn element_exists(selector: &Selector) -> String {
    format!("({}) !== null", find_element(selector))
}

/// Returns `{found: bool}`; clicks the element when present.
pub fn click(selector: &Selector) -> String {
    format!(
        concat!(
            "(function() {{ var el = {};",
            " if (!el) return {{found: false}};",
            " el.scrollIntoView({{block: 'center'}});",
            " el.click(); return {{found: true}}; }})()"
        ),
        find_element(selector)
    )
}

/// Focuses and clears the element so `Input.insertText` replaces its content.
pub fn focus_for_typing(selector: &Selector) -> String {
    format!(
        concat!(
            "(function() {{ var el = {};",
            " if (!el) return {{found: false}};",
            " el.scrollIntoView({{block: 'center'}}); el.focus();",
            " if (el.isContentEditable) {{ document.execCommand('selectAll', false, null); }}",
            " else if ('value' in el) {{ el.value = ''; el.dispatchEvent(new Event('input', {{bubbles: true}})); }}",
            " return {{found: true}}; }})()"
        ),
        find_element(selector)
    )
}

/// Fires `change` after typing so frameworks notice the new value.
pub fn commit_typing(selector: &Selector) -> String {
    format!(
        concat!(
            "(function() {{ var el = {};",
            " if (el) el.dispatchEvent(new Event('change', {{bubbles: true}}));",
            " return true; }})()"
        ),
        find_element(selector)
    )
}

/// Returns `{found: bool, value: string}` with the element's visible text or value.
pub fn extract(selector: &Selector) -> String {
    format!(
        concat!(
            "(function() {{ var el = {};",
            " if (!el) return {{found: false, value: ''}};",
            " var v = /^(INPUT|TEXTAREA|SELECT)$/.test(el.tagName) ? el.value : el.innerText;",
            " return {{found: true, value: (v || '').trim()}}; }})()"
        ),
        find_element(selector)
    )
}

pub fn text_visible(text: &str) -> String {
    format!(
        "!!(document.body && document.body.innerText.toLowerCase().indexOf({}.toLowerCase()) !== -1)",
        js_str(text)
    )
}

pub fn url_contains(fragment: &str) -> String {
    format!("window.location.href.indexOf({}) !== -1", js_str(fragment))
}

pub const READY_STATE: &str = "document.readyState";

/// Snapshot of url, title and up to 60 visible interactive labels.
pub const PAGE_STATE: &str = concat!(
    "(function() {",
    " var seen = {}, labels = [];",
    " var nodes = document.querySelectorAll('a, button, input, textarea, select, [role=button], [role=link]');",
    " for (var i = 0; i < nodes.length && labels.length < 60; i++) {",
    "  var el = nodes[i];",
    "  if (!(el.offsetWidth || el.offsetHeight || el.getClientRects().length)) continue;",
    "  var t = (el.innerText || el.value || el.placeholder || el.getAttribute('aria-label') || el.title || '').trim();",
    "  if (!t || t.length > 80 || seen[t]) continue;",
    "  seen[t] = true; labels.push(t);",
    " }",
    " return {url: window.location.href, title: document.title, labels: labels};",
    "})()"
);
