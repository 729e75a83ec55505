use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::actions::ScrollDirection;
use crate::config::{Geolocation, OriginStorage};
use crate::driver::PageHandle;
use crate::error::{DriverError, DriverResult};
use crate::types::AxNode;

/// XPath generator shared by every in-page probe.
///
/// Short-circuits to `id("...")` when the element's id is unique in the
/// document; otherwise appends the 1-based position among same-tag siblings,
/// and only when there is more than one of them.
const XPATH_FN: &str = r#"
function __xpath(elem) {
  if (!elem || elem.nodeType !== 1) return '';
  if (elem === document.documentElement) return '/' + elem.tagName.toLowerCase();
  if (elem.id && document.querySelectorAll('#' + CSS.escape(elem.id)).length === 1) {
    return 'id("' + elem.id + '")';
  }
  const siblings = elem.parentNode ? elem.parentNode.childNodes : [];
  let same = 0, own = 0;
  for (const s of siblings) {
    if (s.nodeType === 1 && s.tagName === elem.tagName) {
      same++;
      if (s === elem) own = same;
    }
  }
  const tag = elem.tagName.toLowerCase();
  return __xpath(elem.parentNode) + '/' + tag + (same > 1 ? '[' + own + ']' : '');
}
function __byXpath(xp) {
  return document.evaluate(xp, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
}
"#;

/// JavaScript injected into the page to produce an accessibility snapshot.
/// NON-DESTRUCTIVE: reads the DOM and computed styles only.
///
/// The script:
///   1. Skips script/style/template elements and hidden subtrees
///      (`display:none`, `visibility:hidden`, `aria-hidden=true`).
///   2. Resolves each element's role: explicit `role` first, then the
///      implicit ARIA role for its tag.
///   3. Computes an accessible name (aria-label, aria-labelledby, labels,
///      placeholder, alt, title, then text content for name-from-content roles).
///   4. Emits a flat node list with child indices, xpath and bounding box.
///      Text nodes become `StaticText`.
const SNAPSHOT_JS: &str = r#"
(() => {
  %XPATH%
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','TEMPLATE','LINK','META','HEAD']);
  const NAME_FROM_CONTENT = new Set(['link','button','heading','option','menuitem','tab',
    'checkbox','radio','switch','cell','columnheader','LabelText','legend']);
  const nodes = [];
  const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();

  function hidden(el) {
    if (el.getAttribute('aria-hidden') === 'true') return true;
    const s = getComputedStyle(el);
    return s.display === 'none' || s.visibility === 'hidden';
  }

  function implicitRole(el) {
    const tag = el.tagName.toLowerCase();
    switch (tag) {
      case 'a': return el.hasAttribute('href') ? 'link' : 'generic';
      case 'button': return 'button';
      case 'input': {
        const t = (el.getAttribute('type') || 'text').toLowerCase();
        if (t === 'hidden') return null;
        if (t === 'checkbox') return 'checkbox';
        if (t === 'radio') return 'radio';
        if (['submit', 'button', 'reset', 'image'].includes(t)) return 'button';
        if (t === 'range') return 'slider';
        if (t === 'number') return 'spinbutton';
        if (t === 'search') return 'searchbox';
        return 'textbox';
      }
      case 'textarea': return 'textbox';
      case 'select': return (el.multiple || el.size > 1) ? 'listbox' : 'combobox';
      case 'option': return 'option';
      case 'img': return 'img';
      case 'h1': case 'h2': case 'h3': case 'h4': case 'h5': case 'h6': return 'heading';
      case 'nav': return 'navigation';
      case 'main': return 'main';
      case 'form': return 'form';
      case 'header': return 'banner';
      case 'footer': return 'contentinfo';
      case 'aside': return 'complementary';
      case 'ul': case 'ol': return 'list';
      case 'li': return 'listitem';
      case 'table': return 'table';
      case 'tr': return 'row';
      case 'td': return 'cell';
      case 'th': return 'columnheader';
      case 'dialog': return 'dialog';
      case 'iframe': return 'Iframe';
      case 'label': return 'LabelText';
      case 'p': return 'paragraph';
      case 'fieldset': return 'group';
      case 'legend': return 'legend';
      default: return 'generic';
    }
  }

  function accName(el, role) {
    const aria = norm(el.getAttribute('aria-label'));
    if (aria) return aria;
    const by = el.getAttribute('aria-labelledby');
    if (by) {
      const t = norm(by.split(/\s+/).map(id => {
        const ref = document.getElementById(id);
        return ref ? ref.textContent : '';
      }).join(' '));
      if (t) return t;
    }
    const tag = el.tagName.toLowerCase();
    if (tag === 'input' || tag === 'textarea' || tag === 'select') {
      if (el.labels && el.labels.length) {
        const l = norm([...el.labels].map(x => x.textContent).join(' '));
        if (l) return l;
      }
      const t = (el.type || '').toLowerCase();
      if (tag === 'input' && ['submit', 'button', 'reset'].includes(t)) {
        return norm(el.value) || (t === 'submit' ? 'Submit' : '');
      }
      return norm(el.placeholder || el.title);
    }
    if (tag === 'img') return norm(el.getAttribute('alt') || el.title);
    if (tag === 'iframe') return norm(el.title || el.name);
    if (NAME_FROM_CONTENT.has(role)) return norm(el.innerText || el.textContent).slice(0, 200);
    return norm(el.title);
  }

  function props(el, role) {
    const p = [];
    if (el === document.activeElement && el !== document.body) p.push(['focused', 'True']);
    if (el.required || el.getAttribute('aria-required') === 'true') p.push(['required', 'True']);
    if (role === 'checkbox' || role === 'radio' || role === 'switch') {
      const c = el.getAttribute('aria-checked');
      const on = c !== null ? c === 'true' : !!el.checked;
      p.push(['checked', on ? 'true' : 'false']);
    }
    if (el.disabled || el.getAttribute('aria-disabled') === 'true') p.push(['disabled', 'True']);
    const ex = el.getAttribute('aria-expanded');
    if (ex !== null) p.push(['expanded', ex === 'true' ? 'True' : 'False']);
    if (el.selected || el.getAttribute('aria-selected') === 'true') p.push(['selected', 'True']);
    if (role === 'heading') {
      const m = /^h([1-6])$/i.exec(el.tagName);
      p.push(['level', el.getAttribute('aria-level') || (m ? m[1] : '2')]);
    }
    const hp = el.getAttribute('aria-haspopup');
    if (hp && hp !== 'false') p.push(['hasPopup', hp]);
    return p;
  }

  function box(el) {
    const r = el.getBoundingClientRect();
    return (r.width || r.height) ? { x: r.x, y: r.y, width: r.width, height: r.height } : null;
  }

  function add(role, name, el, parent) {
    const n = {
      node_id: nodes.length,
      role: role,
      name: name,
      properties: el ? props(el, role) : [],
      children: [],
      xpath: el ? __xpath(el) : (parent ? parent.xpath : ''),
      bounds: el ? box(el) : null,
      tag: el ? el.tagName.toLowerCase() : '#text',
    };
    nodes.push(n);
    if (parent) parent.children.push(n.node_id);
    return n;
  }

  function walk(domNode, parent, depth) {
    if (depth > 64) return;
    for (const child of domNode.childNodes) {
      if (child.nodeType === 3) {
        const t = norm(child.textContent);
        if (t) add('StaticText', t.slice(0, 200), null, parent);
        continue;
      }
      if (child.nodeType !== 1 || SKIP.has(child.tagName) || hidden(child)) continue;
      const explicit = (child.getAttribute('role') || '').trim().split(/\s+/)[0];
      const role = explicit || implicitRole(child);
      if (role === null) continue;
      const n = add(role, accName(child, role), child, parent);
      if (child.tagName === 'IFRAME') continue;
      walk(child, n, depth + 1);
      if (child.shadowRoot) walk(child.shadowRoot, n, depth + 1);
    }
  }

  const root = add('RootWebArea', norm(document.title), document.documentElement, null);
  walk(document.body || document.documentElement, root, 0);
  return JSON.stringify(nodes);
})()
"#;

const HAS_DIALOG_JS: &str =
    r#"document.querySelectorAll('[role="dialog"], [role="alertdialog"]').length > 0"#;

const LINKS_JS: &str = r#"
JSON.stringify([...document.querySelectorAll('a')]
  .filter(a => a.getAttribute('href'))
  .map(a => [(a.textContent || '').trim().toLowerCase(), a.getAttribute('href')]))
"#;

const IFRAMES_JS: &str = r#"
JSON.stringify([...document.querySelectorAll('iframe')].map(f => {
  let content = null;
  try {
    const d = f.contentDocument;
    if (d && d.documentElement) content = d.documentElement.outerHTML;
  } catch (e) {}
  return { src: f.src || '', title: f.getAttribute('title') || '', name: f.name || '', content: content };
}))
"#;

/// Deletes the first dialog and the first alertdialog node. Does not run any
/// close handler the application registered.
const REMOVE_DIALOGS_JS: &str = r#"
(() => {
  let removed = 0;
  for (const sel of ['[role="dialog"]', '[role="alertdialog"]']) {
    const d = document.querySelector(sel);
    if (d) { d.remove(); removed++; }
  }
  return removed;
})()
"#;

const RELEASE_FOCUS_JS: &str =
    "(() => { if (document.activeElement) document.activeElement.blur(); return true; })()";

/// Iframe element found in the page. `content` is only readable for
/// same-origin frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameInfo {
    pub src: String,
    pub title: String,
    pub name: String,
    pub content: Option<String>,
}

/// Evaluate a script that returns a JSON string and decode it.
fn evaluate_json<T: DeserializeOwned>(page: &dyn PageHandle, script: &str) -> DriverResult<T> {
    let value = page.evaluate(script)?;
    let raw = value
        .as_str()
        .ok_or_else(|| DriverError::Script(format!("expected JSON string, got {value}")))?;
    Ok(serde_json::from_str(raw)?)
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Capture the accessibility snapshot of the current document.
pub fn capture_ax_snapshot(page: &dyn PageHandle) -> DriverResult<Vec<AxNode>> {
    evaluate_json(page, &SNAPSHOT_JS.replace("%XPATH%", XPATH_FN))
}

/// XPath -> outer HTML for every element matching `selector`.
pub fn elements_by_selector(
    page: &dyn PageHandle,
    selector: &str,
) -> DriverResult<BTreeMap<String, String>> {
    let script = format!(
        "(() => {{ {XPATH_FN}
  const out = [];
  for (const el of document.querySelectorAll({sel})) out.push([__xpath(el), el.outerHTML]);
  return JSON.stringify(out);
}})()",
        sel = js_string(selector)
    );
    let pairs: Vec<(String, String)> = evaluate_json(page, &script)?;
    Ok(pairs.into_iter().collect())
}

pub fn has_dialog(page: &dyn PageHandle) -> DriverResult<bool> {
    let value = page.evaluate(HAS_DIALOG_JS)?;
    value
        .as_bool()
        .ok_or_else(|| DriverError::Script(format!("expected boolean, got {value}")))
}

/// Lower-cased link text -> absolute URL. Later links with the same text win.
pub fn link_pairs(page: &dyn PageHandle) -> DriverResult<BTreeMap<String, String>> {
    let pairs: Vec<(String, String)> = evaluate_json(page, LINKS_JS)?;
    let base = Url::parse(&page.url()).ok();
    Ok(pairs
        .into_iter()
        .filter_map(|(text, href)| resolve_href(base.as_ref(), &href).map(|url| (text, url)))
        .collect())
}

fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }
}

pub fn list_iframes(page: &dyn PageHandle) -> DriverResult<Vec<FrameInfo>> {
    evaluate_json(page, IFRAMES_JS)
}

/// Returns how many dialog nodes were removed.
pub fn remove_dialogs(page: &dyn PageHandle) -> DriverResult<u64> {
    let value = page.evaluate(REMOVE_DIALOGS_JS)?;
    Ok(value.as_u64().unwrap_or(0))
}

pub fn scroll(page: &dyn PageHandle, direction: ScrollDirection) -> DriverResult<()> {
    let sign = match direction {
        ScrollDirection::Up => "-",
        ScrollDirection::Down => "",
    };
    page.evaluate(&format!("window.scrollBy(0, {sign}window.innerHeight); true"))?;
    Ok(())
}

/// Select the option whose value or visible text equals `value`.
pub fn select_option(page: &dyn PageHandle, xpath: &str, value: &str) -> DriverResult<()> {
    let script = format!(
        "(() => {{ {XPATH_FN}
  const el = __byXpath({xp});
  if (!el || el.tagName !== 'SELECT') return 'missing';
  const want = {val};
  const opt = [...el.options].find(o => o.value === want || o.text.trim() === want);
  if (!opt) return 'no-option';
  el.value = opt.value;
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return 'ok';
}})()",
        xp = js_string(xpath),
        val = js_string(value)
    );
    match page.evaluate(&script)?.as_str() {
        Some("ok") => Ok(()),
        Some("no-option") => Err(DriverError::ElementNotFound(format!(
            "option '{value}' in {xpath}"
        ))),
        _ => Err(DriverError::ElementNotFound(format!("select element {xpath}"))),
    }
}

/// Empty an input or textarea before typing into it.
pub fn clear_value(page: &dyn PageHandle, xpath: &str) -> DriverResult<()> {
    let script = format!(
        "(() => {{ {XPATH_FN}
  const el = __byXpath({xp});
  if (!el) return false;
  if ('value' in el) el.value = '';
  else if (el.isContentEditable) el.textContent = '';
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  return true;
}})()",
        xp = js_string(xpath)
    );
    match page.evaluate(&script)?.as_bool() {
        Some(true) => Ok(()),
        _ => Err(DriverError::ElementNotFound(xpath.to_string())),
    }
}

/// Drop focus from whatever element holds it, leaving it on the body.
pub fn release_focus(page: &dyn PageHandle) -> DriverResult<()> {
    page.evaluate(RELEASE_FOCUS_JS)?;
    Ok(())
}

/// Write saved localStorage entries for origins matching the page.
pub fn apply_local_storage(page: &dyn PageHandle, origins: &[OriginStorage]) -> DriverResult<()> {
    for origin in origins.iter().filter(|o| !o.local_storage.is_empty()) {
        let entries: Vec<(&str, &str)> = origin
            .local_storage
            .iter()
            .map(|nv| (nv.name.as_str(), nv.value.as_str()))
            .collect();
        let entries = serde_json::to_string(&entries)?;
        let script = format!(
            "(() => {{ if (location.origin !== {origin}) return false;
  for (const [k, v] of {entries}) localStorage.setItem(k, v);
  return true; }})()",
            origin = js_string(&origin.origin)
        );
        page.evaluate(&script)?;
    }
    Ok(())
}

/// Replace `navigator.geolocation` lookups with a fixed position.
pub fn override_geolocation(page: &dyn PageHandle, geo: &Geolocation) -> DriverResult<()> {
    let script = format!(
        "(() => {{
  const pos = {{ coords: {{ latitude: {lat}, longitude: {lng}, accuracy: 10 }}, timestamp: Date.now() }};
  if (!navigator.geolocation) return false;
  navigator.geolocation.getCurrentPosition = (ok) => ok(pos);
  navigator.geolocation.watchPosition = (ok) => {{ ok(pos); return 0; }};
  return true;
}})()",
        lat = geo.latitude,
        lng = geo.longitude
    );
    page.evaluate(&script)?;
    Ok(())
}
