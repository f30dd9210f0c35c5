//! HTML shells for the gateway's own pages.
//!
//! Every inline script carries the per-request nonce; the CSP set by the
//! dispatcher allows nothing else.

use crate::registry::Session;

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, nonce: &str, body: &str, script: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} · termgate</title>
<style nonce="{nonce}">
body {{ font-family: system-ui, sans-serif; margin: 0; background: #111; color: #ddd; }}
main {{ max-width: 960px; margin: 0 auto; padding: 1.5rem; }}
a {{ color: #8ab4f8; }}
input, select, button {{ font: inherit; padding: .4rem .6rem; margin: .2rem 0; }}
.error {{ color: #f28b82; }}
.frame {{ position: fixed; inset: 2.5rem 0 0 0; width: 100%; height: calc(100% - 2.5rem); border: 0; }}
.bar {{ height: 2.5rem; display: flex; align-items: center; gap: 1rem; padding: 0 1rem; background: #222; }}
</style>
</head>
<body>
{body}
<script nonce="{nonce}">
{script}
</script>
</body>
</html>"#,
        title = escape(title),
        nonce = nonce,
        body = body,
        script = script,
    )
}

pub fn login(nonce: &str, error: Option<&str>) -> String {
    let error = error
        .map(|e| format!(r#"<p class="error">{}</p>"#, escape(e)))
        .unwrap_or_default();
    let body = format!(
        r#"<main>
<h1>Sign in</h1>
{error}
<form method="post" action="/login">
<p><input name="username" autocomplete="username" placeholder="Username" required></p>
<p><input name="password" type="password" autocomplete="current-password" placeholder="Password" required></p>
<p><button type="submit">Sign in</button></p>
</form>
</main>"#
    );
    layout("Sign in", nonce, &body, "")
}

const DASHBOARD_SCRIPT: &str = r#"
async function api(method, path, body) {
  const res = await fetch(path, {
    method,
    headers: body ? { 'content-type': 'application/json' } : {},
    body: body ? JSON.stringify(body) : undefined,
  });
  if (res.status === 401) { location.href = '/login'; return null; }
  if (res.status === 204) return {};
  const data = await res.json();
  if (!res.ok) throw new Error(data.error || res.statusText);
  return data;
}
function el(tag, text) { const e = document.createElement(tag); e.textContent = text; return e; }
async function refresh() {
  const data = await api('GET', '/api/sessions');
  const list = document.getElementById('sessions');
  list.replaceChildren();
  for (const s of (data ? data.sessions : [])) {
    const li = document.createElement('li');
    const link = el('a', s.name + ' (' + s.toolId + ')');
    link.href = '/session/' + encodeURIComponent(s.id);
    li.append(link, el('span', ' ' + s.folder + (s.active ? '' : ' [inactive]') + ' '));
    const del = el('button', 'Delete');
    del.onclick = async () => { await api('DELETE', '/api/sessions/' + encodeURIComponent(s.id)); refresh(); };
    li.append(del);
    list.append(li);
  }
}
async function loadTools() {
  const data = await api('GET', '/api/tools');
  const select = document.getElementById('tool');
  for (const t of (data ? data.tools : [])) {
    const o = el('option', t.name);
    o.value = t.id;
    select.append(o);
  }
}
document.getElementById('create').onsubmit = async (ev) => {
  ev.preventDefault();
  const f = ev.target;
  const msg = document.getElementById('message');
  msg.textContent = '';
  try {
    await api('POST', '/api/sessions', { name: f.elements['name'].value, folder: f.elements['folder'].value, toolId: f.elements['tool'].value });
    f.reset();
    refresh();
  } catch (e) { msg.textContent = e.message; }
};
loadTools();
refresh();
"#;

pub fn dashboard(nonce: &str) -> String {
    let body = r#"<main>
<h1>Sessions</h1>
<p><a href="/logout">Sign out</a></p>
<ul id="sessions"></ul>
<h2>New session</h2>
<form id="create">
<p><input name="name" placeholder="Name" required></p>
<p><input name="folder" placeholder="/absolute/folder" required></p>
<p><select name="tool" id="tool"></select></p>
<p><button type="submit">Create</button> <span id="message" class="error"></span></p>
</form>
</main>"#;
    layout("Sessions", nonce, body, DASHBOARD_SCRIPT)
}

pub fn session(nonce: &str, session: &Session, encoded_folder: &str) -> String {
    let body = format!(
        r#"<div class="bar">
<a href="/">&larr; Sessions</a>
<strong>{name}</strong>
<a href="/folder?path={folder_q}">{folder}</a>
<a href="/code/{encoded}/">Editor</a>
</div>
<iframe class="frame" src="/terminal/{id}/" title="terminal"></iframe>"#,
        name = escape(&session.name),
        folder = escape(&session.folder.to_string_lossy()),
        folder_q = urlencoding::encode(&session.folder.to_string_lossy()),
        encoded = escape(encoded_folder),
        id = escape(&session.id),
    );
    layout(&session.name, nonce, &body, "")
}

const FOLDER_SCRIPT: &str = r#"
const folder = document.getElementById('folder').dataset.folder;
const status = document.getElementById('status');
async function post(path) {
  const res = await fetch(path, {
    method: 'POST',
    headers: { 'content-type': 'application/json' },
    body: JSON.stringify({ folder }),
  });
  const data = res.status === 204 ? {} : await res.json();
  if (!res.ok) throw new Error(data.error || res.statusText);
  return data;
}
document.getElementById('start').onclick = async () => {
  status.textContent = 'Starting...';
  try { const data = await post('/api/code-server/start'); location.href = data.url; }
  catch (e) { status.textContent = e.message; }
};
document.getElementById('stop').onclick = async () => {
  try { await post('/api/code-server/stop'); status.textContent = 'Stopped'; }
  catch (e) { status.textContent = e.message; }
};
"#;

pub fn folder(nonce: &str, folder: &str, sessions: &[Session]) -> String {
    let items: String = sessions
        .iter()
        .map(|s| {
            format!(
                r#"<li><a href="/session/{}">{}</a></li>"#,
                escape(&s.id),
                escape(&s.name)
            )
        })
        .collect();
    let body = format!(
        r#"<main id="folder" data-folder="{folder}">
<p><a href="/">&larr; Sessions</a></p>
<h1>{folder}</h1>
<ul>{items}</ul>
<p><button id="start">Open editor</button> <button id="stop">Stop editor</button> <span id="status"></span></p>
</main>"#,
        folder = escape(folder),
    );
    layout(folder, nonce, &body, FOLDER_SCRIPT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_session_page_encodes_folder_link() {
        let descriptor = Session {
            id: "abc".to_string(),
            name: "work".to_string(),
            folder: std::path::PathBuf::from("/tmp/a b&c"),
            tool_id: "shell".to_string(),
            kind: crate::registry::SessionKind::Shell,
            created_at: chrono::Utc::now(),
        };
        let html = session("n", &descriptor, "L3RtcA");
        assert!(html.contains(r#"href="/folder?path=%2Ftmp%2Fa%20b%26c""#));
        assert!(html.contains(r#"src="/terminal/abc/""#));
    }

    #[test]
    fn test_pages_carry_nonce() {
        let html = dashboard("abc123");
        assert_eq!(html.matches(r#"nonce="abc123""#).count(), 2);
        assert!(login("n", Some("<bad>")).contains("&lt;bad&gt;"));
    }
}
