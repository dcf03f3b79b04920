//! Server-rendered HTML for the two screens.

use std::fmt::Write as _;

use crate::config::{OUTPUT_VIDEO, STATS_CHART};
use crate::session::{AuthState, Session};
use crate::store::Role;

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; max-width: 1100px; margin: 2rem auto; padding: 0 1rem; color: #1f2937; }
header { display: flex; justify-content: space-between; align-items: center; }
section { border: 1px solid #e5e7eb; border-radius: 8px; padding: 1rem 1.25rem; margin: 1rem 0; }
.row { display: flex; gap: 1.5rem; flex-wrap: wrap; }
.row > * { flex: 1 1 320px; }
label { display: block; margin: .5rem 0 .2rem; font-weight: 600; }
input[type=text], input[type=password], select { width: 100%; padding: .45rem; box-sizing: border-box; }
button { margin-top: .75rem; padding: .5rem 1rem; cursor: pointer; }
button.primary { background: #f97316; color: white; border: none; border-radius: 4px; }
button.danger { background: #dc2626; color: white; border: none; border-radius: 4px; }
.notice { padding: .5rem .75rem; background: #fef3c7; border-radius: 4px; }
.error { color: #b91c1c; }
video, img { max-width: 100%; }
progress { width: 100%; }
"#;

const PROGRESS_SCRIPT: &str = r#"
<script>
document.getElementById('analyze-form').addEventListener('submit', function () {
  const bar = document.getElementById('progress');
  const label = document.getElementById('progress-label');
  bar.hidden = false;
  setInterval(async function () {
    const res = await fetch('/progress');
    if (!res.ok) return;
    const p = await res.json();
    bar.value = p.fraction;
    label.textContent = p.message;
  }, 500);
});
</script>
"#;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Inline `**bold**` and `` `code` `` on already-escaped text.
fn inline(text: &str) -> String {
    let mut out = String::new();
    let mut bold = false;
    let mut code = false;
    let mut rest = text;
    while !rest.is_empty() {
        if !code && rest.starts_with("**") {
            out.push_str(if bold { "</strong>" } else { "<strong>" });
            bold = !bold;
            rest = &rest[2..];
        } else if rest.starts_with('`') {
            out.push_str(if code { "</code>" } else { "<code>" });
            code = !code;
            rest = &rest[1..];
        } else {
            let c = rest.chars().next().unwrap_or_default();
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    if code {
        out.push_str("</code>");
    }
    if bold {
        out.push_str("</strong>");
    }
    out
}

/// Render the Markdown subset the reports use: `###` headings, `- ` lists,
/// paragraphs, bold and inline code.
pub fn markdown_to_html(md: &str) -> String {
    let mut html = String::new();
    let mut in_list = false;
    for block in md.split("\n\n") {
        for line in block.lines() {
            let line = escape(line.trim_end());
            if let Some(item) = line.strip_prefix("- ") {
                if !in_list {
                    html.push_str("<ul>");
                    in_list = true;
                }
                let _ = write!(html, "<li>{}</li>", inline(item));
                continue;
            }
            if in_list {
                html.push_str("</ul>");
                in_list = false;
            }
            if let Some(heading) = line.strip_prefix("### ") {
                let _ = write!(html, "<h3>{}</h3>", inline(heading));
            } else if !line.is_empty() {
                let _ = write!(html, "<p>{}</p>", inline(&line));
            }
        }
    }
    if in_list {
        html.push_str("</ul>");
    }
    html
}

fn layout(body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Construction Safety Dashboard</title>\
         <style>{STYLE}</style></head><body>{body}</body></html>"
    )
}

fn notice(session: &Session) -> String {
    session
        .notice
        .as_deref()
        .map(|n| format!("<p class=\"notice\">{}</p>", escape(n)))
        .unwrap_or_default()
}

pub fn login_page(session: &Session) -> String {
    let body = format!(
        r#"<h1>🔑 Dashboard Login</h1>
<section>
<form method="post" action="/login">
<div class="row">
<div><label for="username">Username</label><input type="text" id="username" name="username" placeholder="admin"></div>
<div><label for="password">Password</label><input type="password" id="password" name="password"></div>
</div>
<button class="primary" type="submit">Login</button>
</form>
{}
</section>"#,
        notice(session)
    );
    layout(&body)
}

fn results_section(session: &Session, cache_bust: &str) -> String {
    let Some(outcome) = &session.outcome else {
        return String::new();
    };
    let mut html = String::from("<section><h2>📊 Analysis Results</h2><div class=\"row\">");
    if outcome.output_video.is_some() {
        let _ = write!(
            html,
            "<div><video controls src=\"/files/{OUTPUT_VIDEO}?v={cache_bust}\"></video>\
             <p><a href=\"/files/{OUTPUT_VIDEO}?v={cache_bust}\" download>Download annotated video</a></p></div>"
        );
    }
    if outcome.stats_chart.is_some() {
        let _ = write!(
            html,
            "<div><img alt=\"Object detection chart\" src=\"/files/{STATS_CHART}?v={cache_bust}\"></div>"
        );
    }
    let _ = write!(
        html,
        "</div><div class=\"row\"><div>{}</div><div>{}</div></div></section>",
        markdown_to_html(&outcome.summary),
        markdown_to_html(&outcome.key_moments)
    );
    html
}

fn role_options(selected: Option<Role>) -> String {
    [Role::Operator, Role::Admin]
        .iter()
        .map(|role| {
            let sel = if Some(*role) == selected { " selected" } else { "" };
            format!("<option value=\"{role}\"{sel}>{role}</option>")
        })
        .collect()
}

fn admin_sections(users: &[(String, Role)]) -> String {
    let user_options: String = users
        .iter()
        .map(|(name, role)| {
            let name = escape(name);
            format!("<option value=\"{name}\">{name} ({role})</option>")
        })
        .collect();

    format!(
        r#"<section>
<h2>⚙️ Model Management</h2>
<p>Upload new weights and metadata to replace the current model.</p>
<form method="post" action="/admin/model" enctype="multipart/form-data">
<div class="row">
<div><label for="weights">New model weights (.onnx)</label><input type="file" id="weights" name="weights" accept=".onnx,.pt"></div>
<div><label for="metadata">New metadata (.yaml)</label><input type="file" id="metadata" name="metadata" accept=".yaml,.yml"></div>
</div>
<button type="submit">Save &amp; Replace Model</button>
</form>
</section>
<section>
<h2>👥 User Management</h2>
<div class="row">
<form method="post" action="/admin/users">
<h3>Add New User</h3>
<label for="new-username">Username</label><input type="text" id="new-username" name="username">
<label for="new-password">Password</label><input type="password" id="new-password" name="password">
<label for="new-role">Role</label><select id="new-role" name="role">{add_roles}</select>
<button type="submit">Add User</button>
</form>
<form method="post" action="/admin/users/update">
<h3>Edit or Delete User</h3>
<label for="selected">Select user</label><select id="selected" name="selected">{user_options}</select>
<label for="edit-username">New username (leave blank to keep)</label><input type="text" id="edit-username" name="new_username">
<label for="edit-password">New password (leave blank to keep)</label><input type="password" id="edit-password" name="new_password">
<label for="edit-role">New role</label><select id="edit-role" name="new_role"><option value="">(unchanged)</option>{edit_roles}</select>
<button type="submit">Update User</button>
<button class="danger" type="submit" formaction="/admin/users/delete">Delete User</button>
</form>
</div>
</section>"#,
        add_roles = role_options(Some(Role::Operator)),
        edit_roles = role_options(None),
    )
}

/// The logged-in screen. `users` is only passed for admins.
pub fn dashboard_page(session: &Session, users: Option<&[(String, Role)]>, cache_bust: &str) -> String {
    let (username, role) = match &session.auth {
        AuthState::LoggedIn { username, role } => (username.as_str(), *role),
        AuthState::LoggedOut => return login_page(session),
    };

    let mut body = format!(
        r#"<header><h1>👷 Construction Safety Detection Dashboard</h1>
<div>Logged in as: <strong>{}</strong> ({role})
<form method="post" action="/logout" style="display:inline"><button type="submit">Logout</button></form></div></header>
{}
<section>
<h2>🔎 Video Detection</h2>
<form id="analyze-form" method="post" action="/analyze">
<label for="url">Video URL (YouTube or Google Drive)</label>
<input type="text" id="url" name="url" placeholder="Paste URL here...">
<button class="primary" type="submit">Analyze Video</button>
</form>
<progress id="progress" max="1" value="0" hidden></progress>
<p id="progress-label"></p>
</section>
"#,
        escape(username),
        notice(session)
    );
    body.push_str(&results_section(session, cache_bust));
    if let Some(users) = users {
        body.push_str(&admin_sections(users));
    }
    body.push_str(PROGRESS_SCRIPT);
    layout(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AnalysisOutcome;

    fn logged_in(role: Role) -> Session {
        Session {
            auth: AuthState::LoggedIn {
                username: "ana".into(),
                role,
            },
            ..Session::default()
        }
    }

    #[test]
    fn markdown_subset() {
        let html = markdown_to_html("### Title\n- **A:** `1`\n- B\n\n**x:** `00:01`, `00:05` ...");
        assert_eq!(
            html,
            "<h3>Title</h3><ul><li><strong>A:</strong> <code>1</code></li><li>B</li></ul>\
             <p><strong>x:</strong> <code>00:01</code>, <code>00:05</code> ...</p>"
        );
    }

    #[test]
    fn markdown_is_escaped() {
        assert_eq!(markdown_to_html("<b>&"), "<p>&lt;b&gt;&amp;</p>");
    }

    #[test]
    fn logged_out_sees_login_form() {
        let html = dashboard_page(&Session::default(), None, "0");
        assert!(html.contains("action=\"/login\""));
        assert!(!html.contains("/analyze"));
    }

    #[test]
    fn admin_panels_only_for_admins() {
        let users = vec![("ana".to_string(), Role::Admin)];
        let admin = dashboard_page(&logged_in(Role::Admin), Some(&users), "0");
        assert!(admin.contains("Model Management"));
        assert!(admin.contains("User Management"));

        let operator = dashboard_page(&logged_in(Role::Operator), None, "0");
        assert!(operator.contains("/analyze"));
        assert!(!operator.contains("Model Management"));
    }

    #[test]
    fn failed_run_shows_message_without_media() {
        let mut session = logged_in(Role::Operator);
        session.outcome = Some(AnalysisOutcome::failure("### ❌ An Error Occurred:\n`boom`"));
        let html = dashboard_page(&session, None, "0");
        assert!(html.contains("<code>boom</code>"));
        assert!(!html.contains("<video"));
        assert!(!html.contains("<img"));
    }
}
