//! Web dashboard: login, analysis, admin panels.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::util::ServiceExt;
use tower_http::services::ServeFile;

use crate::config::{OUTPUT_VIDEO, STATS_CHART};
use crate::error::DashboardError;
use crate::pages;
use crate::pipeline::{AnalysisOutcome, Pipeline};
use crate::session::{self, Session, SessionRegistry};
use crate::store::{ModelStore, Role, Upload, UserStore};

const SESSION_COOKIE: &str = "sitesafe_session";
const MAX_MODEL_UPLOAD: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub users: UserStore,
    pub models: ModelStore,
    pub pipeline: Pipeline,
    pub sessions: SessionRegistry,
    /// Runs share fixed temp file names, so only one may be in flight.
    pub run_lock: tokio::sync::Mutex<()>,
}

type Shared = Arc<AppState>;

impl AppState {
    pub fn new(users: UserStore, models: ModelStore, pipeline: Pipeline) -> Self {
        Self {
            users,
            models,
            pipeline,
            sessions: SessionRegistry::new(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Session id from the request cookie, if it names a live session.
fn session_id(app: &AppState, headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|id| app.sessions.contains(id))
}

/// The request's logged-in session, re-checked against the user store.
/// Sessions whose account is gone are dropped.
fn current_session(app: &AppState, headers: &HeaderMap) -> Option<(String, Session)> {
    let id = session_id(app, headers)?;
    let session = app.sessions.with(&id, |s| {
        if let Err(e) = session::refresh(&app.users, s) {
            tracing::error!("failed to refresh session: {}", e);
        }
        s.clone()
    })?;
    if session.auth.is_logged_in() {
        Some((id, session))
    } else {
        app.sessions.remove(&id);
        None
    }
}

fn redirect_home(set_cookie: Option<&str>) -> Response {
    let mut response = Redirect::to("/").into_response();
    if let Some(id) = set_cookie {
        let cookie = format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

fn cache_bust() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

#[derive(Deserialize, Default)]
struct IndexQuery {
    login: Option<String>,
}

async fn index(
    State(app): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<IndexQuery>,
) -> Html<String> {
    let Some((_, session)) = current_session(&app, &headers) else {
        let notice = match query.login.as_deref() {
            Some("failed") => Some(session::LOGIN_FAILED.to_string()),
            Some("error") => Some("Login is unavailable, please try again.".to_string()),
            _ => None,
        };
        return Html(pages::login_page(&Session {
            notice,
            ..Default::default()
        }));
    };

    let users = if session.auth.is_admin() {
        match app.users.list_users() {
            Ok(users) => Some(users),
            Err(e) => {
                tracing::error!("failed to list users: {}", e);
                Some(Vec::new())
            }
        }
    } else {
        None
    };
    Html(pages::dashboard_page(&session, users.as_deref(), &cache_bust()))
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

/// Sessions exist only for authenticated users; a failed attempt is reported
/// through the redirect target.
async fn login(State(app): State<Shared>, headers: HeaderMap, Form(form): Form<LoginForm>) -> Response {
    let mut fresh = Session::default();
    match session::login(&app.users, &mut fresh, &form.username, &form.password) {
        Ok(()) => {
            if let Some(previous) = session_id(&app, &headers) {
                app.sessions.remove(&previous);
            }
            let id = app.sessions.create(fresh);
            tracing::debug!(sessions = app.sessions.len(), "session created");
            redirect_home(Some(&id))
        }
        Err(DashboardError::Input(_)) => Redirect::to("/?login=failed").into_response(),
        Err(e) => {
            tracing::error!("login failed: {}", e);
            Redirect::to("/?login=error").into_response()
        }
    }
}

async fn logout(State(app): State<Shared>, headers: HeaderMap) -> Response {
    if let Some(id) = session_id(&app, &headers) {
        {
            let _run = app.run_lock.lock().await;
            app.pipeline.cleanup_temp_files();
        }
        app.sessions.with(&id, session::logout);
        app.sessions.remove(&id);
    }
    redirect_home(None)
}

#[derive(Deserialize)]
struct AnalyzeForm {
    url: String,
}

async fn analyze(State(app): State<Shared>, headers: HeaderMap, Form(form): Form<AnalyzeForm>) -> Response {
    let Some((id, _)) = current_session(&app, &headers) else {
        return redirect_home(None);
    };

    let _run = app.run_lock.lock().await;
    app.sessions.with(&id, |s| {
        s.outcome = None;
        s.notice = None;
        s.progress = Some((0.0, "Starting...".to_string()));
    });

    let worker = app.clone();
    let session = id.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut progress = |fraction: f32, message: &str| {
            worker
                .sessions
                .with(&session, |s| s.progress = Some((fraction, message.to_string())));
        };
        worker
            .pipeline
            .process_video(&worker.models, &form.url, &mut progress)
    })
    .await;

    let outcome = result.unwrap_or_else(|e| {
        tracing::error!("analysis task panicked: {}", e);
        AnalysisOutcome::failure(format!("### ❌ An Error Occurred:\n`{e}`"))
    });
    app.sessions.with(&id, |s| {
        s.outcome = Some(outcome);
        s.progress = None;
    });
    redirect_home(None)
}

#[derive(Serialize)]
struct ProgressView {
    fraction: f32,
    message: String,
}

async fn progress(State(app): State<Shared>, headers: HeaderMap) -> Response {
    let Some(id) = session_id(&app, &headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let (fraction, message) = app
        .sessions
        .snapshot(&id)
        .and_then(|s| s.progress)
        .unwrap_or((0.0, String::new()));
    Json(ProgressView { fraction, message }).into_response()
}

async fn serve_output(
    State(app): State<Shared>,
    Path(name): Path<String>,
    req: Request,
) -> Response {
    if current_session(&app, req.headers()).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let paths = app.pipeline.paths();
    let path = match name.as_str() {
        OUTPUT_VIDEO => paths.output_video(),
        STATS_CHART => paths.stats_chart(),
        _ => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };

    match ServeFile::new(path).oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serve file: {}", err),
        )
            .into_response(),
    }
}

fn admin_notice(result: Result<String, DashboardError>) -> String {
    match result {
        Ok(message) => message,
        Err(DashboardError::Unauthorized) => "Access denied.".to_string(),
        Err(e) => format!("❌ {e}"),
    }
}

/// Session id of a current admin, or the response refusing the request.
/// A session whose admin rights were revoked is ended.
fn authorize_admin(app: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(id) = session_id(app, headers) else {
        return Err(redirect_home(None));
    };
    let verdict = app
        .sessions
        .with(&id, |s| session::require_current_admin(&app.users, s));
    match verdict {
        Some(Ok(())) => Ok(id),
        Some(Err(e)) => {
            let still_logged_in = app
                .sessions
                .snapshot(&id)
                .is_some_and(|s| s.auth.is_logged_in());
            if still_logged_in {
                let message = admin_notice(Err(e));
                app.sessions.with(&id, |s| s.notice = Some(message));
            } else {
                app.sessions.remove(&id);
            }
            Err(redirect_home(None))
        }
        None => Err(redirect_home(None)),
    }
}

/// Run an admin action for the request's session and show its outcome as
/// the session notice.
fn admin_action(
    app: &AppState,
    headers: &HeaderMap,
    action: impl FnOnce() -> Result<String, DashboardError>,
) -> Response {
    let id = match authorize_admin(app, headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let message = admin_notice(action());
    app.sessions.with(&id, |s| s.notice = Some(message));
    redirect_home(None)
}

async fn upload_model(State(app): State<Shared>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    // Refuse before any of the upload body is buffered.
    let id = match authorize_admin(&app, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut weights: Option<(String, Vec<u8>)> = None;
    let mut metadata: Option<(String, Vec<u8>)> = None;
    let mut read_error = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or_default().to_string();
                let file_name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => match name.as_str() {
                        "weights" => weights = Some((file_name, bytes.to_vec())),
                        "metadata" => metadata = Some((file_name, bytes.to_vec())),
                        _ => {}
                    },
                    Err(e) => {
                        read_error = Some(e.to_string());
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                read_error = Some(e.to_string());
                break;
            }
        }
    }

    let result = (|| -> Result<String, DashboardError> {
        if let Some(e) = read_error {
            return Err(DashboardError::Input(format!("Upload failed: {e}")));
        }
        let (Some((weights_name, weights_bytes)), Some((yaml_name, yaml_bytes))) = (&weights, &metadata) else {
            return Err(DashboardError::Input("Please upload both files.".to_string()));
        };
        let dest = app.models.replace_model(
            Upload {
                file_name: weights_name,
                bytes: weights_bytes,
            },
            Upload {
                file_name: yaml_name,
                bytes: yaml_bytes,
            },
        )?;
        let shown = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("✅ Model updated. Now using `{shown}`."))
    })();
    let message = admin_notice(result);
    app.sessions.with(&id, |s| s.notice = Some(message));
    redirect_home(None)
}

#[derive(Deserialize)]
struct AddUserForm {
    username: String,
    password: String,
    role: String,
}

async fn add_user(State(app): State<Shared>, headers: HeaderMap, Form(form): Form<AddUserForm>) -> Response {
    admin_action(&app, &headers, || {
        let role: Role = form.role.parse()?;
        app.users.add_user(&form.username, &form.password, role)?;
        Ok(format!(
            "✅ User '{}' with role '{role}' added.",
            form.username.trim()
        ))
    })
}

#[derive(Deserialize)]
struct UpdateUserForm {
    #[serde(default)]
    selected: String,
    #[serde(default)]
    new_username: String,
    #[serde(default)]
    new_password: String,
    #[serde(default)]
    new_role: String,
}

async fn update_user(State(app): State<Shared>, headers: HeaderMap, Form(form): Form<UpdateUserForm>) -> Response {
    admin_action(&app, &headers, || {
        let role = match form.new_role.trim() {
            "" => None,
            other => Some(other.parse::<Role>()?),
        };
        let final_name = app.users.update_user(
            &form.selected,
            Some(&form.new_username),
            Some(&form.new_password),
            role,
        )?;
        Ok(format!(
            "✅ User '{}' updated to '{final_name}'.",
            form.selected
        ))
    })
}

#[derive(Deserialize)]
struct DeleteUserForm {
    #[serde(default)]
    selected: String,
}

async fn delete_user(State(app): State<Shared>, headers: HeaderMap, Form(form): Form<DeleteUserForm>) -> Response {
    admin_action(&app, &headers, || {
        app.users.delete_user(&form.selected)?;
        Ok(format!("✅ User '{}' deleted.", form.selected))
    })
}

pub fn router(state: Shared) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/analyze", post(analyze))
        .route("/progress", get(progress))
        .route("/files/:name", get(serve_output))
        .route(
            "/admin/model",
            post(upload_model).layer(DefaultBodyLimit::max(MAX_MODEL_UPLOAD)),
        )
        .route("/admin/users", post(add_user))
        .route("/admin/users/update", post(update_user))
        .route("/admin/users/delete", post(delete_user))
        .with_state(state)
}

pub async fn serve(state: AppState, bind: SocketAddr) -> anyhow::Result<()> {
    let app = router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("dashboard listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
