//! Per-browser session state: who is logged in, their last result and the
//! progress of a running analysis.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config;
use crate::error::{DashboardError, Result};
use crate::pipeline::AnalysisOutcome;
use crate::store::{Role, UserStore};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    LoggedOut,
    LoggedIn { username: String, role: Role },
}

impl AuthState {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, AuthState::LoggedIn { .. })
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, AuthState::LoggedIn { role: Role::Admin, .. })
    }

    /// Gate for admin-only actions.
    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(DashboardError::Unauthorized)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub auth: AuthState,
    pub outcome: Option<AnalysisOutcome>,
    pub progress: Option<(f32, String)>,
    /// Status line under the login form or an admin panel.
    pub notice: Option<String>,
}

pub const LOGIN_FAILED: &str = "Incorrect username or password.";

/// LoggedOut → LoggedIn on valid credentials; the state is unchanged on
/// failure.
pub fn login(users: &UserStore, session: &mut Session, username: &str, password: &str) -> Result<()> {
    match users.authenticate(username.trim(), password)? {
        Some(role) => {
            tracing::info!(user = username.trim(), %role, "login");
            session.auth = AuthState::LoggedIn {
                username: username.trim().to_string(),
                role,
            };
            session.notice = None;
            Ok(())
        }
        None => {
            tracing::warn!(user = username.trim(), "failed login");
            Err(DashboardError::Input(LOGIN_FAILED.to_string()))
        }
    }
}

/// LoggedIn → LoggedOut, dropping any displayed results.
pub fn logout(session: &mut Session) {
    if let AuthState::LoggedIn { username, .. } = &session.auth {
        tracing::info!(user = %username, "logout");
    }
    *session = Session::default();
}

/// Re-read the account behind a logged-in session. A deleted account is
/// logged out and a changed role applies at once.
pub fn refresh(users: &UserStore, session: &mut Session) -> Result<()> {
    let AuthState::LoggedIn { username, role } = &session.auth else {
        return Ok(());
    };
    let (username, role) = (username.clone(), *role);
    match users.role_of(&username)? {
        None => {
            tracing::warn!(user = %username, "account removed; ending session");
            logout(session);
        }
        Some(current) if current != role => {
            tracing::info!(user = %username, %current, "role changed");
            session.auth = AuthState::LoggedIn {
                username,
                role: current,
            };
        }
        Some(_) => {}
    }
    Ok(())
}

/// Admin gate checked against the user store rather than the role seen at
/// login. A session whose account was deleted or demoted is logged out.
pub fn require_current_admin(users: &UserStore, session: &mut Session) -> Result<()> {
    session.auth.require_admin()?;
    let AuthState::LoggedIn { username, .. } = &session.auth else {
        return Err(DashboardError::Unauthorized);
    };
    if users.role_of(username)? == Some(Role::Admin) {
        return Ok(());
    }
    tracing::warn!(user = %username, "admin rights revoked; ending session");
    logout(session);
    Err(DashboardError::Unauthorized)
}

struct Slot {
    session: Session,
    last_seen: Instant,
}

/// Logged-in sessions keyed by their cookie id. Sessions idle for longer
/// than the timeout are dropped, and the least recently used one is evicted
/// when the registry is full.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Slot>>,
    capacity: usize,
    idle: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_limits(
            config::MAX_SESSIONS,
            Duration::from_secs(config::SESSION_IDLE_SECS),
        )
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, idle: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            idle,
        }
    }

    /// Register `session` under a fresh id.
    pub fn create(&self, session: Session) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let idle = self.idle;

        let mut sessions = self.lock();
        sessions.retain(|_, slot| now.duration_since(slot.last_seen) < idle);
        while sessions.len() >= self.capacity {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, slot)| slot.last_seen)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    sessions.remove(&oldest);
                }
                None => break,
            }
        }
        sessions.insert(
            id.clone(),
            Slot {
                session,
                last_seen: now,
            },
        );
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.with(id, |_| ()).is_some()
    }

    /// Run `f` on the live session `id`. Touching a session keeps it alive.
    pub fn with<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let expired = now.duration_since(sessions.get(id)?.last_seen) >= self.idle;
        if expired {
            sessions.remove(id);
            return None;
        }
        let slot = sessions.get_mut(id)?;
        slot.last_seen = now;
        Some(f(&mut slot.session))
    }

    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.with(id, |session| session.clone())
    }

    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn login_then_logout() {
        let dir = TempDir::new().unwrap();
        let users = UserStore::new(dir.path().join("users.json"));
        let mut session = Session::default();

        assert!(login(&users, &mut session, "admin", "nope").is_err());
        assert_eq!(session.auth, AuthState::LoggedOut);

        login(&users, &mut session, "admin", "admin123").unwrap();
        assert!(session.auth.is_admin());
        session.outcome = Some(AnalysisOutcome::failure("x"));

        logout(&mut session);
        assert_eq!(session.auth, AuthState::LoggedOut);
        assert!(session.outcome.is_none());
    }

    #[test]
    fn operators_are_not_admins() {
        let dir = TempDir::new().unwrap();
        let users = UserStore::new(dir.path().join("users.json"));
        users.add_user("op", "pw", Role::Operator).unwrap();
        let mut session = Session::default();
        login(&users, &mut session, "op", "pw").unwrap();

        assert!(session.auth.is_logged_in());
        assert!(matches!(
            session.auth.require_admin(),
            Err(DashboardError::Unauthorized)
        ));
        assert!(AuthState::LoggedOut.require_admin().is_err());
    }

    #[test]
    fn registry_sessions_are_isolated() {
        let registry = SessionRegistry::new();
        let a = registry.create(Session::default());
        let b = registry.create(Session::default());
        assert_ne!(a, b);

        registry.with(&a, |s| s.notice = Some("hello".into()));
        assert_eq!(registry.snapshot(&a).unwrap().notice.as_deref(), Some("hello"));
        assert!(registry.snapshot(&b).unwrap().notice.is_none());

        registry.remove(&a);
        assert!(!registry.contains(&a));
        assert!(registry.with(&a, |_| ()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn full_registry_evicts_least_recently_used() {
        let registry = SessionRegistry::with_limits(2, Duration::from_secs(3600));
        let first = registry.create(Session::default());
        let second = registry.create(Session::default());
        std::thread::sleep(Duration::from_millis(5));
        registry.with(&first, |_| ());

        let third = registry.create(Session::default());
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&first));
        assert!(!registry.contains(&second));
        assert!(registry.contains(&third));

        for _ in 0..1000 {
            registry.create(Session::default());
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn idle_sessions_expire() {
        let registry = SessionRegistry::with_limits(8, Duration::ZERO);
        let id = registry.create(Session::default());
        assert!(registry.snapshot(&id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn deleted_admin_fails_current_admin_check() {
        let dir = TempDir::new().unwrap();
        let users = UserStore::new(dir.path().join("users.json"));
        users.add_user("root", "pw", Role::Admin).unwrap();
        let mut session = Session::default();
        login(&users, &mut session, "root", "pw").unwrap();
        require_current_admin(&users, &mut session).unwrap();

        users.delete_user("root").unwrap();
        assert!(matches!(
            require_current_admin(&users, &mut session),
            Err(DashboardError::Unauthorized)
        ));
        assert_eq!(session.auth, AuthState::LoggedOut);
    }

    #[test]
    fn demoted_admin_is_logged_out_of_admin_actions() {
        let dir = TempDir::new().unwrap();
        let users = UserStore::new(dir.path().join("users.json"));
        users.add_user("root", "pw", Role::Admin).unwrap();
        let mut session = Session::default();
        login(&users, &mut session, "root", "pw").unwrap();

        users.update_user("root", None, None, Some(Role::Operator)).unwrap();
        assert!(require_current_admin(&users, &mut session).is_err());
        assert!(!session.auth.is_logged_in());
    }

    #[test]
    fn refresh_follows_the_user_store() {
        let dir = TempDir::new().unwrap();
        let users = UserStore::new(dir.path().join("users.json"));
        users.add_user("op", "pw", Role::Operator).unwrap();
        let mut session = Session::default();
        login(&users, &mut session, "op", "pw").unwrap();

        users.update_user("op", None, None, Some(Role::Admin)).unwrap();
        refresh(&users, &mut session).unwrap();
        assert!(session.auth.is_admin());

        users.delete_user("op").unwrap();
        refresh(&users, &mut session).unwrap();
        assert_eq!(session.auth, AuthState::LoggedOut);

        refresh(&users, &mut session).unwrap();
        assert_eq!(session.auth, AuthState::LoggedOut);
    }
}
