//! Top-level screen state machine.
//!
//! `advance` is a pure transition function over [`Session`]; the idle timer
//! lives beside it as [`IdleTimer`], which only talks to the injected
//! scheduler and never touches the session itself. The App reads the
//! current session when the timer fires and decides whether to feed
//! [`SessionEvent::IdleTimeout`] through `advance`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::auth::AuthFlow;
use crate::capabilities::Scheduler;
use crate::event::{Event, Path, SessionEvent};
use crate::model::{AttemptId, Identity, Mode, Route, TimerId, UnixTimeMs};

/// Each variant carries exactly the data valid for it: a citizen identity
/// can only exist on the dashboard, and only guest/dashboard have a route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "screen", rename_all = "kebab-case")]
pub enum Screen {
    Idle,
    Gateway,
    CitizenAuth { flow: AuthFlow },
    Guest { route: Route },
    CitizenDashboard { citizen: Identity, route: Route },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenKind {
    Idle,
    Gateway,
    CitizenAuth,
    Guest,
    CitizenDashboard,
}

impl Screen {
    #[must_use]
    pub fn kind(&self) -> ScreenKind {
        match self {
            Screen::Idle => ScreenKind::Idle,
            Screen::Gateway => ScreenKind::Gateway,
            Screen::CitizenAuth { .. } => ScreenKind::CitizenAuth,
            Screen::Guest { .. } => ScreenKind::Guest,
            Screen::CitizenDashboard { .. } => ScreenKind::CitizenDashboard,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub screen: Screen,
    pub last_activity_at: UnixTimeMs,
    /// Seed for the next citizen-auth attempt id.
    auth_attempts: AttemptId,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            screen: Screen::Idle,
            last_activity_at: UnixTimeMs(0),
            auth_attempts: AttemptId::default(),
        }
    }

    /// Guest or citizen; `None` outside the two screens that render routes.
    #[must_use]
    pub fn mode(&self) -> Option<Mode> {
        match self.screen {
            Screen::Guest { .. } => Some(Mode::Guest),
            Screen::CitizenDashboard { .. } => Some(Mode::Citizen),
            _ => None,
        }
    }

    #[must_use]
    pub fn route(&self) -> Option<Route> {
        match &self.screen {
            Screen::Guest { route } | Screen::CitizenDashboard { route, .. } => Some(*route),
            _ => None,
        }
    }

    #[must_use]
    pub fn citizen(&self) -> Option<&Identity> {
        match &self.screen {
            Screen::CitizenDashboard { citizen, .. } => Some(citizen),
            _ => None,
        }
    }

    #[must_use]
    pub fn auth_flow(&self) -> Option<&AuthFlow> {
        match &self.screen {
            Screen::CitizenAuth { flow } => Some(flow),
            _ => None,
        }
    }

    pub fn auth_flow_mut(&mut self) -> Option<&mut AuthFlow> {
        match &mut self.screen {
            Screen::CitizenAuth { flow } => Some(flow),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.screen, Screen::Idle)
    }

    /// Whether an idle timeout may reset this session right now.
    #[must_use]
    pub fn idle_reset_allowed(&self) -> bool {
        !self.is_idle() && !self.route().is_some_and(Route::is_admin)
    }

    pub fn touch(&mut self, now: UnixTimeMs) {
        self.last_activity_at = now;
    }

    fn reset(self) -> Session {
        Session {
            screen: Screen::Idle,
            ..self
        }
    }

    fn with_screen(self, screen: Screen) -> Session {
        Session { screen, ..self }
    }
}

/// Pure session transition. Events that do not apply to the current screen
/// leave the session unchanged.
#[must_use]
pub fn advance(session: Session, event: SessionEvent) -> Session {
    let from = session.screen.kind();

    let next = match (session.screen.clone(), event) {
        (_, SessionEvent::DevOverride(screen)) => session.with_screen(*screen),

        (Screen::Idle, SessionEvent::Start) => session.with_screen(Screen::Gateway),

        (Screen::Gateway, SessionEvent::SelectPath(Path::Guest)) => {
            session.with_screen(Screen::Guest { route: Route::Home })
        }
        (Screen::Gateway, SessionEvent::SelectPath(Path::Citizen)) => {
            let attempt = session.auth_attempts.next();
            Session {
                screen: Screen::CitizenAuth {
                    flow: AuthFlow::new(attempt),
                },
                auth_attempts: attempt,
                ..session
            }
        }

        (Screen::CitizenAuth { .. }, SessionEvent::Authenticated(citizen)) => {
            session.with_screen(Screen::CitizenDashboard {
                citizen,
                route: Route::Home,
            })
        }

        (Screen::CitizenDashboard { .. }, SessionEvent::Logout) => {
            session.with_screen(Screen::Gateway)
        }

        (Screen::Guest { .. }, SessionEvent::GoHome) => {
            session.with_screen(Screen::Guest { route: Route::Home })
        }
        (Screen::CitizenDashboard { citizen, .. }, SessionEvent::GoHome) => {
            session.with_screen(Screen::CitizenDashboard {
                citizen,
                route: Route::Home,
            })
        }
        (_, SessionEvent::GoHome) => session.reset(),

        (_, SessionEvent::IdleTimeout) if session.idle_reset_allowed() => session.reset(),

        (Screen::Guest { .. }, SessionEvent::Navigate(route)) => {
            session.with_screen(Screen::Guest { route })
        }
        (Screen::CitizenDashboard { citizen, .. }, SessionEvent::Navigate(route)) => {
            session.with_screen(Screen::CitizenDashboard { citizen, route })
        }

        (_, ignored) => {
            debug!(screen = ?from, event = ?ignored, "session event ignored");
            return session;
        }
    };

    if next.screen.kind() != from {
        info!(from = ?from, to = ?next.screen.kind(), "screen transition");
    }
    next
}

// --- Idle timer: single-shot, rearmed on activity ---

#[derive(Debug)]
pub struct IdleTimer {
    timeout: Duration,
    pending: Option<TimerId>,
    generation: u64,
}

impl IdleTimer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Cancels any pending fire and schedules a fresh one. At most one fire
    /// is ever outstanding.
    pub fn rearm(&mut self, now: UnixTimeMs, scheduler: &dyn Scheduler) {
        self.disarm(scheduler);
        self.generation = self.generation.wrapping_add(1);
        let id = scheduler.schedule(
            self.timeout,
            Event::IdleTimerFired {
                armed_at: now,
                generation: self.generation,
            },
        );
        self.pending = Some(id);
    }

    pub fn disarm(&mut self, scheduler: &dyn Scheduler) {
        if let Some(id) = self.pending.take() {
            scheduler.cancel(id);
        }
    }

    /// Accepts a fire only from the currently armed generation. A fire that
    /// was already in flight when the timer got rearmed is stale.
    pub fn accept_fire(&mut self, generation: u64) -> bool {
        if self.pending.is_none() || generation != self.generation {
            return false;
        }
        self.pending = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ManualScheduler;
    use crate::model::ServiceType;

    fn citizen() -> Identity {
        Identity {
            name: "Vivek Kumar".into(),
            contact_ref: "9876543210".into(),
            citizen_ref: None,
        }
    }

    fn dashboard(route: Route) -> Session {
        advance(
            Session::new(),
            SessionEvent::DevOverride(Box::new(Screen::CitizenDashboard {
                citizen: citizen(),
                route,
            })),
        )
    }

    #[test]
    fn start_moves_idle_to_gateway() {
        let s = advance(Session::new(), SessionEvent::Start);
        assert_eq!(s.screen, Screen::Gateway);
        assert_eq!(s.mode(), None);
    }

    #[test]
    fn guest_path_lands_on_home() {
        let s = advance(Session::new(), SessionEvent::Start);
        let s = advance(s, SessionEvent::SelectPath(Path::Guest));
        assert_eq!(s.screen, Screen::Guest { route: Route::Home });
        assert_eq!(s.mode(), Some(Mode::Guest));
    }

    #[test]
    fn citizen_path_requires_authentication() {
        let s = advance(Session::new(), SessionEvent::Start);
        let s = advance(s, SessionEvent::SelectPath(Path::Citizen));
        assert_eq!(s.screen.kind(), ScreenKind::CitizenAuth);
        assert!(s.citizen().is_none());

        let s = advance(s, SessionEvent::Authenticated(citizen()));
        assert_eq!(s.screen.kind(), ScreenKind::CitizenDashboard);
        assert_eq!(s.route(), Some(Route::Home));
        assert_eq!(s.citizen().map(|c| c.name.as_str()), Some("Vivek Kumar"));
    }

    #[test]
    fn each_auth_visit_gets_a_fresh_attempt() {
        let s = advance(Session::new(), SessionEvent::Start);
        let s = advance(s, SessionEvent::SelectPath(Path::Citizen));
        let first = s.auth_flow().map(|f| f.attempt);
        let s = advance(s, SessionEvent::GoHome);
        let s = advance(s, SessionEvent::Start);
        let s = advance(s, SessionEvent::SelectPath(Path::Citizen));
        assert_ne!(first, s.auth_flow().map(|f| f.attempt));
    }

    #[test]
    fn stale_authentication_is_ignored() {
        let s = advance(Session::new(), SessionEvent::Start);
        let s = advance(s.clone(), SessionEvent::Authenticated(citizen()));
        assert_eq!(s.screen, Screen::Gateway);
        assert!(s.citizen().is_none());
    }

    #[test]
    fn logout_clears_identity() {
        let s = advance(dashboard(Route::Complaint), SessionEvent::Logout);
        assert_eq!(s.screen, Screen::Gateway);
        assert!(s.citizen().is_none());
    }

    #[test]
    fn go_home_keeps_screen_when_routed() {
        let s = advance(dashboard(Route::Bill(ServiceType::Water)), SessionEvent::GoHome);
        assert_eq!(s.screen.kind(), ScreenKind::CitizenDashboard);
        assert_eq!(s.route(), Some(Route::Home));
        assert!(s.citizen().is_some());
    }

    #[test]
    fn go_home_elsewhere_resets_to_idle() {
        let s = advance(Session::new(), SessionEvent::Start);
        let s = advance(s, SessionEvent::SelectPath(Path::Citizen));
        let s = advance(s, SessionEvent::GoHome);
        assert!(s.is_idle());
    }

    #[test]
    fn idle_timeout_resets_and_clears_identity() {
        let s = advance(dashboard(Route::Complaint), SessionEvent::IdleTimeout);
        assert!(s.is_idle());
        assert!(s.citizen().is_none());
        assert_eq!(s.route(), None);
    }

    #[test]
    fn idle_timeout_never_applies_on_admin() {
        let s = advance(dashboard(Route::Admin), SessionEvent::IdleTimeout);
        assert_eq!(s.route(), Some(Route::Admin));
        assert!(s.citizen().is_some());
    }

    #[test]
    fn navigation_is_guarded_outside_routed_screens() {
        let s = advance(Session::new(), SessionEvent::Start);
        let s = advance(s, SessionEvent::Navigate(Route::Admin));
        assert_eq!(s.screen, Screen::Gateway);
    }

    #[test]
    fn dev_override_bypasses_guards() {
        let s = advance(Session::new(), SessionEvent::DevOverride(Box::new(Screen::Guest { route: Route::Admin })));
        assert_eq!(s.route(), Some(Route::Admin));
    }

    #[test]
    fn idle_timer_rearm_keeps_one_pending_fire() {
        let sched = ManualScheduler::new(UnixTimeMs(0));
        let mut timer = IdleTimer::new(Duration::from_secs(120));
        timer.rearm(UnixTimeMs(0), &sched);
        timer.rearm(UnixTimeMs(0), &sched);
        timer.rearm(UnixTimeMs(0), &sched);
        assert_eq!(sched.pending_count(), 1);
    }

    #[test]
    fn idle_timer_rejects_stale_generation() {
        let sched = ManualScheduler::new(UnixTimeMs(0));
        let mut timer = IdleTimer::new(Duration::from_secs(120));
        timer.rearm(UnixTimeMs(0), &sched);
        timer.rearm(UnixTimeMs(10), &sched);
        assert!(!timer.accept_fire(1));
        assert!(timer.accept_fire(2));
        assert!(!timer.accept_fire(2));
    }
}
