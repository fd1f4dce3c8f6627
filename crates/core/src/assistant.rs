//! The host-facing entry point: at most one live voice session at a time.

use crate::{
    error::SessionError,
    schedule::ContextSnapshot,
    session::{SessionConfig, SessionController, SessionDeps},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

/// Identifies one opened session. Handles of replaced sessions go stale and
/// are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: Uuid,
    generation: u64,
}

#[derive(Default)]
struct Current {
    generation: u64,
    session: Option<(u64, SessionController)>,
}

pub struct Assistant {
    config: SessionConfig,
    deps: SessionDeps,
    on_session_closed: Arc<dyn Fn(SessionHandle) + Send + Sync>,
    current: Arc<Mutex<Current>>,
    // Held across the whole close-previous, install, start sequence.
    opening: tokio::sync::Mutex<()>,
}

impl Assistant {
    /// `on_session_closed` is called once per session that reaches `Closed`.
    pub fn new(
        config: SessionConfig,
        deps: SessionDeps,
        on_session_closed: impl Fn(SessionHandle) + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            deps,
            on_session_closed: Arc::new(on_session_closed),
            current: Arc::new(Mutex::new(Current::default())),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a new session seeded with `snapshot`, closing any previous one
    /// first. Resolves once the session is listening. Concurrent calls run
    /// one after another, so the last one to finish owns the live session.
    pub async fn open_session(
        &self,
        snapshot: ContextSnapshot,
    ) -> Result<SessionHandle, SessionError> {
        let _opening = self.opening.lock().await;
        let previous = lock(&self.current).session.take();
        if let Some((_, previous)) = previous {
            info!(session_id = %previous.id(), "Closing previous voice session");
            previous.close();
            previous.wait_closed().await;
        }

        let generation = {
            let mut current = lock(&self.current);
            current.generation += 1;
            current.generation
        };

        let current = Arc::downgrade(&self.current);
        let on_session_closed = self.on_session_closed.clone();
        // The id is only known once the controller exists.
        let handle_slot: Arc<Mutex<Option<SessionHandle>>> = Arc::default();
        let slot = handle_slot.clone();
        let controller = SessionController::new(self.config.clone(), self.deps.clone(), move || {
            if let Some(current) = current.upgrade() {
                let mut current = lock(&current);
                if matches!(current.session, Some((g, _)) if g == generation) {
                    current.session = None;
                }
            }
            if let Some(handle) = *lock(&slot) {
                on_session_closed(handle);
            }
        });

        let handle = SessionHandle {
            id: controller.id(),
            generation,
        };
        *lock(&handle_slot) = Some(handle);
        lock(&self.current).session = Some((generation, controller.clone()));

        let span = info_span!("voice_session", session_id = %handle.id);
        controller.start(snapshot).instrument(span).await?;
        Ok(handle)
    }

    /// Closes the session behind `handle`. Stale handles and repeated calls
    /// are no-ops.
    pub fn close_session(&self, handle: &SessionHandle) {
        if let Some(session) = self.session(handle) {
            session.close();
        }
    }

    /// The live session behind `handle`, if it is still the current one.
    pub fn session(&self, handle: &SessionHandle) -> Option<SessionController> {
        let current = lock(&self.current);
        match &current.session {
            Some((generation, session)) if *generation == handle.generation => Some(session.clone()),
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
