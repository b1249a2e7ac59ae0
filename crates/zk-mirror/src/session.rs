//! Session lifecycle.
//!
//! ```text
//! Disconnected → Connecting → Connected ⇄ Disconnected
//!                                 ↓
//!                              Expired  (terminal for the session identity)
//! ```
//!
//! `Closed` is entered once the mirror is closed and never left. A `Connected`
//! announced after `Expired` is a fresh session and triggers a full
//! re-population.

use crate::error::{MirrorError, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// State of the logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
    Closed,
}

/// Follow-up work the router owes a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionAction {
    /// Nothing to do.
    None,
    /// (Re)connected: populate the root if needed and retry failed re-arms.
    Resume,
    /// Every watch is void: tombstone the whole cache.
    Invalidate,
}

pub(crate) struct SessionController {
    state: watch::Sender<SessionState>,
}

impl SessionController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self { state }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether the mirror has not been closed.
    pub fn is_alive(&self) -> bool {
        self.state() != SessionState::Closed
    }

    /// Fail fast when the session can't serve callers.
    pub fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            SessionState::Closed => Err(MirrorError::Closed),
            SessionState::Expired => Err(MirrorError::SessionExpired),
            _ => Ok(()),
        }
    }

    /// Apply a state reported by the client (or by `open`).
    ///
    /// Returns `None` if the transition was ignored, otherwise the previous
    /// state and the work it requires.
    pub fn transition(&self, next: SessionState) -> Option<(SessionState, SessionAction)> {
        let previous = self.state();
        if previous == SessionState::Closed {
            debug!("Ignoring {:?} after close", next);
            return None;
        }

        let action = match next {
            SessionState::Connected => SessionAction::Resume,
            SessionState::Expired if previous != SessionState::Expired => {
                SessionAction::Invalidate
            }
            _ => SessionAction::None,
        };

        self.state.send_replace(next);
        match next {
            SessionState::Connected if previous == SessionState::Expired => {
                info!("New session established after expiry")
            }
            SessionState::Connected => info!("Connected (was {:?})", previous),
            SessionState::Expired => warn!("Session expired"),
            SessionState::Disconnected => warn!("Disconnected (was {:?})", previous),
            other => debug!("Session state {:?} -> {:?}", previous, other),
        }
        Some((previous, action))
    }

    /// Enter `Closed`. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        self.state.send_replace(SessionState::Closed) != SessionState::Closed
    }

    /// Block until `Connected`, failing on expiry, close or timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Expired => return Err(MirrorError::SessionExpired),
                    SessionState::Closed => return Err(MirrorError::Closed),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(MirrorError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MirrorError::ConnectTimeout(timeout.as_millis() as u64))?
    }
}
