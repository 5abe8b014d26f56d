//! Session table for open tunnels and log streams.
//!
//! Each session moves `Open -> Active -> Disposed`. Disposing cancels the
//! attached operation. Disposed sessions stay visible through [`SessionTable::get`]
//! but drop out of [`SessionTable::live`].

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::CancelHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    Tunnel,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Active,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    Unknown(SessionId),
    #[error("session {id} is {state:?}; cannot {action}")]
    InvalidTransition { id: SessionId, state: SessionState, action: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    /// Human-readable target, e.g. `team-a/dev-team-a-checkout-7f9c4d-x2k1p`.
    pub target: String,
    pub state: SessionState,
}

struct Entry {
    info: SessionInfo,
    cancel: Option<CancelHandle>,
}

/// Sessions keyed by generated id, listed in open order.
#[derive(Default)]
pub struct SessionTable {
    entries: HashMap<SessionId, Entry>,
    order: Vec<SessionId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, kind: SessionKind, target: impl Into<String>) -> SessionId {
        let id = SessionId::generate();
        let info = SessionInfo { id, kind, target: target.into(), state: SessionState::Open };
        debug!(session = %id, kind = ?kind, target = %info.target, "session opened");
        self.entries.insert(id, Entry { info, cancel: None });
        self.order.push(id);
        id
    }

    fn entry_mut(&mut self, id: SessionId) -> Result<&mut Entry, SessionError> {
        self.entries.get_mut(&id).ok_or(SessionError::Unknown(id))
    }

    /// Hand the session its cancel handle. A disposed session cancels it straight away.
    pub fn attach_cancel(&mut self, id: SessionId, cancel: CancelHandle) -> Result<(), SessionError> {
        let entry = self.entry_mut(id)?;
        if entry.info.state == SessionState::Disposed {
            cancel.cancel();
            return Err(SessionError::InvalidTransition { id, state: SessionState::Disposed, action: "attach" });
        }
        if let Some(prev) = entry.cancel.replace(cancel) {
            prev.cancel();
        }
        Ok(())
    }

    /// `Open -> Active`. Activating an active session is a no-op.
    pub fn activate(&mut self, id: SessionId) -> Result<(), SessionError> {
        let entry = self.entry_mut(id)?;
        match entry.info.state {
            SessionState::Open => {
                entry.info.state = SessionState::Active;
                info!(session = %id, target = %entry.info.target, "session active");
                Ok(())
            }
            SessionState::Active => Ok(()),
            SessionState::Disposed => Err(SessionError::InvalidTransition { id, state: SessionState::Disposed, action: "activate" }),
        }
    }

    /// Move to `Disposed` and cancel the attached operation. Idempotent.
    pub fn dispose(&mut self, id: SessionId) -> Result<(), SessionError> {
        let entry = self.entry_mut(id)?;
        if entry.info.state == SessionState::Disposed {
            return Ok(());
        }
        entry.info.state = SessionState::Disposed;
        if let Some(cancel) = entry.cancel.take() {
            cancel.cancel();
        }
        info!(session = %id, target = %entry.info.target, "session disposed");
        Ok(())
    }

    pub fn dispose_all(&mut self) {
        for id in self.order.clone() {
            let _ = self.dispose(id);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionInfo> {
        self.entries.get(&id).map(|e| &e.info)
    }

    /// Sessions not yet disposed, in open order.
    pub fn live(&self) -> Vec<&SessionInfo> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.info)
            .filter(|i| i.state != SessionState::Disposed)
            .collect()
    }
}

impl Drop for SessionTable {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
