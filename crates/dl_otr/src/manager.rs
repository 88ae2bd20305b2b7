//! Session manager: the host-facing front door.
//!
//! Owns the session-id → session map. Operations on different sessions
//! may run concurrently; one session's operations are serialised by its
//! own lock, matching the engine's single-threaded-per-session contract.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::OtrError;
use crate::host::{Host, SessionId};
use crate::session::Session;

pub struct SessionManager<H: Host> {
    host: H,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl<H: Host> SessionManager<H> {
    pub fn new(host: H) -> Self {
        Self { host, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Fetch or create the session for this conversation.
    pub fn session(&self, id: &SessionId) -> Arc<Mutex<Session>> {
        self.sessions
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(id.clone()))))
            .clone()
    }

    pub fn remove_session(&self, id: &SessionId) {
        self.sessions.lock().remove(id);
    }

    pub fn transform_receiving(
        &self,
        id: &SessionId,
        raw: &str,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.transform_receiving(&self.host, raw, now)
    }

    pub fn transform_sending(
        &self,
        id: &SessionId,
        text: &str,
        now: u64,
    ) -> Result<Vec<String>, OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.transform_sending(&self.host, text, now)
    }

    pub fn start_session(&self, id: &SessionId, now: u64) -> Result<(), OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.start_session(&self.host, now)
    }

    pub fn end_session(&self, id: &SessionId, now: u64) -> Result<(), OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.end_session(&self.host, now)
    }

    pub fn initiate_smp(
        &self,
        id: &SessionId,
        question: &str,
        secret: &str,
        now: u64,
    ) -> Result<(), OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.initiate_smp(&self.host, question, secret, now)
    }

    pub fn respond_smp(&self, id: &SessionId, secret: &str, now: u64) -> Result<(), OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.respond_smp(&self.host, secret, now)
    }

    pub fn abort_smp(&self, id: &SessionId, now: u64) -> Result<(), OtrError> {
        let session = self.session(id);
        let mut session = session.lock();
        session.abort_smp(&self.host, now)
    }

    /// Drive every session's timers from the host clock.
    pub fn tick(&self, now: u64) -> Result<(), OtrError> {
        let sessions: Vec<Arc<Mutex<Session>>> =
            self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.lock().tick(&self.host, now)?;
        }
        Ok(())
    }
}
