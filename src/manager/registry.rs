//! Session and service registries.
//!
//! Registries exclusively own their entities; everything else holds ids and
//! resolves at point of use. Both registries live on the state context, so
//! every entry has a single logical owner.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::{ServiceId, ServiceName, SessionId};

use super::service::ServiceContext;
use super::session::Session;

/// Live sessions indexed by id, with a secondary index by owning service.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_service: HashMap<ServiceId, BTreeSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, replacing any prior registration under the same
    /// id.
    pub fn add(&mut self, session: Session) -> &mut Session {
        let session_id = session.session_id();
        let service_id = session.service_id();
        if let Some(prior) = self.sessions.insert(session_id, session) {
            if let Some(ids) = self.by_service.get_mut(&prior.service_id()) {
                ids.remove(&session_id);
            }
        }
        self.by_service
            .entry(service_id)
            .or_default()
            .insert(session_id);
        self.sessions
            .get_mut(&session_id)
            .expect("session was just inserted")
    }

    pub fn remove(&mut self, session_id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&session_id)?;
        if let Some(ids) = self.by_service.get_mut(&session.service_id()) {
            ids.remove(&session_id);
            if ids.is_empty() {
                self.by_service.remove(&session.service_id());
            }
        }
        Some(session)
    }

    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session ids owned by the given service, in id order.
    pub fn service_session_ids(&self, service_id: ServiceId) -> Vec<SessionId> {
        self.by_service
            .get(&service_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every session owned by the given service.
    pub fn remove_service_sessions(&mut self, service_id: ServiceId) -> Vec<Session> {
        let Some(ids) = self.by_service.remove(&service_id) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect()
    }
}

/// Live services indexed by id and by name.
///
/// Ids are assigned from log indexes, so ascending id order is registration
/// order; snapshot iteration relies on that.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceId, ServiceContext>,
    by_name: HashMap<ServiceName, ServiceId>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. If the name was already bound to another
    /// service, the binding moves to the new one and the displaced id is
    /// returned so the caller can purge its sessions.
    pub fn register(&mut self, service: ServiceContext) -> Option<ServiceId> {
        let service_id = service.service_id();
        let name = service.name().clone();
        self.services.insert(service_id, service);
        match self.by_name.insert(name, service_id) {
            Some(prior) if prior != service_id => {
                self.services.remove(&prior);
                Some(prior)
            }
            _ => None,
        }
    }

    pub fn unregister(&mut self, service_id: ServiceId) -> Option<ServiceContext> {
        let service = self.services.remove(&service_id)?;
        if self.by_name.get(service.name()) == Some(&service_id) {
            self.by_name.remove(service.name());
        }
        Some(service)
    }

    pub fn get(&self, service_id: ServiceId) -> Option<&ServiceContext> {
        self.services.get(&service_id)
    }

    pub fn get_mut(&mut self, service_id: ServiceId) -> Option<&mut ServiceContext> {
        self.services.get_mut(&service_id)
    }

    pub fn contains(&self, service_id: ServiceId) -> bool {
        self.services.contains_key(&service_id)
    }

    pub fn lookup_name(&self, name: &ServiceName) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    /// Services in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceContext> {
        self.services.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceContext> {
        self.services.values_mut()
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
