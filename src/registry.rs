//! Fixed capacity session registry
//!
//! Applications running several correction sessions keep their clients in
//! a [Registry] and address them by [SessionId]. Freed slots are reused.

use std::fmt;

use tracing::debug;

use crate::ClientError;

/// Registry slot handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SessionId(usize);

impl SessionId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Owner of up to `capacity` sessions
#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Option<T>>,
}

impl<T> Registry<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Stores `value` in the first free slot
    pub fn insert(&mut self, value: T) -> Result<SessionId, ClientError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ClientError::RegistryFull(self.slots.len()))?;

        self.slots[index] = Some(value);
        debug!("Registered session#{}", index);
        Ok(SessionId(index))
    }

    pub fn get(&self, id: SessionId) -> Option<&T> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut T> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Takes the session out, freeing its slot
    pub fn remove(&mut self, id: SessionId) -> Option<T> {
        let value = self.slots.get_mut(id.0).and_then(Option::take);
        if value.is_some() {
            debug!("Released {}", id);
        }
        value
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (SessionId(i), v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SessionId, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (SessionId(i), v)))
    }
}
