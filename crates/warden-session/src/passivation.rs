//! Passivation hooks for evicted sessions.
//!
//! When the cache is configured to passivate rather than destroy, idle
//! sessions are handed to a [`PassivationStore`] and restored on the next
//! lookup of their identifier. The store decides how images are kept; the
//! cache sweep asks it to drop images that outlived the passivation timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::id::SessionId;

/// Storage for passivated session state.
pub trait PassivationStore<B>: Send + Sync {
    /// Store an image of `bean` under `session_id`.
    fn passivate(&self, session_id: &SessionId, bean: &B) -> Result<()>;

    /// Restore and forget the image for `session_id`.
    ///
    /// Return `Ok(None)` if nothing is stored under that identifier.
    fn activate(&self, session_id: &SessionId) -> Result<Option<B>>;

    /// Forget the image for `session_id` without restoring it.
    fn remove(&self, session_id: &SessionId) -> Result<bool>;

    /// Forget every image stored longer than `max_age` ago, returning their ids.
    fn expire(&self, _max_age: Duration) -> Result<Vec<SessionId>> {
        Ok(Vec::new())
    }

    /// Forget every image. Returns how many were dropped.
    fn clear(&self) -> Result<usize> {
        Ok(0)
    }

    /// Number of stored images.
    fn len(&self) -> usize {
        0
    }

    /// Whether the store holds no images.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A store that never holds anything; passivation falls back to destruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPassivation;

impl<B> PassivationStore<B> for NoPassivation {
    fn passivate(&self, session_id: &SessionId, _bean: &B) -> Result<()> {
        Err(Error::Passivation {
            session_id: *session_id,
            message: "no passivation store configured".to_string(),
        })
    }

    fn activate(&self, _session_id: &SessionId) -> Result<Option<B>> {
        Ok(None)
    }

    fn remove(&self, _session_id: &SessionId) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug)]
struct Image {
    stored_at: Instant,
    bytes: Vec<u8>,
}

/// Keeps JSON images of passivated beans in memory.
#[derive(Debug, Default)]
pub struct MemoryPassivationStore {
    images: Mutex<HashMap<SessionId, Image>>,
}

impl MemoryPassivationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an image is stored for `session_id`.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.images.lock().contains_key(session_id)
    }
}

impl<B> PassivationStore<B> for MemoryPassivationStore
where
    B: Serialize + DeserializeOwned,
{
    fn passivate(&self, session_id: &SessionId, bean: &B) -> Result<()> {
        let image = serde_json::to_vec(bean).map_err(|e| Error::Passivation {
            session_id: *session_id,
            message: e.to_string(),
        })?;
        let image = Image {
            stored_at: Instant::now(),
            bytes: image,
        };
        self.images.lock().insert(*session_id, image);
        Ok(())
    }

    fn activate(&self, session_id: &SessionId) -> Result<Option<B>> {
        let Some(image) = self.images.lock().remove(session_id) else {
            return Ok(None);
        };
        serde_json::from_slice(&image.bytes)
            .map(Some)
            .map_err(|e| Error::Passivation {
                session_id: *session_id,
                message: e.to_string(),
            })
    }

    fn remove(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.images.lock().remove(session_id).is_some())
    }

    fn expire(&self, max_age: Duration) -> Result<Vec<SessionId>> {
        let mut images = self.images.lock();
        let now = Instant::now();
        let expired: Vec<SessionId> = images
            .iter()
            .filter(|(_, image)| now.duration_since(image.stored_at) > max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            images.remove(id);
        }
        Ok(expired)
    }

    fn clear(&self) -> Result<usize> {
        let mut images = self.images.lock();
        let count = images.len();
        images.clear();
        Ok(count)
    }

    fn len(&self) -> usize {
        self.images.lock().len()
    }
}
