//! Session handles that cross serialization boundaries.
//!
//! A [`SessionHandle`] carries only the component locator and the session
//! identifier, never bean state. Decoding a handle resolves the locator
//! through an injected [`ComponentResolver`] and yields a fresh
//! [`SessionProxy`]; the session itself is looked up on the proxy's first
//! invocation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::StatefulComponent;
use crate::error::{BeanError, Error, Result};
use crate::id::SessionId;
use crate::lifecycle::StatefulBean;
use crate::synchronization::InvocationContext;

/// Current handle encoding version.
pub const HANDLE_VERSION: u32 = 1;

/// Wire-safe reference to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub locator: String,
    pub session_id: SessionId,
}

/// Client-side reference to one session of a component.
pub struct SessionProxy<B: StatefulBean> {
    component: Arc<StatefulComponent<B>>,
    session_id: SessionId,
}

impl<B: StatefulBean> SessionProxy<B> {
    pub(crate) fn new(component: Arc<StatefulComponent<B>>, session_id: SessionId) -> Self {
        Self {
            component,
            session_id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn component(&self) -> &Arc<StatefulComponent<B>> {
        &self.component
    }

    /// The serializable form of this proxy.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            locator: self.component.locator().to_string(),
            session_id: self.session_id,
        }
    }

    /// Invoke a business method on the session.
    pub async fn invoke<R, F>(&self, method: &str, ctx: &InvocationContext, f: F) -> Result<R>
    where
        F: FnOnce(&mut B) -> std::result::Result<R, BeanError>,
    {
        self.component.invoke(&self.session_id, method, ctx, f).await
    }

    /// Remove the session.
    pub async fn remove(&self, ctx: &InvocationContext) -> Result<()> {
        self.component.remove_session(&self.session_id, ctx).await
    }
}

impl<B: StatefulBean> Clone for SessionProxy<B> {
    fn clone(&self) -> Self {
        Self {
            component: Arc::clone(&self.component),
            session_id: self.session_id,
        }
    }
}

impl<B: StatefulBean> std::fmt::Debug for SessionProxy<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProxy")
            .field("locator", &self.component.locator())
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Resolves handle locators to live components.
pub trait ComponentResolver<B: StatefulBean>: Send + Sync {
    fn resolve(&self, locator: &str) -> Option<Arc<StatefulComponent<B>>>;
}

/// In-memory [`ComponentResolver`] keyed by component locator.
pub struct ComponentRegistry<B: StatefulBean> {
    components: RwLock<HashMap<String, Arc<StatefulComponent<B>>>>,
}

impl<B: StatefulBean> ComponentRegistry<B> {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
        }
    }

    /// Register a component under its locator, replacing any previous one.
    pub fn register(
        &self,
        component: Arc<StatefulComponent<B>>,
    ) -> Option<Arc<StatefulComponent<B>>> {
        let locator = component.locator().to_string();
        debug!(%locator, "Component registered");
        self.components.write().insert(locator, component)
    }

    pub fn unregister(&self, locator: &str) -> Option<Arc<StatefulComponent<B>>> {
        self.components.write().remove(locator)
    }

    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }
}

impl<B: StatefulBean> Default for ComponentRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: StatefulBean> ComponentResolver<B> for ComponentRegistry<B> {
    fn resolve(&self, locator: &str) -> Option<Arc<StatefulComponent<B>>> {
        self.components.read().get(locator).cloned()
    }
}

/// Settings for the handle encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshallingConfig {
    /// Version written into encoded handles.
    pub version: u32,
    /// Versions accepted when decoding.
    pub accepted_versions: Vec<u32>,
}

impl Default for MarshallingConfig {
    fn default() -> Self {
        Self {
            version: HANDLE_VERSION,
            accepted_versions: vec![HANDLE_VERSION],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    #[serde(flatten)]
    handle: SessionHandle,
}

/// Converts proxies to and from their encoded handle form.
pub struct HandleCodec<B: StatefulBean> {
    resolver: Arc<dyn ComponentResolver<B>>,
    config: MarshallingConfig,
}

impl<B: StatefulBean> HandleCodec<B> {
    pub fn new(resolver: Arc<dyn ComponentResolver<B>>, config: MarshallingConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &MarshallingConfig {
        &self.config
    }

    /// Encode a proxy as a JSON handle record.
    pub fn encode(&self, proxy: &SessionProxy<B>) -> Result<Vec<u8>> {
        self.encode_handle(&proxy.handle())
    }

    pub fn encode_handle(&self, handle: &SessionHandle) -> Result<Vec<u8>> {
        let envelope = Envelope {
            version: self.config.version,
            handle: handle.clone(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode a handle record without resolving it.
    pub fn decode_handle(&self, bytes: &[u8]) -> Result<SessionHandle> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if !self.config.accepted_versions.contains(&envelope.version) {
            return Err(Error::Codec(format!(
                "unsupported handle version {}",
                envelope.version
            )));
        }
        Ok(envelope.handle)
    }

    /// Decode a handle record into a proxy.
    ///
    /// Fails with [`Error::ServiceNotFound`] if the locator does not resolve.
    /// The session itself is not checked until the proxy is used.
    pub fn decode(&self, bytes: &[u8]) -> Result<SessionProxy<B>> {
        let handle = self.decode_handle(bytes)?;
        self.resolve(&handle)
    }

    /// Materialize a proxy for `handle`.
    pub fn resolve(&self, handle: &SessionHandle) -> Result<SessionProxy<B>> {
        let component = self
            .resolver
            .resolve(&handle.locator)
            .ok_or_else(|| Error::ServiceNotFound(handle.locator.clone()))?;
        Ok(component.proxy(handle.session_id))
    }
}
