//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_session::{
    AccessTimeout, BeanError, BoxError, CacheConfig, DefaultFactory, InvocationContext,
    MethodDescriptor, SessionCache, SessionId, StatefulBean, StatefulComponent,
};

pub const LOCATOR: &str = "shop/cart";

/// Shopping cart bean used across the integration tests.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<String>,
    /// Outcomes seen by `after_completion`, in order.
    pub completions: Vec<bool>,
    pub fail_before_completion: bool,
    pub fail_after_completion: bool,
}

impl StatefulBean for Cart {
    fn before_completion(&mut self) -> Result<(), BoxError> {
        if self.fail_before_completion {
            return Err("inventory check failed".into());
        }
        Ok(())
    }

    fn after_completion(&mut self, committed: bool) -> Result<(), BoxError> {
        self.completions.push(committed);
        if self.fail_after_completion {
            return Err("audit log unavailable".into());
        }
        Ok(())
    }
}

/// Cart component with `checkout` (retains on application errors) and
/// `abandon` (always removes) as session-terminating methods.
pub fn cart_component(config: CacheConfig) -> Arc<StatefulComponent<Cart>> {
    let cache = SessionCache::new(DefaultFactory::<Cart>::new(), config);
    Arc::new(
        StatefulComponent::new(LOCATOR, cache)
            .with_method(MethodDescriptor::new("checkout").removing(true))
            .with_method(MethodDescriptor::new("abandon").removing(false)),
    )
}

pub fn default_component() -> Arc<StatefulComponent<Cart>> {
    cart_component(CacheConfig::new().with_access_timeout(millis(2_000)))
}

pub fn millis(ms: u64) -> AccessTimeout {
    AccessTimeout::Bounded(Duration::from_millis(ms))
}

pub async fn add_item(
    component: &StatefulComponent<Cart>,
    id: &SessionId,
    ctx: &InvocationContext,
    item: &str,
) -> warden_session::Result<usize> {
    let item = item.to_string();
    component
        .invoke(id, "add_item", ctx, move |cart| {
            cart.items.push(item);
            Ok(cart.items.len())
        })
        .await
}

pub async fn items(
    component: &StatefulComponent<Cart>,
    id: &SessionId,
    ctx: &InvocationContext,
) -> warden_session::Result<Vec<String>> {
    component
        .invoke(id, "items", ctx, |cart| Ok(cart.items.clone()))
        .await
}

pub fn out_of_stock() -> BeanError {
    BeanError::application("out of stock")
}
