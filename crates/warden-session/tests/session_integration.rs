//! Session lifecycle integration tests.
//!
//! These tests drive sessions end-to-end through `StatefulComponent`:
//! exclusivity, idle reaping, discard on error and remove methods.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use common::{Cart, add_item, cart_component, default_component, items, millis, out_of_stock};
use warden_session::{
    BeanError, CacheConfig, DefaultFactory, Error, EvictionAction, InvocationContext,
    MemoryPassivationStore, MethodDescriptor, SessionCache, StatefulComponent,
};

// ─────────────────────────────────────────────────────────────────────────────
// Exclusivity
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invocations_never_overlap() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let component = Arc::clone(&component);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            for n in 0..5 {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                component
                    .invoke(&id, "add_item", &InvocationContext::none(), move |cart| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        cart.items.push(format!("{worker}-{n}"));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
            }
            Ok::<_, Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(items(&component, &id, &InvocationContext::none()).await?.len(), 20);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_session_times_out_second_caller() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;

    let slow = {
        let component = Arc::clone(&component);
        tokio::spawn(async move {
            component
                .invoke(&id, "slow", &InvocationContext::none(), |cart| {
                    std::thread::sleep(Duration::from_millis(300));
                    cart.items.push("slow".to_string());
                    Ok(())
                })
                .await
        })
    };
    while !component.cache().sessions().iter().any(|s| s.locked) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let peek = MethodDescriptor::new("peek").with_access_timeout(millis(30));
    let err = component
        .invoke_method(&id, &peek, &InvocationContext::none(), |cart| {
            Ok(cart.items.len())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentAccessTimeout { .. }));
    assert!(err.is_retryable());

    // The holder is unaffected by the timed-out caller.
    slow.await??;
    assert_eq!(
        items(&component, &id, &InvocationContext::none()).await?,
        vec!["slow".to_string()]
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Idle reaping
// ─────────────────────────────────────────────────────────────────────────────

fn expiring_component(idle_ms: u64) -> Arc<StatefulComponent<Cart>> {
    cart_component(
        CacheConfig::new()
            .with_idle_timeout(Duration::from_millis(idle_ms))
            .with_sweep_interval(Duration::from_millis(10)),
    )
}

#[tokio::test]
async fn test_idle_session_is_reaped() -> Result<()> {
    let component = expiring_component(50);
    component.start();
    let id = component.create_session()?;
    add_item(&component, &id, &InvocationContext::none(), "pen").await?;

    tokio::time::sleep(Duration::from_millis(250)).await;

    let err = items(&component, &id, &InvocationContext::none())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    component.stop();
    Ok(())
}

#[tokio::test]
async fn test_touched_session_survives() -> Result<()> {
    let component = expiring_component(150);
    component.start();
    let id = component.create_session()?;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        add_item(&component, &id, &InvocationContext::none(), "pen").await?;
    }

    assert_eq!(
        items(&component, &id, &InvocationContext::none()).await?.len(),
        10
    );
    component.stop();
    Ok(())
}

#[tokio::test]
async fn test_passivated_session_is_restored() -> Result<()> {
    let cache = SessionCache::new(
        DefaultFactory::<Cart>::new(),
        CacheConfig::new()
            .with_idle_timeout(Duration::from_millis(30))
            .with_sweep_interval(Duration::from_millis(10))
            .with_eviction(EvictionAction::Passivate)
            .with_passivation_timeout(Duration::from_secs(60)),
    )
    .with_passivation(MemoryPassivationStore::new());
    let component = Arc::new(StatefulComponent::new("shop/cart", cache));
    component.start();

    let id = component.create_session()?;
    add_item(&component, &id, &InvocationContext::none(), "lamp").await?;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!component.cache().contains(&id));
    assert_eq!(component.cache().stats().passivated, 1);
    assert_eq!(
        items(&component, &id, &InvocationContext::none()).await?,
        vec!["lamp".to_string()]
    );
    component.stop();
    Ok(())
}

#[tokio::test]
async fn test_passivated_session_expires() -> Result<()> {
    let cache = SessionCache::new(
        DefaultFactory::<Cart>::new(),
        CacheConfig::new()
            .with_idle_timeout(Duration::from_millis(30))
            .with_sweep_interval(Duration::from_millis(10))
            .with_eviction(EvictionAction::Passivate),
    )
    .with_passivation(MemoryPassivationStore::new());
    let component = Arc::new(StatefulComponent::new("shop/cart", cache));
    component.start();

    let id = component.create_session()?;
    add_item(&component, &id, &InvocationContext::none(), "lamp").await?;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(component.cache().stats().passivated, 0);
    let err = items(&component, &id, &InvocationContext::none())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    component.stop();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Discard on error
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_system_error_discards_session() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();

    let err = component
        .invoke(&id, "add_item", &ctx, |_cart| {
            Err::<(), _>(BeanError::system("corrupted basket"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::System { session_id, .. } if session_id == id));

    assert!(items(&component, &id, &ctx).await.unwrap_err().is_not_found());
    assert!(
        component
            .remove_session(&id, &ctx)
            .await
            .unwrap_err()
            .is_not_found()
    );
    Ok(())
}

#[tokio::test]
async fn test_panic_discards_session_and_propagates() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;

    let task = {
        let component = Arc::clone(&component);
        tokio::spawn(async move {
            component
                .invoke(
                    &id,
                    "add_item",
                    &InvocationContext::none(),
                    |_cart| -> Result<(), BeanError> { panic!("index out of bounds") },
                )
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert!(
        items(&component, &id, &InvocationContext::none())
            .await
            .unwrap_err()
            .is_not_found()
    );
    Ok(())
}

#[tokio::test]
async fn test_application_error_keeps_session() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();
    add_item(&component, &id, &ctx, "pen").await?;

    let err = component
        .invoke(&id, "reserve", &ctx, |_cart| Err::<(), _>(out_of_stock()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Application(_)));
    assert_eq!(items(&component, &id, &ctx).await?, vec!["pen".to_string()]);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Remove methods
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_remove_method_ends_session() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();

    let total = component
        .invoke(&id, "checkout", &ctx, |cart| Ok(cart.items.len()))
        .await?;
    assert_eq!(total, 0);
    assert!(items(&component, &id, &ctx).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_retained_on_application_error() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();

    let err = component
        .invoke(&id, "checkout", &ctx, |_cart| Err::<(), _>(out_of_stock()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Application(_)));

    // Still alive: the next call succeeds.
    add_item(&component, &id, &ctx, "pen").await?;
    Ok(())
}

#[tokio::test]
async fn test_removed_on_application_error_without_retain() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();

    let err = component
        .invoke(&id, "abandon", &ctx, |_cart| Err::<(), _>(out_of_stock()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Application(_)));
    assert!(items(&component, &id, &ctx).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_system_error_on_retaining_method_removes() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();

    let err = component
        .invoke(&id, "checkout", &ctx, |_cart| {
            Err::<(), _>(BeanError::system("payment gateway crashed"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::System { .. }));
    assert!(items(&component, &id, &ctx).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_explicit_remove_reports_double_removal() -> Result<()> {
    let component = default_component();
    let id = component.create_session()?;
    let ctx = InvocationContext::none();

    component.remove_session(&id, &ctx).await?;
    assert!(component.cache().is_empty());
    assert!(
        component
            .remove_session(&id, &ctx)
            .await
            .unwrap_err()
            .is_not_found()
    );
    Ok(())
}
