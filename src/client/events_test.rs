use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::adaptors::mem::MemEnsemble;
use crate::handler_fn;
use crate::test_utils::test_client;
use crate::test_utils::test_config;
use crate::test_utils::TEST_SERVER;
use crate::Error;
use crate::EventContext;
use crate::HandlerRegistry;
use crate::LifecycleEvent;
use crate::LifecycleHandler;
use crate::ResourceError;

#[test]
fn test_lifecycle_event_names_round_trip() {
    for event in LifecycleEvent::ALL {
        assert_eq!(LifecycleEvent::from_str(event.as_str()).unwrap(), event);
        assert_eq!(event.to_string(), event.as_str());
    }
}

#[test]
fn test_unknown_lifecycle_event() {
    assert!(matches!(
        LifecycleEvent::from_str("disconnected"),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_registry_rejects_duplicates() {
    let registry = HandlerRegistry::new();
    registry
        .register("announce", handler_fn(|_ctx| async { Ok(()) }))
        .unwrap();

    let result = registry.register("announce", handler_fn(|_ctx| async { Ok(()) }));
    assert!(matches!(
        result,
        Err(Error::Resource(ResourceError::AlreadyProvided(name))) if name == "announce"
    ));
}

#[test]
fn test_registry_names_sorted() {
    let registry = HandlerRegistry::new();
    registry.register("zeta", handler_fn(|_ctx| async { Ok(()) })).unwrap();
    registry.register("alpha", handler_fn(|_ctx| async { Ok(()) })).unwrap();

    assert_eq!(registry.names(), vec!["alpha".to_string(), "zeta".to_string()]);
    assert!(registry.get("alpha").is_some());
    assert!(registry.get("beta").is_none());
}

#[tokio::test]
async fn test_handler_fn_receives_context() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let client = test_client(&ensemble, test_config(&[TEST_SERVER]));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn LifecycleHandler> = handler_fn(move |ctx: EventContext| {
        let tx = tx.clone();
        async move {
            tx.send((ctx.event, ctx.client.name().to_string())).unwrap();
            Ok(())
        }
    });

    handler
        .handle(EventContext {
            event: LifecycleEvent::Reconnected,
            client,
        })
        .await
        .unwrap();

    assert_eq!(
        rx.recv().await,
        Some((LifecycleEvent::Reconnected, "test".to_string()))
    );
}
