use crate::Error;
use crate::LockError;
use crate::ResourceError;
use crate::SessionError;

#[test]
fn test_node_predicates() {
    let no_node: Error = SessionError::NoSuchNode("/a".into()).into();
    assert!(no_node.is_no_node());
    assert!(!no_node.is_not_empty());
    assert!(!no_node.is_connection_loss());

    let not_empty: Error = SessionError::NotEmpty("/a".into()).into();
    assert!(not_empty.is_not_empty());

    let exists: Error = SessionError::NodeExists("/a".into()).into();
    assert!(exists.is_node_exists());
    assert!(!exists.is_no_node());
}

#[test]
fn test_cancellation_covers_sessions_and_locks() {
    assert!(Error::from(SessionError::Cancelled).is_cancelled());
    assert!(Error::from(LockError::Cancelled("/lock".into())).is_cancelled());
    assert!(!Error::from(LockError::NotHeld("/lock".into())).is_cancelled());
}

#[test]
fn test_connection_loss_classification() {
    let lost = [
        SessionError::NotConnected,
        SessionError::SessionExpired,
        SessionError::ConnectTimeout,
        SessionError::NotFullyConnected,
        SessionError::WatchLost("/a".into()),
        SessionError::ConnectionError {
            servers: "zk1:2181".into(),
            reason: "refused".into(),
            handle_obtained: true,
        },
    ];
    for e in lost {
        assert!(Error::from(e.clone()).is_connection_loss(), "{:?}", e);
    }

    assert!(!Error::from(SessionError::BadVersion("/a".into())).is_connection_loss());
    assert!(!Error::InvalidConfig("x".into()).is_connection_loss());
}

#[test]
fn test_transient_session_errors() {
    assert!(SessionError::ConnectTimeout.is_transient());
    assert!(SessionError::NotFullyConnected.is_transient());
    assert!(!SessionError::SessionExpired.is_transient());
    assert!(!SessionError::NoSuchNode("/a".into()).is_transient());
}

#[test]
fn test_error_messages() {
    let e = Error::from(ResourceError::Unprovided {
        path: "coordination.client.x".into(),
        available: vec!["coordination.client.a".into(), "coordination.client.b".into()],
    });
    assert_eq!(
        e.to_string(),
        "no resource provider for: \"coordination.client.x\" (provided: [coordination.client.a, coordination.client.b])"
    );

    let e = Error::Handler {
        handler: "announce".into(),
        message: "boom".into(),
    };
    assert_eq!(e.to_string(), "Unhandled error in lifecycle handler announce: boom");

    let e = Error::from(SessionError::ConnectionError {
        servers: "a:1,b:1".into(),
        reason: "refused".into(),
        handle_obtained: false,
    });
    assert_eq!(e.to_string(), "Cannot connect to [a:1,b:1]: refused");
}
