use super::*;
use std::sync::Mutex;

fn event() -> JobFailedEvent {
    JobFailedEvent {
        connection: "memory".to_string(),
        queue: "default".to_string(),
        payload: "{}".to_string(),
    }
}

#[test]
fn test_dispatch_reaches_listeners_in_order() {
    let dispatcher = EventDispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&seen);
    dispatcher.listen(move |e| first.lock().unwrap().push(format!("first:{}", e.queue)));
    let second = Arc::clone(&seen);
    dispatcher.listen(move |e| second.lock().unwrap().push(format!("second:{}", e.connection)));

    dispatcher.dispatch(&event());

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first:default".to_string(), "second:memory".to_string()]
    );
    assert_eq!(dispatcher.listener_count(), 2);
}

#[test]
fn test_clones_share_listeners() {
    let dispatcher = EventDispatcher::new();
    let clone = dispatcher.clone();
    let count = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&count);
    clone.listen(move |_| *counter.lock().unwrap() += 1);
    dispatcher.dispatch(&event());

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn test_dispatch_without_listeners_is_noop() {
    EventDispatcher::new().dispatch(&event());
}
