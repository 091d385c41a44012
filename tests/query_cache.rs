// Integration tests for query stores and the shared cache

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{client, client_with_platform, flush};
use futures::future::join_all;
use querykit::prelude::*;
use querykit::transport::mock::MockTransport;
use serde_json::json;

fn todo_store(client: &QueryClient, id: &Atom<Option<KeyValue>>) -> QueryStore {
    client.use_query(
        KeyInput::parts([KeyPart::from("todo/"), KeyPart::from(id)]),
        "/todos/:id",
        QueryOptions::new()
            .request_for_key(|key| FetchRequest::new().param("id", key.parts[1].to_string())),
    )
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_dedupe_window() {
    let mock = MockTransport::new();
    mock.respond_sequence(
        "/read",
        [Ok(json!("ok")), Err(FetchError::http(500, "forced"))],
    );
    let client = client(
        &mock,
        QuerySettings::new()
            .dedupe_time(Duration::from_millis(30))
            .cache_lifetime(Duration::from_millis(30)),
    );
    let store = client.use_query(
        KeyInput::parts([KeyPart::from("k")]),
        "/read",
        QueryOptions::new().request(FetchRequest::new().query("id", "2")),
    );

    let first = store.fetch().await;
    assert_eq!(first.data, Some(json!("ok")));
    assert_eq!(mock.call_count(), 1);
    assert_eq!(mock.calls()[0].query.get("id").map(String::as_str), Some("2"));

    let again = join_all([store.fetch(), store.fetch(), store.fetch()]).await;
    for response in again {
        assert_eq!(response.data, Some(json!("ok")));
    }
    assert_eq!(mock.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(31)).await;
    let failed = store.fetch().await;
    assert_eq!(mock.call_count(), 2);
    assert_eq!(failed.error.as_ref().and_then(FetchError::status), Some(500));

    let entry = client.cache_entry("k").unwrap();
    assert!(entry.error.is_some());
    assert!(entry.data.is_none());
    assert_eq!(entry.retry_attempt, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_reactive_key() {
    let mock = MockTransport::new();
    mock.respond_json("/todos/7", json!({ "id": 7, "title": "ship it" }));
    let client = client(&mock, QuerySettings::new());
    let id: Atom<Option<KeyValue>> = Atom::new(None);
    let store = todo_store(&client, &id);

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(store.get(), QueryValue::idle());
    assert!(!store.get().is_pending);
    assert!(store.key().is_none());
    assert_eq!(mock.call_count(), 0);

    id.set(Some(7.into()));
    flush().await;
    assert_eq!(mock.call_count(), 1);
    assert_eq!(mock.calls()[0].path, "/todos/7");
    assert_eq!(mock.calls()[0].url, "http://api.test/todos/7");
    assert_eq!(store.key().as_deref(), Some("todo/7"));
    assert_eq!(store.get().data, Some(json!({ "id": 7, "title": "ship it" })));

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_request() {
    let mock = MockTransport::new().with_latency(Duration::from_millis(50));
    mock.respond_json("/todos", json!([1, 2, 3]));
    let client = client(&mock, QuerySettings::new());
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    let responses = join_all((0..5).map(|_| store.fetch())).await;

    assert_eq!(mock.call_count(), 1);
    for response in responses {
        assert_eq!(response.data, Some(json!([1, 2, 3])));
    }
}

#[tokio::test(start_paused = true)]
async fn test_stores_on_one_key_share_one_request() {
    let mock = MockTransport::new().with_latency(Duration::from_millis(50));
    mock.respond_json("/todos", json!([1]));
    let client = client(&mock, QuerySettings::new());
    let a = client.use_query("todos", "/todos", QueryOptions::new());
    let b = client.use_query(
        KeyInput::parts([KeyPart::from("to"), KeyPart::from("dos")]),
        "/todos",
        QueryOptions::new(),
    );

    let (a_value, b_value) = tokio::join!(a.fetch(), b.fetch());

    assert_eq!(mock.call_count(), 1);
    assert_eq!(a_value.data, b_value.data);
    assert!(!client.is_fetching("todos"));
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_is_reused() {
    let mock = MockTransport::new();
    mock.respond_json("/todos", json!(["a"]));
    let client = client(&mock, QuerySettings::new().dedupe_time(Duration::from_secs(1)));
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    store.fetch().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let cached = store.fetch().await;
    assert_eq!(cached.data, Some(json!(["a"])));
    assert_eq!(mock.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    store.fetch().await;
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unset_key_resets_to_idle() {
    let mock = MockTransport::new();
    mock.respond_json("/todos/1", json!({ "id": 1 }));
    let client = client(&mock, QuerySettings::new());
    let id: Atom<Option<KeyValue>> = Atom::new(Some(1.into()));
    let store = todo_store(&client, &id);

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert!(store.get().data.is_some());

    id.set(None);
    assert_eq!(store.get(), QueryValue::idle());
    assert!(store.key().is_none());

    let false_key = client.use_query(
        KeyInput::parts([KeyPart::from("todo/"), KeyPart::from(KeyValue::Bool(false))]),
        "/todos/1",
        QueryOptions::new(),
    );
    assert!(false_key.fetch().await.is_empty());
    assert_eq!(mock.call_count(), 1);

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_dependent_query_waits_for_its_source() {
    let mock = MockTransport::new();
    mock.respond_json("/user", json!({ "id": 7 }));
    mock.respond_json("/posts", json!(["hello"]));
    let client = client(&mock, QuerySettings::new());
    let user = client.use_query("user", "/user", QueryOptions::new());
    let posts = client.use_query(
        KeyInput::parts([KeyPart::from(&user), KeyPart::from("/posts")]),
        "/posts",
        QueryOptions::new(),
    );

    let unsubscribe = posts.listen(|_| {});
    flush().await;

    assert_eq!(mock.calls_to("/user"), 1);
    assert_eq!(mock.calls_to("/posts"), 1);
    assert_eq!(posts.key().as_deref(), Some("user/posts"));
    assert_eq!(posts.get().data, Some(json!(["hello"])));

    unsubscribe.unsubscribe();
    assert_eq!(user.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mutate_cache_round_trip() {
    let mock = MockTransport::new();
    let client = client(&mock, QuerySettings::new());
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    client.mutate_cache("todos", Some(json!(["local"])));
    let response = store.fetch().await;

    assert_eq!(response.data, Some(json!(["local"])));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mutate_cache_delete_is_idempotent() {
    let mock = MockTransport::new();
    let client = client(&mock, QuerySettings::new());

    client.mutate_cache("todos", Some(json!(1)));
    client.mutate_cache("todos", None);
    let once = client.cache_entry("todos");
    client.mutate_cache("todos", None);

    assert!(once.is_none());
    assert_eq!(client.cache_entry("todos"), once);
}

#[tokio::test(start_paused = true)]
async fn test_cache_writes_reach_active_stores() {
    let mock = MockTransport::new();
    mock.respond_json("/todos", json!(["server"]));
    let client = client(&mock, QuerySettings::new());
    let store = client.use_query("todos", "/todos", QueryOptions::new());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);

    let unsubscribe = store.listen(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    flush().await;
    let before = seen.load(Ordering::SeqCst);

    client.mutate_cache(KeySelector::predicate(|key| key.starts_with("todo")), Some(json!(["local"])));
    assert_eq!(store.get().data, Some(json!(["local"])));
    assert!(seen.load(Ordering::SeqCst) > before);

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_failed_refetch_keeps_data() {
    let mock = MockTransport::new();
    mock.respond_sequence(
        "/todos",
        [Ok(json!(["a"])), Err(FetchError::Network("offline".into()))],
    );
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let client = client(&mock, QuerySettings::new().on_error_retry(ErrorRetry::Disabled));
    let store = client.use_query(
        "todos",
        "/todos",
        QueryOptions::new().on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(store.get().data, Some(json!(["a"])));

    store.revalidate();
    assert!(store.get().is_pending);
    assert!(store.get().is_refetching);
    assert_eq!(store.get().data, Some(json!(["a"])));
    flush().await;

    let value = store.get();
    assert_eq!(mock.call_count(), 2);
    assert_eq!(value.data, Some(json!(["a"])));
    assert_eq!(value.error, Some(FetchError::Network("offline".into())));
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_failed_refetch_keeps_each_stores_data_after_key_switch() {
    let mock = MockTransport::new().with_latency(Duration::from_millis(20));
    mock.respond_sequence(
        "/todos/1",
        [Ok(json!("one")), Err(FetchError::Network("down".into()))],
    );
    mock.respond_json("/todos/2", json!("two"));
    let client = client(&mock, QuerySettings::new().on_error_retry(ErrorRetry::Disabled));
    let id: Atom<Option<KeyValue>> = Atom::new(Some(1.into()));
    let selected = todo_store(&client, &id);
    let pinned = client.use_query("todo/1", "/todos/1", QueryOptions::new());

    let unsubscribe_selected = selected.listen(|_| {});
    tokio::time::sleep(Duration::from_millis(30)).await;
    let unsubscribe_pinned = pinned.listen(|_| {});
    flush().await;
    assert_eq!(selected.get().data, Some(json!("one")));
    assert_eq!(pinned.get().data, Some(json!("one")));
    assert_eq!(mock.calls_to("/todos/1"), 1);

    // Both stores refetch todo/1 through one request; the selection moves on meanwhile.
    client.revalidate_keys("todo/1");
    assert!(pinned.get().is_pending);
    id.set(Some(2.into()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    flush().await;
    assert_eq!(mock.calls_to("/todos/1"), 2);

    let pinned_value = pinned.get();
    assert_eq!(pinned.key().as_deref(), Some("todo/1"));
    assert_eq!(pinned_value.data, Some(json!("one")));
    assert_eq!(pinned_value.error, Some(FetchError::Network("down".into())));
    assert!(!pinned_value.is_pending);

    let selected_value = selected.get();
    assert_eq!(selected.key().as_deref(), Some("todo/2"));
    assert_eq!(selected_value.data, Some(json!("two")));
    assert!(selected_value.error.is_none());

    unsubscribe_selected.unsubscribe();
    unsubscribe_pinned.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_drops_entry_and_refetches() {
    let mock = MockTransport::new();
    mock.respond_sequence("/todos", [Ok(json!(1)), Ok(json!(2))]);
    let client = client(&mock, QuerySettings::new());
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(store.get().data, Some(json!(1)));

    store.invalidate();
    let pending = store.get();
    assert!(pending.is_pending);
    assert!(pending.data.is_none());
    flush().await;

    assert_eq!(store.get().data, Some(json!(2)));
    assert_eq!(mock.call_count(), 2);

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_error_retry_refetches_with_backoff() {
    let mock = MockTransport::new();
    mock.respond_sequence(
        "/todos",
        [
            Err(FetchError::http(503, "unavailable")),
            Err(FetchError::http(503, "unavailable")),
            Ok(json!(["back"])),
        ],
    );
    let client = client(
        &mock,
        QuerySettings::new()
            .error_retry_interval(Duration::from_millis(100))
            .on_error_retry(ErrorRetry::custom(|ctx| {
                Some(ctx.error_retry_interval * ctx.retry_attempt)
            })),
    );
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(mock.call_count(), 1);
    assert_eq!(client.cache_entry("todos").unwrap().retry_attempt, Some(1));

    tokio::time::sleep(Duration::from_millis(110)).await;
    flush().await;
    assert_eq!(mock.call_count(), 2);
    assert_eq!(client.cache_entry("todos").unwrap().retry_attempt, Some(2));

    // Second failure waits twice as long.
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert_eq!(mock.call_count(), 2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    flush().await;
    assert_eq!(mock.call_count(), 3);

    let entry = client.cache_entry("todos").unwrap();
    assert_eq!(entry.data, Some(json!(["back"])));
    assert!(entry.retry_attempt.is_none());
    assert_eq!(store.get().data, Some(json!(["back"])));
    assert!(store.get().error.is_none());

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_error_retry_stops_on_unsubscribe() {
    let mock = MockTransport::new();
    mock.respond_error("/k", FetchError::Network("down".into()));
    let client = client(
        &mock,
        QuerySettings::new()
            .on_error_retry(ErrorRetry::custom(|_| Some(Duration::from_millis(50)))),
    );
    let store = client.use_query("k", "/k", QueryOptions::new());

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(client.cache_entry("k").unwrap().retry_attempt, Some(1));
    unsubscribe.unsubscribe();

    tokio::time::sleep(Duration::from_millis(100)).await;
    flush().await;
    let entry = client.cache_entry("k").unwrap();
    assert_eq!(entry.error, Some(FetchError::Network("down".into())));
    assert_eq!(entry.retry_attempt, Some(1));
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_retry_stops_on_key_change() {
    let mock = MockTransport::new();
    mock.respond_error("/todos/1", FetchError::http(500, "broken"));
    mock.respond_json("/todos/2", json!("two"));
    let client = client(
        &mock,
        QuerySettings::new()
            .on_error_retry(ErrorRetry::custom(|_| Some(Duration::from_millis(50)))),
    );
    let id: Atom<Option<KeyValue>> = Atom::new(Some(1.into()));
    let store = todo_store(&client, &id);

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert!(client.cache_entry("todo/1").unwrap().error.is_some());

    id.set(Some(2.into()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    flush().await;

    let entry = client.cache_entry("todo/1").unwrap();
    assert_eq!(entry.error.as_ref().and_then(FetchError::status), Some(500));
    assert_eq!(mock.calls_to("/todos/1"), 1);
    assert_eq!(store.get().data, Some(json!("two")));

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_revalidate_interval_while_active() {
    let mock = MockTransport::new();
    mock.respond_json("/todos", json!([]));
    let client = client(
        &mock,
        QuerySettings::new()
            .dedupe_time(Duration::from_millis(10))
            .revalidate_interval(Duration::from_millis(100)),
    );
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(mock.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    flush().await;
    assert_eq!(mock.call_count(), 3);

    unsubscribe.unsubscribe();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_focus_and_reconnect_revalidate() {
    let mock = MockTransport::new();
    mock.respond_json("/todos", json!([]));
    let platform = ManualPlatform::new();
    let client = client_with_platform(
        &mock,
        QuerySettings::new()
            .dedupe_time(Duration::ZERO)
            .revalidate_on_focus(true)
            .revalidate_on_reconnect(true),
        &platform,
    );
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    let unsubscribe = store.listen(|_| {});
    flush().await;
    assert_eq!(mock.call_count(), 1);

    platform.set_visible(false);
    store.revalidate();
    flush().await;
    assert_eq!(mock.call_count(), 1, "hidden app does not fetch");

    platform.set_visible(true);
    flush().await;
    assert_eq!(mock.call_count(), 2);

    platform.reconnect();
    flush().await;
    assert_eq!(mock.call_count(), 3);

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_focus_is_ignored_unless_enabled() {
    let mock = MockTransport::new();
    mock.respond_json("/todos", json!([]));
    let platform = ManualPlatform::new();
    let client = client_with_platform(
        &mock,
        QuerySettings::new().dedupe_time(Duration::ZERO),
        &platform,
    );
    let store = client.use_query("todos", "/todos", QueryOptions::new());

    let unsubscribe = store.listen(|_| {});
    flush().await;
    platform.set_visible(false);
    platform.set_visible(true);
    platform.reconnect();
    flush().await;
    assert_eq!(mock.call_count(), 1);

    unsubscribe.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_typed_data() {
    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Todo {
        id: u32,
        done: bool,
    }

    let mock = MockTransport::new();
    mock.respond_json("/todos/3", json!({ "id": 3, "done": true }));
    let client = client(&mock, QuerySettings::new());
    let id: Atom<Option<KeyValue>> = Atom::new(Some(3.into()));
    let store = todo_store(&client, &id);

    let unsubscribe = store.listen(|_| {});
    flush().await;

    let todo: Option<Todo> = store.get().data_as().unwrap();
    assert_eq!(todo, Some(Todo { id: 3, done: true }));

    unsubscribe.unsubscribe();
}
