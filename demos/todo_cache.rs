//! Todo list demonstrating queries, mutations and cache updates.
//!
//! This example shows:
//! - A query store that fetches once and serves later reads from the cache
//! - A reactive key: the detail query waits until a todo is selected
//! - A mutation that updates the list optimistically, then revalidates it
//! - Error state with the previous data kept
//!
//! A scripted in-memory transport stands in for the backend, so no network is needed.
//!
//! Run with: `cargo run --example todo_cache`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use querykit::prelude::*;
use querykit::transport::mock::MockTransport;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
struct Todo {
    id: i64,
    title: String,
    done: bool,
}

/// In-memory backend answering like a small REST API.
fn backend() -> MockTransport {
    let todos = Arc::new(Mutex::new(vec![
        json!({ "id": 1, "title": "Read the docs", "done": true }),
        json!({ "id": 2, "title": "Write a demo", "done": false }),
    ]));
    let mock = MockTransport::new().with_latency(Duration::from_millis(150));

    let list = Arc::clone(&todos);
    mock.respond("/todos", move |_| {
        Ok(Value::Array(list.lock().map_err(|_| FetchError::Failed("poisoned".into()))?.clone()))
    });

    let store = Arc::clone(&todos);
    mock.respond("/todos/new", move |request| {
        let mut todos = store.lock().map_err(|_| FetchError::Failed("poisoned".into()))?;
        let title = request
            .body
            .as_ref()
            .and_then(|body| body.get("title"))
            .cloned()
            .unwrap_or_else(|| json!("untitled"));
        let todo = json!({ "id": todos.len() + 1, "title": title, "done": false });
        todos.push(todo.clone());
        Ok(todo)
    });

    mock.respond("/todos/1", |_| Ok(json!({ "id": 1, "title": "Read the docs", "done": true })));
    mock.respond_error("/todos/2", FetchError::http(503, "detail service unavailable"));
    mock
}

fn print_todos(label: &str, value: &QueryValue) {
    match value.data_as::<Vec<Todo>>() {
        Ok(Some(todos)) => {
            println!("{label}:");
            for todo in todos {
                let mark = if todo.done { 'x' } else { ' ' };
                println!("  [{mark}] {} {}", todo.id, todo.title);
            }
        }
        Ok(None) if value.is_pending => println!("{label}: loading..."),
        Ok(None) => println!("{label}: no data"),
        Err(error) => println!("{label}: {error}"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ClientError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let transport = backend();
    let client = QueryClient::builder("https://todos.example.com")
        .transport(transport.clone())
        .settings(
            QuerySettings::new()
                .dedupe_time(Duration::from_secs(2))
                .on_error_retry(ErrorRetry::Disabled),
        )
        .build()?;

    // The list: fetched once, then served from the cache.
    let todos = client.use_query("todos", "/todos", QueryOptions::new());
    let watcher = todos.listen(|value| print_todos("todos changed", value));

    let first = todos.fetch().await;
    println!("first fetch: {:?}", first.data);
    todos.fetch().await;
    println!("requests after two reads: {}", transport.call_count());

    // Optimistic append: the list updates before the server answers, then revalidates.
    let add = client.use_mutation(
        "/todos/new",
        MutationOptions::new().mutator(|ctx| {
            let (updater, current) = ctx.get_cache_updater("todos", CacheUpdaterOptions::default());
            let mut next = current.unwrap_or_else(|| json!([]));
            if let Some(items) = next.as_array_mut() {
                items.push(json!({ "id": 0, "title": "Ship it (saving)", "done": false }));
            }
            updater.update(Some(next));
            FetchHooks::new()
        }),
    );
    let created = add
        .mutate(FetchRequest::new().body(json!({ "title": "Ship it" })))
        .await;
    println!("created: {created:?}");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Detail view keyed by the selected todo; nothing is fetched until one is selected.
    let selected: Atom<Option<KeyValue>> = Atom::new(None);
    let detail = client.use_query(
        KeyInput::parts([KeyPart::from("todo/"), KeyPart::from(&selected)]),
        "/todos/:id",
        QueryOptions::new()
            .request_for_key(|key| FetchRequest::new().param("id", key.parts[1].to_string())),
    );
    println!("detail without selection: {:?}", detail.fetch().await);

    selected.set(Some(1.into()));
    println!("detail for 1: {:?}", detail.fetch().await.data);

    selected.set(Some(2.into()));
    let failed = detail.fetch().await;
    println!("detail for 2: {:?}", failed.error);

    watcher.unsubscribe();
    println!("total requests: {}", transport.call_count());
    Ok(())
}
