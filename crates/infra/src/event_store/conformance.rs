//! Behaviour every `EventStore` backend must share.
//!
//! Ids are namespaced per run so the checks can execute against a shared
//! database.

use tidemark_core::{new_event_id, Event, TimeRange};

use super::{EventStore, EventStoreError};

fn ev(ns: &str, id: &str, aggregate: &str, event_type: &str, data: &str, ts: i64) -> Event {
    Event {
        id: format!("{ns}-{id}"),
        aggregate_id: format!("{ns}-{aggregate}"),
        event_type: event_type.to_string(),
        data: data.to_string(),
        timestamp: ts,
    }
}

fn ids(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.id.clone()).collect()
}

pub(crate) async fn run_all<S: EventStore>(store: &S) {
    saves_and_reads_in_order(store).await;
    sorts_by_timestamp_with_insertion_tie_break(store).await;
    rejects_duplicate_ids(store).await;
    rejects_invalid_events(store).await;
    unknown_aggregate_is_empty(store).await;
    point_query(store).await;
    time_windows(store).await;
    lists_aggregates(store).await;
}

async fn saves_and_reads_in_order<S: EventStore>(store: &S) {
    let ns = new_event_id();
    let e1 = ev(&ns, "e1", "a1", "EventType1", "x", 1);
    let e2 = ev(&ns, "e2", "a1", "EventType2", "y", 2);
    store.save_event(&e1).await.unwrap();
    store.save_event(&e2).await.unwrap();

    let got = store.get_events(&e1.aggregate_id).await.unwrap();
    assert_eq!(got, vec![e1.clone(), e2.clone()]);
    assert_eq!(store.query_events(&e1.aggregate_id).await.unwrap(), got);
}

async fn sorts_by_timestamp_with_insertion_tie_break<S: EventStore>(store: &S) {
    let ns = new_event_id();
    for (id, ts) in [("c", 30), ("a", 10), ("tie-1", 20), ("tie-2", 20), ("tie-0", 20)] {
        store.save_event(&ev(&ns, id, "a1", "t", "", ts)).await.unwrap();
    }

    let aggregate = format!("{ns}-a1");
    let first = store.get_events(&aggregate).await.unwrap();
    let expected: Vec<String> = ["a", "tie-1", "tie-2", "tie-0", "c"]
        .iter()
        .map(|id| format!("{ns}-{id}"))
        .collect();
    assert_eq!(ids(&first), expected);

    let second = store.get_events(&aggregate).await.unwrap();
    assert_eq!(first, second);
}

async fn rejects_duplicate_ids<S: EventStore>(store: &S) {
    let ns = new_event_id();
    let original = ev(&ns, "dup", "a1", "t", "first", 1);
    store.save_event(&original).await.unwrap();

    let replay = ev(&ns, "dup", "a1", "t", "second", 2);
    match store.save_event(&replay).await {
        Err(EventStoreError::Duplicate { id }) => assert_eq!(id, original.id),
        other => panic!("expected duplicate error, got {other:?}"),
    }

    let history = store.get_events(&original.aggregate_id).await.unwrap();
    assert_eq!(history, vec![original]);
}

async fn rejects_invalid_events<S: EventStore>(store: &S) {
    let ns = new_event_id();
    let mut no_aggregate = ev(&ns, "x", "a1", "t", "", 1);
    no_aggregate.aggregate_id.clear();
    assert!(matches!(
        store.save_event(&no_aggregate).await,
        Err(EventStoreError::InvalidEvent(_))
    ));

    let no_type = ev(&ns, "y", "a1", "", "", 1);
    assert!(matches!(
        store.save_event(&no_type).await,
        Err(EventStoreError::InvalidEvent(_))
    ));
    assert!(store.get_events(&format!("{ns}-a1")).await.unwrap().is_empty());
}

async fn unknown_aggregate_is_empty<S: EventStore>(store: &S) {
    let events = store.get_events(&format!("{}-nobody", new_event_id())).await.unwrap();
    assert!(events.is_empty());
}

async fn point_query<S: EventStore>(store: &S) {
    let ns = new_event_id();
    let e = ev(&ns, "p1", "a1", "t", "payload", 9);
    store.save_event(&e).await.unwrap();

    assert_eq!(store.get_event(&e.id).await.unwrap(), Some(e));
    assert_eq!(store.get_event(&format!("{ns}-missing")).await.unwrap(), None);
}

async fn time_windows<S: EventStore>(store: &S) {
    let ns = new_event_id();
    for ts in [5, 1, 3, 7, 9] {
        store
            .save_event(&ev(&ns, &format!("w{ts}"), "a1", "t", "", ts))
            .await
            .unwrap();
    }
    let aggregate = format!("{ns}-a1");

    let window = store
        .get_events_between(&aggregate, TimeRange::new(3, 7))
        .await
        .unwrap();
    assert_eq!(window.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![3, 5]);

    let tail = store
        .get_events_between(&aggregate, TimeRange::since(7))
        .await
        .unwrap();
    assert_eq!(tail.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![7, 9]);

    let all = store
        .get_events_between(&aggregate, TimeRange::all())
        .await
        .unwrap();
    assert_eq!(all, store.get_events(&aggregate).await.unwrap());
}

async fn lists_aggregates<S: EventStore>(store: &S) {
    let ns = new_event_id();
    store.save_event(&ev(&ns, "l1", "b", "t", "", 1)).await.unwrap();
    store.save_event(&ev(&ns, "l2", "a", "t", "", 1)).await.unwrap();
    store.save_event(&ev(&ns, "l3", "a", "t", "", 2)).await.unwrap();

    let listed: Vec<String> = store
        .aggregate_ids()
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.starts_with(&ns))
        .collect();
    assert_eq!(listed, vec![format!("{ns}-a"), format!("{ns}-b")]);
}
