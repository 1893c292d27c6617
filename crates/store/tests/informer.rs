#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_config, obj, FakeSource, Recorder};
use mirra_core::{LabelSelector, ObjectKey, SourceError, WatchEvent};
use mirra_store::{HandlerFuncs, Informer};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coredns_list_then_modify() {
    let src = FakeSource::new();
    src.push_list(vec![obj("kube-system", "coredns", "100")], "100");
    let events = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());

    assert!(informer.wait_for_initial_sync(&cancel).await);
    let listed = informer.lister().namespace("kube-system").list(&LabelSelector::everything());
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "coredns");
    assert_eq!(rec.events(), vec!["add:coredns@100"]);
    eventually("watch from listed version", || src.watch_versions() == vec!["100"]).await;

    events.unbounded_send(Ok(WatchEvent::Modified(obj("kube-system", "coredns", "101")))).unwrap();
    eventually("coredns update", || rec.contains("update:coredns@100->101")).await;
    let key = ObjectKey::namespaced("kube-system", "coredns");
    assert_eq!(informer.lister().get(&key).unwrap().resource_version, "101");
    assert_eq!(informer.last_sync_resource_version().as_deref(), Some("101"));

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_then_add_before_drain_is_one_update() {
    let src = FakeSource::new();
    src.push_list(vec![obj("kube-system", "coredns", "100")], "100");
    let events = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    let rec = Recorder::default();
    informer.add_handler(rec.clone());

    // Park the drain loop inside a handler so the next events pile up in the queue.
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    informer.add_handler(HandlerFuncs::new().with_add(move |o: &mirra_core::Object| {
        if o.name == "blocker" {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        }
        Ok(())
    }));

    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);

    events.unbounded_send(Ok(WatchEvent::Added(obj("kube-system", "blocker", "101")))).unwrap();
    eventually("drain loop parked", || rec.contains("add:blocker@101")).await;

    events.unbounded_send(Ok(WatchEvent::Deleted(obj("kube-system", "coredns", "102")))).unwrap();
    events.unbounded_send(Ok(WatchEvent::Added(obj("kube-system", "coredns", "103")))).unwrap();
    eventually("both events queued", || informer.last_sync_resource_version().as_deref() == Some("103")).await;
    assert_eq!(informer.pending(), 1);

    release_tx.send(()).unwrap();
    eventually("collapsed update", || rec.contains("update:coredns@100->103")).await;
    assert!(!rec.events().iter().any(|e| e.starts_with("delete:")));

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_redelivers_unchanged_objects() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1"), obj("ns", "b", "7")], "7");

    let config = fast_config().with_resync_period(Duration::from_millis(30));
    let informer = Informer::new(src.clone(), config);
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);

    eventually("resync of a", || rec.contains("update:a@1->1")).await;
    eventually("resync of b", || rec.contains("update:b@7->7")).await;

    let store = informer.store();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(&ObjectKey::namespaced("ns", "a")).unwrap().resource_version, "1");
    assert_eq!(src.list_calls(), 1, "resync must not relist");

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observers_see_identical_sequences() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1"), obj("ns", "b", "1"), obj("ns", "c", "1")], "1");
    let events = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    let recorders: Vec<Recorder> = (0..4).map(|_| Recorder::default()).collect();
    std::thread::scope(|s| {
        for r in &recorders {
            let informer = &informer;
            s.spawn(move || informer.add_handler(r.clone()));
        }
    });

    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);
    events.unbounded_send(Ok(WatchEvent::Modified(obj("ns", "a", "2")))).unwrap();
    events.unbounded_send(Ok(WatchEvent::Deleted(obj("ns", "b", "3")))).unwrap();
    events.unbounded_send(Ok(WatchEvent::Added(obj("ns", "d", "4")))).unwrap();

    eventually("all events delivered", || recorders.iter().all(|r| r.len() == 6)).await;
    let first = recorders[0].events();
    assert_eq!(
        first,
        vec!["add:a@1", "add:b@1", "add:c@1", "update:a@1->2", "delete:b@3", "add:d@4"]
    );
    for r in &recorders[1..] {
        assert_eq!(r.events(), first);
    }

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_after_stream_close_converges_and_stays_synced() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1"), obj("ns", "b", "1")], "1");
    src.push_list(vec![obj("ns", "a", "2"), obj("ns", "c", "2")], "2");
    let first_watch = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    assert!(!informer.has_synced());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);
    assert!(informer.has_synced());

    // server closes the stream
    drop(first_watch);
    eventually("relist", || src.list_calls() == 2).await;
    eventually("store converged", || rec.contains("delete:b@1") && rec.contains("add:c@2")).await;

    let mut names: Vec<(String, String)> = informer
        .lister()
        .list(&LabelSelector::everything())
        .iter()
        .map(|o| (o.name.clone(), o.resource_version.clone()))
        .collect();
    names.sort();
    assert_eq!(names, vec![("a".to_string(), "2".to_string()), ("c".to_string(), "2".to_string())]);
    assert!(rec.contains("update:a@1->2"));
    assert!(informer.has_synced(), "later relists keep the informer synced");

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_version_forces_relist() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1")], "1");
    src.push_list(vec![obj("ns", "x", "50")], "50");
    src.push_watch_err(SourceError::StaleVersion("too old resource version: 1".into()));

    let informer = Informer::new(src.clone(), fast_config());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());

    eventually("relisted", || src.list_calls() >= 2).await;
    let key = ObjectKey::namespaced("ns", "x");
    eventually("new snapshot applied", || informer.store().contains(&key)).await;
    eventually("old key removed", || informer.store().len() == 1).await;
    eventually("second watch", || src.watch_versions().len() >= 2).await;
    assert_eq!(src.watch_versions()[..2], ["1".to_string(), "50".to_string()]);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_watch_errors_rewatch_from_last_version() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "10")], "10");
    src.push_watch_err(SourceError::Transient("connection reset".into()));
    let events = src.push_watch();
    let _idle = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());

    eventually("second watch", || src.watch_versions().len() == 2).await;
    events.unbounded_send(Ok(WatchEvent::Modified(obj("ns", "a", "11")))).unwrap();
    events.unbounded_send(Err(SourceError::Transient("timeout".into()))).unwrap();
    eventually("third watch", || src.watch_versions().len() == 3).await;

    assert_eq!(src.watch_versions(), vec!["10", "10", "11"]);
    assert_eq!(src.list_calls(), 1);
    eventually("update delivered", || rec.contains("update:a@10->11")).await;

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_watch_budget_falls_back_to_list() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1")], "1");
    for _ in 0..3 {
        src.push_watch_err(SourceError::Transient("unavailable".into()));
    }

    let informer = Informer::new(src.clone(), fast_config());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());

    eventually("relist after budget", || src.list_calls() == 2).await;
    assert!(src.watch_versions().len() >= 3);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_failures_are_retried() {
    let src = FakeSource::new();
    src.push_list_err(SourceError::Transient("apiserver busy".into()));
    src.push_list_err(SourceError::Transient("apiserver busy".into()));
    src.push_list(vec![obj("ns", "a", "1")], "1");

    let informer = Informer::new(src.clone(), fast_config());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    let synced = tokio::time::timeout(Duration::from_secs(5), informer.wait_for_initial_sync(&cancel)).await;
    assert!(matches!(synced, Ok(true)));
    assert_eq!(src.list_calls(), 3);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_everything() {
    let src = FakeSource::new();
    src.push_list_err(SourceError::Transient("down".into()));

    let informer = Informer::new(src.clone(), fast_config());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());

    let waiter = {
        let cancel = cancel.clone();
        async move { informer.wait_for_initial_sync(&cancel).await }
    };
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    };
    let (synced, ()) = tokio::join!(waiter, canceller);
    assert!(!synced);

    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("tasks stop promptly after cancel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_handler_gets_current_state() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1"), obj("ns", "b", "2")], "2");

    let informer = Informer::new(src.clone(), fast_config());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);

    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let mut got = rec.events();
    got.sort();
    assert_eq!(got, vec!["add:a@1", "add:b@2"]);

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_observers_are_isolated() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1")], "1");
    let events = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    informer.add_handler(
        HandlerFuncs::new()
            .with_add(|_: &mirra_core::Object| anyhow::bail!("add rejected"))
            .with_update(|_, _| anyhow::bail!("update rejected")),
    );
    informer.add_handler(HandlerFuncs::new().with_update(|_: &mirra_core::Object, _| panic!("handler bug")));
    let rec = Recorder::default();
    informer.add_handler(rec.clone());

    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);
    events.unbounded_send(Ok(WatchEvent::Modified(obj("ns", "a", "2")))).unwrap();
    events.unbounded_send(Ok(WatchEvent::Added(obj("ns", "z", "3")))).unwrap();

    eventually("later events still delivered", || rec.contains("add:z@3")).await;
    assert_eq!(rec.events(), vec!["add:a@1", "update:a@1->2", "add:z@3"]);
    let shared: Arc<mirra_core::Object> = informer.lister().namespace("ns").get("a").unwrap();
    assert_eq!(shared.resource_version, "2");

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streams_closing_at_once_back_off_between_relists() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1")], "1");
    for _ in 0..3 {
        drop(src.push_watch());
    }

    let mut config = fast_config();
    config.backoff_initial = Duration::from_millis(40);
    config.backoff_max = Duration::from_millis(160);
    let informer = Informer::new(src.clone(), config);
    let cancel = CancellationToken::new();
    let started = tokio::time::Instant::now();
    let handle = informer.start(cancel.clone());

    // 40 + 80 + 160 ms of backoff before the fourth list
    eventually("fourth list", || src.list_calls() == 4).await;
    assert!(started.elapsed() >= Duration::from_millis(280), "relisted after {:?}", started.elapsed());

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_hands_observers_the_event_object() {
    let src = FakeSource::new();
    src.push_list(vec![obj("ns", "a", "1")], "1");
    let events = src.push_watch();

    let informer = Informer::new(src.clone(), fast_config());
    let rec = Recorder::default();
    informer.add_handler(rec.clone());
    let cancel = CancellationToken::new();
    let handle = informer.start(cancel.clone());
    assert!(informer.wait_for_initial_sync(&cancel).await);

    // final state carried by the delete, not the committed a@1
    events.unbounded_send(Ok(WatchEvent::Deleted(obj("ns", "a", "5")))).unwrap();
    eventually("delete delivered", || rec.contains("delete:a@5")).await;
    assert!(!rec.contains("delete:a@1"));
    assert!(informer.store().is_empty());

    handle.stop().await;
}
