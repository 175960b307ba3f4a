//! Scheduler lifecycle against a real file: startup failures, missing
//! files, restarts with persisted state and state transitions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use onibi_core::config::{StartPosition, WatchBackend};
use onibi_core::persistence::StateStore;
use onibi_core::pipeline::now_ms;
use onibi_core::{
    BusEvent, Config, ConfirmedDetection, Error, EventBus, LifecycleEvent, Scheduler,
    SchedulerState, Subscription,
};

const WAIT: Duration = Duration::from_secs(5);

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.watch.path = dir.join("terminal.log").display().to_string();
    config.watch.backend = WatchBackend::Poll;
    config.watch.poll_interval_ms = 50;
    config.watch.tick_interval_ms = 20;
    config.watch.start_position = StartPosition::Beginning;
    config.persistence.state_dir = dir.join("state").display().to_string();
    config.reducer.window_ms = 60_000;
    config.truncator.enabled = false;
    config
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

async fn next_detection(sub: &Subscription) -> ConfirmedDetection {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(BusEvent::Detection(found)) = sub.recv().await {
                return found;
            }
        }
    })
    .await
    .expect("detection within timeout")
}

async fn next_lifecycle(sub: &Subscription, wanted: fn(&LifecycleEvent) -> bool) -> LifecycleEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(BusEvent::Lifecycle(event)) = sub.recv().await {
                if wanted(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("lifecycle event within timeout")
}

#[tokio::test]
async fn locked_state_directory_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let _held = StateStore::open(config.state_dir().unwrap()).unwrap();

    let mut scheduler = Scheduler::new(config, EventBus::new(16));
    let err = scheduler.start().await.unwrap_err();
    assert!(matches!(err, Error::State(_)));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn persistence_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.persistence.enabled = false;
    let state_dir = config.state_dir().unwrap();

    let mut scheduler = Scheduler::new(config, EventBus::new(16));
    scheduler.start().await.unwrap();
    scheduler.stop().await.unwrap();
    assert!(!state_dir.exists());
}

#[tokio::test]
async fn state_transitions_are_observable() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = Scheduler::new(test_config(dir.path()), EventBus::new(16));
    let mut states = scheduler.state_changes();
    assert_eq!(*states.borrow_and_update(), SchedulerState::Stopped);

    scheduler.start().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SchedulerState::Running);

    scheduler.stop().await.unwrap();
    assert_eq!(*states.borrow_and_update(), SchedulerState::Stopped);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn deleted_file_is_reported_once_and_picked_up_again() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let path = config.log_path().unwrap();
    let mut scheduler = Scheduler::new(config, EventBus::new(64));
    let sub = scheduler.bus().subscribe();
    scheduler.start().await.unwrap();

    std::fs::remove_file(&path).unwrap();
    next_lifecycle(&sub, |e| matches!(e, LifecycleEvent::FileMissing { .. })).await;

    let t = now_ms();
    append(&path, &format!("{t}|S1|AI_START|x\n{}|S1|AI_END|x\n", t + 500));
    let detection = next_detection(&sub).await;
    assert_eq!(detection.session_id(), "S1");

    scheduler.stop().await.unwrap();
    let mut missing = 0;
    while let Ok(Some(event)) = sub.try_recv() {
        if matches!(event, BusEvent::Lifecycle(LifecycleEvent::FileMissing { .. })) {
            missing += 1;
        }
    }
    assert_eq!(missing, 0);
}

#[tokio::test]
async fn restart_resumes_from_watermark_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let path = config.log_path().unwrap();
    let t = now_ms();

    let first_len = {
        let mut scheduler = Scheduler::new(config.clone(), EventBus::new(64));
        let sub = scheduler.bus().subscribe();
        scheduler.start().await.unwrap();
        let text = format!("{t}|S1|AI_START|x\n{}|S1|AI_END|x\n", t + 100);
        append(&path, &text);
        let first = next_detection(&sub).await;
        assert_eq!(first.session_id(), "S1");
        scheduler.stop().await.unwrap();
        text.len() as u64
    };

    let mut scheduler = Scheduler::new(config, EventBus::new(64));
    let sub = scheduler.bus().subscribe();
    scheduler.start().await.unwrap();
    let started = next_lifecycle(&sub, |e| matches!(e, LifecycleEvent::Started { .. })).await;
    assert!(matches!(started, LifecycleEvent::Started { offset, .. } if offset == first_len));

    // The repeated end marker lands in the restored dedup window.
    append(
        &path,
        &format!(
            "{}|S1|AI_END|x\n{}|S2|AI_START|y\n{}|S2|AI_END|y\n",
            t + 200,
            t + 300,
            t + 400
        ),
    );
    let next = next_detection(&sub).await;
    assert_eq!(next.session_id(), "S2");
    scheduler.stop().await.unwrap();
}
