use chrono::Utc;

use super::support::{harness, minutely_task};
use crate::core::dispatch::UpdateTaskRequest;
use crate::core::store::types::SessionKind;

#[tokio::test]
async fn invalid_definitions_are_rejected_synchronously() {
    let h = harness().await;

    let mut bad_cron = minutely_task(false);
    bad_cron.cron = "every full moon".to_string();
    assert!(h.dispatcher.create_task("local", bad_cron).await.is_err());

    let mut bad_tz = minutely_task(false);
    bad_tz.timezone = Some("Mars/Olympus".to_string());
    assert!(h.dispatcher.create_task("local", bad_tz).await.is_err());

    let mut empty_prompt = minutely_task(false);
    empty_prompt.prompt = "   ".to_string();
    assert!(h.dispatcher.create_task("local", empty_prompt).await.is_err());

    // Nothing was persisted.
    assert!(h.dispatcher.list_tasks("local").await.unwrap().is_empty());
}

#[tokio::test]
async fn create_computes_a_future_fire_time() {
    let h = harness().await;
    let before = Utc::now();
    let task = h
        .dispatcher
        .create_task("local", minutely_task(false))
        .await
        .expect("create");
    assert!(task.next_fire_at > before);
    assert!(task.enabled);
}

#[tokio::test]
async fn reuse_session_tasks_pin_a_session_at_create_time() {
    let h = harness().await;
    let task = h
        .dispatcher
        .create_task("local", minutely_task(true))
        .await
        .expect("create");

    let session_id = task.session_id.expect("pinned session");
    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.kind, SessionKind::Scheduled);
    assert_eq!(session.owner_id, "local");
}

#[tokio::test]
async fn updating_cron_recomputes_the_fire_time() {
    let h = harness().await;
    let task = h
        .dispatcher
        .create_task("local", minutely_task(false))
        .await
        .expect("create");
    let old_fire = task.next_fire_at;

    let updated = h
        .dispatcher
        .update_task(
            "local",
            task.id,
            UpdateTaskRequest {
                cron: Some("0 3 * * *".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.cron, "0 3 * * *");
    assert_ne!(updated.next_fire_at, old_fire);

    // Invalid updates are rejected without touching the row.
    assert!(
        h.dispatcher
            .update_task(
                "local",
                task.id,
                UpdateTaskRequest {
                    timezone: Some("Nowhere/Void".to_string()),
                    ..Default::default()
                },
            )
            .await
            .is_err()
    );
    let task = h.dispatcher.get_task("local", task.id).await.unwrap();
    assert_eq!(task.timezone, "UTC");
}

#[tokio::test]
async fn delete_is_soft_and_stops_dispatch() {
    let h = harness().await;
    let task = h
        .dispatcher
        .create_task("local", minutely_task(false))
        .await
        .expect("create");
    let fire = task.next_fire_at;

    h.dispatcher.delete_task("local", task.id).await.expect("delete");
    assert!(h.dispatcher.get_task("local", task.id).await.is_err());

    let summary = h.dispatcher.tick_at(fire).await;
    assert_eq!(summary.dispatched + summary.skipped + summary.errors, 0);
}

#[tokio::test]
async fn tasks_are_scoped_to_their_owner() {
    let h = harness().await;
    let task = h
        .dispatcher
        .create_task("alice", minutely_task(false))
        .await
        .expect("create");

    assert!(h.dispatcher.get_task("mallory", task.id).await.is_err());
    assert!(h.dispatcher.list_tasks("mallory").await.unwrap().is_empty());
    assert!(
        h.dispatcher
            .delete_task("mallory", task.id)
            .await
            .is_err()
    );
}
