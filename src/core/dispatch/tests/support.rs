use std::sync::Arc;

use crate::core::dispatch::{CreateTaskRequest, DispatchConfig, TaskDispatcher};
use crate::core::run::RunLifecycle;
use crate::core::store::StateStore;

pub(crate) struct Harness {
    pub store: Arc<StateStore>,
    pub lifecycle: Arc<RunLifecycle>,
    pub dispatcher: TaskDispatcher,
    _dir: tempfile::TempDir,
}

pub(crate) async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(StateStore::open(dir.path()).await.expect("store"));
    let lifecycle = Arc::new(RunLifecycle::new(store.clone()));
    let dispatcher =
        TaskDispatcher::new(store.clone(), lifecycle.clone(), DispatchConfig::default());
    Harness {
        store,
        lifecycle,
        dispatcher,
        _dir: dir,
    }
}

pub(crate) fn minutely_task(reuse_session: bool) -> CreateTaskRequest {
    CreateTaskRequest {
        name: "nightly-digest".to_string(),
        cron: "* * * * *".to_string(),
        timezone: Some("UTC".to_string()),
        prompt: "Summarize yesterday's activity".to_string(),
        enabled: true,
        reuse_session,
        config: None,
        input_files: None,
        container_mode: None,
    }
}
