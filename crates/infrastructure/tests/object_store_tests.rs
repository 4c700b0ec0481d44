use futures::future::join_all;
use std::sync::Arc;
use taskyard_core::config::{CacheMode, DatabaseConfig, ProjectConfig};
use taskyard_core::models::{Task, TaskState};
use taskyard_core::{DocumentBackend, Filter, Modification, ObjectId};
use taskyard_infrastructure::{DatabaseManager, ObjectStore, Project, SqliteDocumentBackend};
use tempfile::TempDir;

async fn file_backend(dir: &TempDir) -> Arc<dyn DocumentBackend> {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("store.db").display()),
        max_connections: 8,
        busy_timeout_ms: 10_000,
        ..DatabaseConfig::default()
    };
    let manager = DatabaseManager::new(&config).await.unwrap();
    manager.migrate().await.unwrap();
    Arc::new(SqliteDocumentBackend::new(manager.pool().clone()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_on_sqlite_have_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let backend = file_backend(&dir).await;
    let store: Arc<ObjectStore<Task>> =
        Arc::new(ObjectStore::new("race.tasks", backend.clone(), CacheMode::None));

    let task = Task::new("echo");
    store.save(&task).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = store.clone();
            tokio::spawn(async move {
                let claim = Modification::new("state", TaskState::Created, TaskState::Queued)
                    .also("worker", ObjectId::from_raw(worker));
                store
                    .modify_one_where(&Filter::new(), &claim)
                    .await
                    .unwrap()
                    .map(|t| t.worker)
            })
        })
        .collect();

    let winners: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .filter_map(|result| result.unwrap())
        .collect();

    assert_eq!(winners.len(), 1);
    let stored = store.reload(task.id).await.unwrap();
    assert_eq!(stored.state, TaskState::Queued);
    assert_eq!(stored.worker, winners[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_tasks_are_each_claimed_once() {
    let dir = TempDir::new().unwrap();
    let backend = file_backend(&dir).await;
    let store: Arc<ObjectStore<Task>> =
        Arc::new(ObjectStore::new("race.tasks", backend, CacheMode::Lru { capacity: 4 }));

    let tasks: Vec<Task> = (0..20).map(|i| Task::new(format!("job-{i}"))).collect();
    for task in &tasks {
        store.save(task).await.unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = store
                    .modify_one("state", TaskState::Created, TaskState::Queued)
                    .await
                    .unwrap()
                {
                    claimed.push(task.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    let mut expected: Vec<_> = tasks.iter().map(|t| t.id).collect();
    expected.sort();
    assert_eq!(all, expected);
}

#[tokio::test]
async fn project_survives_reopen_on_same_database() {
    let dir = TempDir::new().unwrap();
    let task = Task::new("echo").with_generator("md");
    {
        let project = Project::new(ProjectConfig::default(), file_backend(&dir).await);
        project.queue(&task).await.unwrap();
    }

    let project = Project::new(ProjectConfig::default(), file_backend(&dir).await);
    let loaded = project.tasks.load(task.id).await.unwrap();
    assert_eq!(loaded.generator.as_deref(), Some("md"));
    let created = project
        .tasks
        .find(&Filter::new().eq("state", TaskState::Created))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
}
