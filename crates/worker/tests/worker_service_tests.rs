use std::sync::Arc;
use std::time::Duration;

use taskyard_core::models::{File, LogStream, Task, TaskState, WorkerCommand, WorkerState};
use taskyard_core::{CacheConfig, Filter, ObjectId, ProjectConfig, StagingConfig};
use taskyard_dispatcher::{
    ControlOutcome, DependencyCheckService, DependencyChecker, TaskController,
};
use taskyard_infrastructure::{MemoryBackend, Project};
use taskyard_worker::{WorkerService, WorkerServiceBuilder, WorkerSummary};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

struct Fixture {
    backend: Arc<MemoryBackend>,
    project: Arc<Project>,
    shared: TempDir,
    work: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let shared = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let config = ProjectConfig {
            name: "alanine".to_string(),
            shared_root: shared.path().to_string_lossy().to_string(),
            cache: CacheConfig::default(),
        };
        let project = Arc::new(Project::new(config, backend.clone()));
        Self {
            backend,
            project,
            shared,
            work,
        }
    }

    fn worker(&self) -> WorkerServiceBuilder {
        WorkerService::builder(self.project.clone())
            .name("w-test")
            .work_root(self.work.path().to_string_lossy())
            .poll_interval_ms(20)
            .heartbeat_interval_seconds(1)
            .store_backoff_ms(10, 50)
    }

    fn shared_path(&self, name: &str) -> std::path::PathBuf {
        self.shared.path().join(name)
    }

    fn workdir(&self, task: ObjectId) -> std::path::PathBuf {
        self.work.path().join(task.to_string())
    }

    async fn state(&self, task: ObjectId) -> TaskState {
        self.project.tasks.reload(task).await.unwrap().state
    }

    async fn wait_for(&self, task: ObjectId, state: TaskState) {
        for _ in 0..400 {
            if let Ok(current) = self.project.tasks.reload(task).await {
                if current.state == state {
                    return;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("任务 {task} 未到达 {state}");
    }

    async fn wait_current(&self, worker: ObjectId, task: ObjectId) {
        for _ in 0..400 {
            if let Ok(record) = self.project.workers.reload(worker).await {
                if record.current == Some(task) {
                    return;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("Worker {worker} 没有开始执行任务 {task}");
    }

    async fn only_worker(&self) -> ObjectId {
        for _ in 0..200 {
            if let Some(worker) = self.project.workers.all().await.unwrap().first() {
                return worker.id;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("Worker 没有注册");
    }
}

async fn run_until_idle(builder: WorkerServiceBuilder) -> WorkerSummary {
    let (_tx, rx) = broadcast::channel(1);
    timeout(Duration::from_secs(30), builder.exit_when_idle(true).build().run(rx))
        .await
        .expect("worker timed out")
        .unwrap()
}

fn shell(script: &str) -> Task {
    Task::new("bash").with_arguments(["-c", script])
}

#[tokio::test]
async fn test_successful_task_registers_target_and_unblocks_dependant() {
    let fx = Fixture::new();
    let target = File::at("shared://result.txt").unwrap();
    assert!(target.created.is_none());

    let mut a = shell("echo 42 > result.txt").with_generator("sim");
    let registered = a.put("result.txt", &target).unwrap();
    let mut b = Task::new("true").with_generator("analysis");
    b.add_dependency(&a).unwrap();
    fx.project.queue_all(&[a.clone(), b.clone()]).await.unwrap();

    let checker = DependencyChecker::new(fx.project.clone());
    assert!(!checker.check_dependencies(&b).await.unwrap().can_execute);

    let before = chrono::Utc::now().timestamp_millis();
    let summary = run_until_idle(fx.worker().generators(["sim"])).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let done = fx.project.tasks.reload(a.id).await.unwrap();
    assert_eq!(done.state, TaskState::Success);
    assert_eq!(done.attempts, 1);
    assert!(done.script.as_deref().unwrap().starts_with("#!/bin/bash\nset -e\n"));

    assert_eq!(std::fs::read_to_string(fx.shared_path("result.txt")).unwrap(), "42\n");
    let file = fx
        .project
        .file_at(&registered.location)
        .await
        .unwrap()
        .expect("target registered");
    assert!(file.exists());
    assert!(file.created.unwrap() >= before);
    assert_eq!(file.generator, Some(a.id));

    let readiness = checker.check_dependencies(&b).await.unwrap();
    assert!(readiness.can_execute);
    assert_eq!(fx.state(b.id).await, TaskState::Created);

    assert!(!fx.workdir(a.id).exists());
    let worker = fx.project.workers.reload(summary.worker_id.unwrap()).await.unwrap();
    assert_eq!(worker.state, WorkerState::Shutdown);
    assert_eq!(worker.current, None);
}

#[tokio::test]
async fn test_failed_task_keeps_output_and_workdir() {
    let fx = Fixture::new();
    let task = shell("echo partial > scratch.txt; echo boom >&2; exit 3");
    fx.project.queue(&task).await.unwrap();

    let summary = run_until_idle(fx.worker()).await;
    assert_eq!(summary.failed, 1);

    let failed = fx.project.tasks.reload(task.id).await.unwrap();
    assert_eq!(failed.state, TaskState::Fail);
    assert!(failed.script.is_some());
    assert!(fx.workdir(task.id).join("scratch.txt").exists());

    let logs = fx.project.task_logs(task.id).await.unwrap();
    let stderr = logs
        .iter()
        .find(|log| log.stream == LogStream::Stderr)
        .expect("stderr saved");
    assert_eq!(stderr.content, "boom\n");
    assert_eq!(failed.stderr, Some(stderr.id));
}

#[tokio::test]
async fn test_missing_controller_output_fails_task() {
    let fx = Fixture::new();
    let controller = TempDir::new().unwrap();
    let target = File::at(&format!("file://{}/out.txt", controller.path().display())).unwrap();

    let mut task = Task::new("true");
    task.put("never-written.txt", &target).unwrap();
    fx.project.queue(&task).await.unwrap();

    run_until_idle(fx.worker()).await;
    assert_eq!(fx.state(task.id).await, TaskState::Fail);
    assert!(fx.project.file_at(&target.location).await.unwrap().is_none());
}

#[tokio::test]
async fn test_controller_file_is_transferred_in_and_out() {
    let fx = Fixture::new();
    let controller = TempDir::new().unwrap();
    std::fs::write(controller.path().join("input.pdb"), "ATOM 1\n").unwrap();
    let input = File::at(&format!("file://{}/input.pdb", controller.path().display())).unwrap();
    let output = File::at(&format!("file://{}/copy.pdb", controller.path().display())).unwrap();

    let mut task = shell("cat input.pdb input.pdb > copy.pdb");
    task.get(&input, None).unwrap();
    task.put("copy.pdb", &output).unwrap();
    fx.project.queue(&task).await.unwrap();

    run_until_idle(fx.worker()).await;
    assert_eq!(fx.state(task.id).await, TaskState::Success);
    assert_eq!(
        std::fs::read_to_string(controller.path().join("copy.pdb")).unwrap(),
        "ATOM 1\nATOM 1\n"
    );
}

#[tokio::test]
async fn test_restart_wipes_workdir_and_registers_target_once() {
    let fx = Fixture::new();
    let script = r#"set -e
test ! -e partial.txt
if [ -e "$FLAG" ]; then echo done > out.txt; else touch partial.txt "$FLAG"; exit 1; fi"#;
    let mut task = shell(script);
    task.setenv("FLAG", "shared://flag");
    let target = task.put("out.txt", &File::at("shared://out.txt").unwrap()).unwrap();
    fx.project.queue(&task).await.unwrap();

    run_until_idle(fx.worker()).await;
    assert_eq!(fx.state(task.id).await, TaskState::Fail);
    assert!(fx.workdir(task.id).join("partial.txt").exists());

    TaskController::new(fx.project.clone())
        .restart(task.id)
        .await
        .unwrap();
    run_until_idle(fx.worker()).await;

    let rerun = fx.project.tasks.reload(task.id).await.unwrap();
    assert_eq!(rerun.state, TaskState::Success);
    assert_eq!(rerun.attempts, 2);
    let registrations = fx
        .project
        .files
        .find(&Filter::new().eq("location", target.location.render()))
        .await
        .unwrap();
    assert_eq!(registrations.len(), 1);
}

#[tokio::test]
async fn test_auto_submission_runs_dependencies_outside_affinity() {
    let fx = Fixture::new();
    let prep = shell("echo prep").with_generator("prep");
    let mut sim = shell("echo sim").with_generator("sim");
    sim.add_dependency(&prep).unwrap();
    fx.project.queue_all(&[prep.clone(), sim.clone()]).await.unwrap();

    let summary = run_until_idle(fx.worker().generators(["sim"])).await;
    assert_eq!(summary.succeeded, 0);
    assert_eq!(fx.state(prep.id).await, TaskState::Created);

    let summary = run_until_idle(fx.worker().generators(["sim"]).auto_submit_dependencies(true)).await;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(fx.state(prep.id).await, TaskState::Success);
    assert_eq!(fx.state(sim.id).await, TaskState::Success);
}

#[tokio::test]
async fn test_call_task_round_trips_json_files() {
    let fx = Fixture::new();
    let tools = TempDir::new().unwrap();
    let interpreter = tools.path().join("fake-python");
    std::fs::write(
        &interpreter,
        "#!/bin/bash\ntest -f \"$1\"\necho '{\"frames\": 3}' > output.json\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&interpreter, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let call_spec = taskyard_core::CallSpec::new("md.analysis.count_frames").kwarg("stride", 2);
    let task = Task::call(call_spec);
    fx.project.queue(&task).await.unwrap();

    let staging = StagingConfig {
        call_interpreter: interpreter.to_string_lossy().to_string(),
        ..StagingConfig::default()
    };
    run_until_idle(fx.worker().staging(staging).keep_workdirs(true)).await;

    let done = fx.project.tasks.reload(task.id).await.unwrap();
    assert_eq!(done.state, TaskState::Success);
    assert_eq!(done.return_value, Some(serde_json::json!({"frames": 3})));

    let input: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.workdir(task.id).join("input.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(input["function"], "md.analysis.count_frames");
    assert_eq!(input["kwargs"]["stride"], 2);
}

#[tokio::test]
async fn test_store_outage_does_not_fail_running_task() {
    let fx = Fixture::new();
    let task = shell("sleep 0.5; echo finished");
    fx.project.queue(&task).await.unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(fx.worker().exit_when_idle(true).build().run(rx));

    fx.wait_for(task.id, TaskState::Running).await;
    fx.backend.set_offline(true);
    sleep(Duration::from_millis(1200)).await;
    fx.backend.set_offline(false);

    let summary = timeout(Duration::from_secs(20), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.state(task.id).await, TaskState::Success);
}

#[tokio::test]
async fn test_kill_command_requeues_current_task() {
    let fx = Fixture::new();
    let task = shell("sleep 30");
    fx.project.queue(&task).await.unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(fx.worker().build().run(rx));
    let worker = fx.only_worker().await;
    fx.wait_current(worker, task.id).await;

    let controller = TaskController::new(fx.project.clone());
    assert!(controller.send_command(worker, WorkerCommand::Kill).await.unwrap());

    let summary = timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.stopped, 1);

    let requeued = fx.project.tasks.reload(task.id).await.unwrap();
    assert_eq!(requeued.state, TaskState::Created);
    assert_eq!(requeued.worker, None);
    let record = fx.project.workers.reload(worker).await.unwrap();
    assert_eq!(record.state, WorkerState::Shutdown);
}

#[tokio::test]
async fn test_cancel_stops_only_the_current_task() {
    let fx = Fixture::new();
    let long = shell("sleep 30");
    let short = shell("echo next");
    fx.project.queue_all(&[long.clone(), short.clone()]).await.unwrap();

    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(fx.worker().build().run(rx));
    let worker = fx.only_worker().await;
    fx.wait_current(worker, long.id).await;

    let controller = TaskController::new(fx.project.clone());
    let outcome = controller.cancel(long.id).await.unwrap();
    assert_eq!(outcome, ControlOutcome::Signalled(worker));

    fx.wait_for(long.id, TaskState::Cancelled).await;
    fx.wait_for(short.id, TaskState::Success).await;

    tx.send(()).unwrap();
    let summary = timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn test_diagnostic_command_output_is_logged() {
    let fx = Fixture::new();
    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(fx.worker().build().run(rx));
    let worker = fx.only_worker().await;

    TaskController::new(fx.project.clone())
        .send_command(worker, WorkerCommand::Shell("echo diag-ok".into()))
        .await
        .unwrap();

    let mut found = None;
    for _ in 0..200 {
        let logs = fx
            .project
            .logs
            .find(&Filter::new().eq("worker", worker))
            .await
            .unwrap();
        if let Some(log) = logs.into_iter().find(|l| l.stream == LogStream::Worker) {
            found = Some(log);
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    let log = found.expect("diagnostic log saved");
    assert!(log.content.contains("diag-ok"));

    tx.send(()).unwrap();
    timeout(Duration::from_secs(10), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_command_lets_current_task_finish() {
    let fx = Fixture::new();
    let task = shell("sleep 2; echo finished");
    fx.project.queue(&task).await.unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(fx.worker().walltime_seconds(None, 0).build().run(rx));
    let worker = fx.only_worker().await;
    fx.wait_current(worker, task.id).await;

    TaskController::new(fx.project.clone())
        .send_command(worker, WorkerCommand::Shutdown)
        .await
        .unwrap();

    let summary = timeout(Duration::from_secs(15), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.stopped, 0);
    assert_eq!(fx.state(task.id).await, TaskState::Success);
    let record = fx.project.workers.reload(worker).await.unwrap();
    assert_eq!(record.state, WorkerState::Shutdown);
}

#[tokio::test]
async fn test_background_child_does_not_hold_the_worker() {
    let fx = Fixture::new();
    let task = shell("sleep 20 &\necho done");
    fx.project.queue(&task).await.unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let summary = timeout(
        Duration::from_secs(10),
        fx.worker().exit_when_idle(true).build().run(rx),
    )
    .await
    .expect("background child blocked the worker")
    .unwrap();
    assert_eq!(summary.succeeded, 1);

    let logs = fx.project.task_logs(task.id).await.unwrap();
    let stdout = logs
        .iter()
        .find(|log| log.stream == LogStream::Stdout)
        .expect("stdout saved");
    assert_eq!(stdout.content, "done\n");
}

#[tokio::test]
async fn test_folder_output_keeps_hidden_files() {
    let fx = Fixture::new();
    let mut task = shell("mkdir frames; echo 1 > frames/0001.pdb; echo v2 > frames/.format");
    let target = task
        .put("frames/", &File::at("shared://run1/frames/").unwrap())
        .unwrap();
    fx.project.queue(&task).await.unwrap();

    let summary = run_until_idle(fx.worker()).await;
    assert_eq!(summary.succeeded, 1);

    let moved = fx.shared_path("run1/frames");
    assert_eq!(std::fs::read_to_string(moved.join("0001.pdb")).unwrap(), "1\n");
    assert_eq!(std::fs::read_to_string(moved.join(".format")).unwrap(), "v2\n");
    assert!(fx.project.file_at(&target.location).await.unwrap().unwrap().exists());
}
