use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::id::ObjectId;
use crate::models::action::{FileAction, StagingStep};
use crate::models::file::File;
use crate::models::location::{Drive, Location};
use crate::traits::{IndexFields, IndexValue, StoreObject};

/// 任务状态
///
/// ```text
/// created → queued → running → success | fail
///    │         │         │
///    └─────────┴─────────┴──→ cancelled | halted
/// fail | halted ──restart──→ created
/// queued | running ──release / requeue──→ created
/// ```
///
/// `dummy` 是不可执行的占位任务，没有任何合法转换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Success,
    Fail,
    Cancelled,
    Halted,
    Dummy,
}

/// 允许 `restart()` 的状态
pub const RESTARTABLE_STATES: [TaskState; 2] = [TaskState::Fail, TaskState::Halted];

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Fail => "fail",
            TaskState::Cancelled => "cancelled",
            TaskState::Halted => "halted",
            TaskState::Dummy => "dummy",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Fail | TaskState::Cancelled | TaskState::Halted
        )
    }

    /// 已被某个 Worker 领取
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }

    pub fn is_restartable(&self) -> bool {
        RESTARTABLE_STATES.contains(self)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (*self, next) {
            (Created, Queued) => true,
            (Queued, Running) | (Queued, Created) | (Queued, Fail) => true,
            (Running, Success) | (Running, Fail) | (Running, Created) => true,
            (Created | Queued | Running, Cancelled | Halted) => true,
            (from, Created) if from.is_restartable() => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskState::Created),
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "success" => Ok(TaskState::Success),
            "fail" => Ok(TaskState::Fail),
            "cancelled" => Ok(TaskState::Cancelled),
            "halted" => Ok(TaskState::Halted),
            "dummy" => Ok(TaskState::Dummy),
            other => Err(SchedulerError::Serialization(format!("未知的任务状态: {other}"))),
        }
    }
}

impl From<TaskState> for IndexValue {
    fn from(value: TaskState) -> Self {
        IndexValue::Text(value.as_str().to_string())
    }
}

/// 依赖是否全部满足：所有依赖都已成功
pub fn dependency_okay(states: &[TaskState]) -> bool {
    states.iter().all(|state| *state == TaskState::Success)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u32,
    pub gpus: u32,
    pub mpi: bool,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: 1,
            gpus: 0,
            mpi: false,
        }
    }
}

/// 调用参数中对存储对象的引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub store: String,
    pub identifier: ObjectId,
}

/// 远端函数调用描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    /// `module.function` 形式的可调用对象
    pub function: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl CallSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// 以 `{store, identifier}` 形式传入存储对象
    pub fn object_arg(mut self, store: &str, identifier: ObjectId) -> Self {
        self.args.push(serde_json::json!(ObjectRef {
            store: store.to_string(),
            identifier,
        }));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Shell,
    Call(CallSpec),
}

/// 执行前或执行后的暂存步骤，分为生成器部分和用户部分。
///
/// 执行前：先生成器后用户；执行后：先用户后生成器。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub generator: Vec<StagingStep>,
    pub user: Vec<StagingStep>,
}

impl StagePlan {
    pub fn is_empty(&self) -> bool {
        self.generator.is_empty() && self.user.is_empty()
    }
}

/// 一个可调度的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: ObjectId,
    pub kind: TaskKind,
    pub state: TaskState,
    /// 生成器名称，用于 Worker 亲和性
    pub generator: Option<String>,
    pub worker: Option<ObjectId>,
    pub executable: String,
    pub arguments: Vec<String>,
    pub pre: StagePlan,
    pub post: StagePlan,
    pub environment: BTreeMap<String, String>,
    pub add_paths: Vec<String>,
    pub dependencies: Vec<ObjectId>,
    pub resources: Resources,
    pub restartable: bool,
    pub max_attempts: Option<u32>,
    pub attempts: u32,
    /// 最近一次执行使用的完整脚本
    pub script: Option<String>,
    pub stdout: Option<ObjectId>,
    pub stderr: Option<ObjectId>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(executable: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectId::generate(),
            kind: TaskKind::Shell,
            state: TaskState::Created,
            generator: None,
            worker: None,
            executable: executable.into(),
            arguments: Vec::new(),
            pre: StagePlan::default(),
            post: StagePlan::default(),
            environment: BTreeMap::new(),
            add_paths: Vec::new(),
            dependencies: Vec::new(),
            resources: Resources::default(),
            restartable: false,
            max_attempts: None,
            attempts: 0,
            script: None,
            stdout: None,
            stderr: None,
            return_value: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 远端函数调用任务，解释器在生成脚本时决定
    pub fn call(call_spec: CallSpec) -> Self {
        let mut task = Task::new("");
        task.kind = TaskKind::Call(call_spec);
        task
    }

    /// 占位任务，永远不会被领取
    pub fn dummy() -> Self {
        let mut task = Task::new("");
        task.state = TaskState::Dummy;
        task
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = Some(generator.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, TaskKind::Call(_))
    }

    /// 添加依赖。只能依赖比自己更早创建的任务，因此依赖图不会成环。
    pub fn add_dependency(&mut self, dependency: &Task) -> SchedulerResult<()> {
        if dependency.id >= self.id {
            return Err(SchedulerError::InvalidDependency(format!(
                "任务 {} 只能依赖更早创建的任务，{} 不满足",
                self.id, dependency.id
            )));
        }
        if !self.dependencies.contains(&dependency.id) {
            self.dependencies.push(dependency.id);
        }
        Ok(())
    }

    pub fn prepend(&mut self, command: impl Into<String>) -> &mut Self {
        self.pre.user.push(StagingStep::Shell(command.into()));
        self
    }

    pub fn append(&mut self, command: impl Into<String>) -> &mut Self {
        self.post.user.push(StagingStep::Shell(command.into()));
        self
    }

    pub fn stage_in(&mut self, action: FileAction) -> &mut Self {
        self.pre.user.push(action.into());
        self
    }

    pub fn stage_out(&mut self, action: FileAction) -> &mut Self {
        self.post.user.push(action.into());
        self
    }

    pub fn generator_stage_in(&mut self, step: StagingStep) -> &mut Self {
        self.pre.generator.push(step);
        self
    }

    pub fn generator_stage_out(&mut self, step: StagingStep) -> &mut Self {
        self.post.generator.push(step);
        self
    }

    /// 把输入文件放进工作目录，返回工作目录中的文件。
    /// 控制端文件走传输，其他驱动器建立符号链接。
    pub fn get(&mut self, file: &File, name: Option<&str>) -> SchedulerResult<File> {
        let name = match name {
            Some(name) => name,
            None => file
                .location
                .path()
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default(),
        };
        let target = if file.is_folder() {
            File::new(Location::new(Drive::Worker, name)?.as_folder())
        } else {
            File::new(Location::new(Drive::Worker, name)?)
        };
        let action = if file.drive() == Drive::File {
            FileAction::transfer(file, &target)?
        } else {
            FileAction::link(file, &target)?
        };
        let local = action.target().cloned().unwrap_or(target);
        self.stage_in(action);
        Ok(local)
    }

    /// 执行后把工作目录中的文件移动到目标位置，返回最终文件
    pub fn put(&mut self, worker_path: &str, target: &File) -> SchedulerResult<File> {
        let source = File::new(Location::new(Drive::Worker, worker_path)?);
        let action = if target.drive() == Drive::File {
            FileAction::transfer(&source, target)?
        } else {
            FileAction::move_to(&source, target)?
        };
        let output = action
            .target()
            .cloned()
            .ok_or_else(|| SchedulerError::Internal("传输操作缺少目标".to_string()))?
            .with_generator(self.id);
        self.stage_out(action);
        Ok(output)
    }

    pub fn touch(&mut self, file: &File) -> SchedulerResult<&mut Self> {
        let action = FileAction::touch(file)?;
        Ok(self.stage_in(action))
    }

    pub fn mkdir(&mut self, folder: &File) -> &mut Self {
        self.stage_in(FileAction::make_dir(folder))
    }

    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn add_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.add_paths.push(path.into());
        self
    }

    /// 执行前步骤，按执行顺序
    pub fn pre_steps(&self) -> impl Iterator<Item = &StagingStep> {
        self.pre.generator.iter().chain(self.pre.user.iter())
    }

    /// 执行后步骤，按执行顺序
    pub fn post_steps(&self) -> impl Iterator<Item = &StagingStep> {
        self.post.user.iter().chain(self.post.generator.iter())
    }

    pub fn actions(&self) -> impl Iterator<Item = &FileAction> {
        self.pre_steps()
            .chain(self.post_steps())
            .filter_map(StagingStep::as_action)
    }

    /// 执行前必须已经存在、且不由本任务自己产生的文件（不含工作目录中的文件）
    pub fn sources(&self) -> Vec<File> {
        self.fold_actions()
            .0
            .into_iter()
            .filter(|file| file.drive() != Drive::Worker)
            .collect()
    }

    /// 本任务最终留下的文件（不含工作目录中的临时文件）
    pub fn targets(&self) -> Vec<File> {
        self.fold_actions()
            .1
            .into_iter()
            .filter(|file| file.drive() != Drive::Worker)
            .collect()
    }

    fn fold_actions(&self) -> (Vec<File>, Vec<File>) {
        let mut sources: Vec<File> = Vec::new();
        let mut produced: Vec<File> = Vec::new();

        for action in self.actions() {
            for file in action.required() {
                let known = produced.iter().any(|f| f.location == file.location)
                    || sources.iter().any(|f| f.location == file.location);
                if !known {
                    sources.push(file.clone());
                }
            }
            for file in action.removed() {
                produced.retain(|f| f.location != file.location);
            }
            for file in action.added() {
                produced.retain(|f| f.location != file.location);
                produced.push(file.clone());
            }
        }

        (sources, produced)
    }

    /// 校验并执行状态转换
    pub fn transition(&mut self, next: TaskState) -> SchedulerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 从失败或中止状态重新回到 created
    pub fn restart(&mut self) -> SchedulerResult<()> {
        if !self.state.is_restartable() {
            return Err(SchedulerError::InvalidTransition {
                from: self.state,
                to: TaskState::Created,
            });
        }
        self.transition(TaskState::Created)?;
        self.worker = None;
        Ok(())
    }

    pub fn cancel(&mut self) -> SchedulerResult<()> {
        self.transition(TaskState::Cancelled)
    }

    pub fn halt(&mut self) -> SchedulerResult<()> {
        self.transition(TaskState::Halted)
    }

    /// 是否还允许自动重启
    pub fn may_auto_restart(&self) -> bool {
        self.restartable && self.max_attempts.map_or(true, |max| self.attempts < max)
    }
}

impl StoreObject for Task {
    const CONTENT_TYPE: &'static str = "task";

    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> String {
        match self.kind {
            TaskKind::Shell => Self::CONTENT_TYPE.to_string(),
            TaskKind::Call(_) => format!("{}.call", Self::CONTENT_TYPE),
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn index_fields(&self) -> IndexFields {
        let mut index = IndexFields::new();
        index.insert("state".into(), self.state.into());
        index.insert("generator".into(), IndexValue::from(self.generator.clone()));
        index.insert("worker".into(), IndexValue::from(self.worker));
        index.insert("restartable".into(), self.restartable.into());
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(raw: &str) -> File {
        File::at(raw).unwrap()
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = Task::new("echo");
        task.transition(TaskState::Queued).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Success).unwrap();
        assert!(task.transition(TaskState::Created).is_err());
        assert!(task.cancel().is_err());
    }

    #[test]
    fn test_restart_only_from_restartable_states() {
        let mut task = Task::new("false");
        assert!(task.restart().is_err());

        task.transition(TaskState::Queued).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Fail).unwrap();
        task.worker = Some(ObjectId::from_raw(3));
        task.restart().unwrap();
        assert_eq!(task.state, TaskState::Created);
        assert_eq!(task.worker, None);

        task.halt().unwrap();
        task.restart().unwrap();

        task.cancel().unwrap();
        assert!(task.restart().is_err());
    }

    #[test]
    fn test_dummy_has_no_transitions() {
        let mut task = Task::dummy();
        for next in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::Created,
            TaskState::Cancelled,
        ] {
            assert!(task.transition(next).is_err());
        }
    }

    #[test]
    fn test_skip_running_is_invalid() {
        let mut task = Task::new("echo");
        assert!(task.transition(TaskState::Running).is_err());
        assert!(task.transition(TaskState::Success).is_err());
    }

    #[test]
    fn test_dependency_must_be_older() {
        let older = Task::new("a");
        let mut newer = Task::new("b");
        newer.add_dependency(&older).unwrap();
        newer.add_dependency(&older).unwrap();
        assert_eq!(newer.dependencies, vec![older.id]);

        let mut older = older;
        assert!(older.add_dependency(&newer).is_err());
        let clone = older.clone();
        assert!(older.add_dependency(&clone).is_err());
    }

    #[test]
    fn test_dependency_okay() {
        assert!(dependency_okay(&[]));
        assert!(dependency_okay(&[TaskState::Success, TaskState::Success]));
        assert!(!dependency_okay(&[TaskState::Success, TaskState::Running]));
        assert!(!dependency_okay(&[TaskState::Fail]));
    }

    #[test]
    fn test_sources_and_targets_fold() {
        let mut task = Task::new("simulate").with_arguments(["input.pdb"]);
        let input = file("staging://input.pdb");
        task.get(&input, None).unwrap();
        task.touch(&file("worker://scratch.log")).unwrap();
        let output = task.put("traj.dcd", &file("staging://runs/")).unwrap();
        task.append("rm scratch.log");

        let sources = task.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].location, input.location);

        let targets = task.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].location.render(), "staging://runs/traj.dcd");
        assert_eq!(output.location, targets[0].location);
        assert_eq!(output.generator, Some(task.id));
    }

    #[test]
    fn test_generator_steps_wrap_user_steps() {
        let mut task = Task::new("run");
        task.prepend("user-pre");
        task.generator_stage_in(StagingStep::Shell("gen-pre".into()));
        task.append("user-post");
        task.generator_stage_out(StagingStep::Shell("gen-post".into()));

        let pre: Vec<_> = task.pre_steps().cloned().collect();
        let post: Vec<_> = task.post_steps().cloned().collect();
        assert_eq!(
            pre,
            vec![StagingStep::Shell("gen-pre".into()), StagingStep::Shell("user-pre".into())]
        );
        assert_eq!(
            post,
            vec![StagingStep::Shell("user-post".into()), StagingStep::Shell("gen-post".into())]
        );
    }

    #[test]
    fn test_get_from_controller_uses_transfer() {
        let mut task = Task::new("run");
        let local = task.get(&file("file:///home/me/in.pdb"), Some("in.pdb")).unwrap();
        assert_eq!(local.location.render(), "worker://in.pdb");
        assert_eq!(
            task.actions().next().map(|a| a.kind()),
            Some(crate::models::action::ActionKind::Transfer)
        );
    }

    #[test]
    fn test_get_folder_keeps_its_name() {
        let mut task = Task::new("run");
        let local = task.get(&file("staging://runs/frames/"), None).unwrap();
        assert_eq!(local.location.render(), "worker://frames/");
    }

    #[test]
    fn test_empty_worker_path_rejected() {
        let mut task = Task::new("run");
        assert!(task.get(&file("staging://runs/in.pdb"), Some("")).is_err());
        assert!(task.put("", &file("staging://out.txt")).is_err());
        assert_eq!(task.actions().count(), 0);
    }

    #[test]
    fn test_auto_restart_budget() {
        let mut task = Task::new("x").restartable(true).with_max_attempts(2);
        task.attempts = 1;
        assert!(task.may_auto_restart());
        task.attempts = 2;
        assert!(!task.may_auto_restart());
        assert!(!Task::new("y").may_auto_restart());
    }

    #[test]
    fn test_store_kind_and_index() {
        let call = Task::call(CallSpec::new("pkg.mod.fn").arg(1).object_arg("p.files", ObjectId::from_raw(9)));
        assert_eq!(call.kind(), "task.call");
        assert_eq!(Task::new("x").kind(), "task");

        let task = Task::new("x").with_generator("openmm");
        let json = serde_json::to_value(&task).unwrap();
        for (key, value) in task.index_fields() {
            assert_eq!(json[&key], value.to_json(), "索引字段 {key} 与对象字段不一致");
        }
    }
}
