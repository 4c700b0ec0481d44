//! 任务脚本生成
//!
//! 一个任务归约为三段：执行前、任务自身命令、执行后。shell 片段写进脚本，
//! 暂存指令单独列出，由执行方在脚本前后处理。

use std::collections::BTreeMap;
use std::sync::Arc;
use taskyard_core::models::{StagingStep, Task, TaskKind};
use taskyard_core::{ExecutionContext, SchedulerError, SchedulerResult, StagingConfig};
use tracing::debug;

use crate::call;
use crate::quoting::shell_quote;
use crate::reducer::{Fragment, ReducerPipeline};
use crate::rules::{RuleTable, StagingDirective};
use crate::substitution::DriveMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskScript {
    pub environment: BTreeMap<String, String>,
    pub paths: Vec<String>,
    pub pre: Vec<String>,
    pub main: String,
    pub post: Vec<String>,
    /// 执行前需要完成的暂存指令
    pub stage_in: Vec<StagingDirective>,
    /// 执行成功后需要完成的暂存指令
    pub stage_out: Vec<StagingDirective>,
}

impl TaskScript {
    pub fn render(&self) -> String {
        let mut lines = vec!["#!/bin/bash".to_string(), "set -e".to_string()];

        for (key, value) in &self.environment {
            lines.push(format!("export {key}={}", shell_quote(value)));
        }
        if !self.paths.is_empty() {
            let joined: Vec<String> = self.paths.iter().map(|p| shell_quote(p)).collect();
            lines.push(format!("export PATH={}:\"$PATH\"", joined.join(":")));
        }

        lines.extend(self.pre.iter().cloned());
        lines.push(self.main.clone());
        lines.extend(self.post.iter().cloned());

        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

pub struct ScriptBuilder {
    pipeline: ReducerPipeline,
    drives: DriveMap,
    interpreter: String,
}

impl ScriptBuilder {
    pub fn new(table: Arc<RuleTable>, drives: DriveMap) -> Self {
        Self {
            pipeline: ReducerPipeline::standard(table, drives.clone()),
            drives,
            interpreter: StagingConfig::default().call_interpreter,
        }
    }

    /// 按暂存配置选择规则表
    pub fn from_config(config: &StagingConfig, drives: DriveMap) -> Self {
        let table = match config.context {
            ExecutionContext::Shell => RuleTable::shell_defaults(),
            ExecutionContext::Remote => RuleTable::remote_staging(),
        };
        Self::new(Arc::new(table), drives).with_interpreter(&config.call_interpreter)
    }

    pub fn with_interpreter(mut self, interpreter: &str) -> Self {
        self.interpreter = interpreter.to_string();
        self
    }

    pub fn drives(&self) -> &DriveMap {
        &self.drives
    }

    pub fn build(&self, task: &Task) -> SchedulerResult<TaskScript> {
        let (pre, stage_in) = self.reduce(task.pre_steps())?;
        let (post, stage_out) = self.reduce(task.post_steps())?;

        let main = match &task.kind {
            TaskKind::Call(_) => call::main_command(&self.interpreter),
            TaskKind::Shell => {
                if task.executable.trim().is_empty() {
                    return Err(SchedulerError::InvalidAction(format!(
                        "任务 {} 没有可执行程序",
                        task.id
                    )));
                }
                let mut words = vec![shell_quote(&task.executable)];
                words.extend(task.arguments.iter().map(|a| shell_quote(a)));
                self.drives.substitute(&words.join(" "))
            }
        };

        let environment = task
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), self.drives.substitute(v)))
            .collect();
        let paths = task
            .add_paths
            .iter()
            .map(|p| self.drives.substitute(p))
            .collect();

        debug!(
            "任务 {} 脚本: 执行前 {} 条, 执行后 {} 条, 暂存指令 {}/{}",
            task.id,
            pre.len(),
            post.len(),
            stage_in.len(),
            stage_out.len()
        );

        Ok(TaskScript {
            environment,
            paths,
            pre,
            main,
            post,
            stage_in,
            stage_out,
        })
    }

    fn reduce<'a>(
        &self,
        steps: impl Iterator<Item = &'a StagingStep>,
    ) -> SchedulerResult<(Vec<String>, Vec<StagingDirective>)> {
        let mut commands = Vec::new();
        let mut directives = Vec::new();
        for fragment in self.pipeline.run_steps(steps)? {
            match fragment {
                Fragment::Shell(command) => commands.push(command),
                Fragment::Directive(directive) => directives.push(directive),
                Fragment::Action(action) => {
                    return Err(SchedulerError::NoStagingRule(format!("未翻译的操作: {action}")))
                }
            }
        }
        Ok((commands, directives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskyard_core::models::{CallSpec, Drive, File, FileAction};

    fn builder() -> ScriptBuilder {
        let drives = DriveMap::new().with_root(Drive::Staging, "/data/staging");
        ScriptBuilder::new(Arc::new(RuleTable::shell_defaults()), drives)
    }

    fn file(raw: &str) -> File {
        File::at(raw).unwrap()
    }

    #[test]
    fn test_render_shell_task() {
        let mut task = Task::new("simulate").with_arguments(["--steps", "100", "two words"]);
        task.get(&file("staging://in.pdb"), None).unwrap();
        task.put("out.dcd", &file("staging://runs/")).unwrap();
        task.setenv("OMP_NUM_THREADS", "4");
        task.add_path("staging://bin");
        task.append("echo done");

        let script = builder().build(&task).unwrap().render();
        assert_eq!(
            script,
            "#!/bin/bash\n\
             set -e\n\
             export OMP_NUM_THREADS=4\n\
             export PATH=/data/staging/bin:\"$PATH\"\n\
             ln -s /data/staging/in.pdb in.pdb\n\
             simulate --steps 100 'two words'\n\
             mv out.dcd /data/staging/runs/out.dcd\n\
             echo done\n"
        );
    }

    #[test]
    fn test_generator_steps_wrap_user_steps() {
        let mut task = Task::new("run");
        task.generator_stage_in(StagingStep::Shell("gen-pre".into()));
        task.prepend("user-pre");
        task.append("user-post");
        task.generator_stage_out(StagingStep::Shell("gen-post".into()));

        let script = builder().build(&task).unwrap();
        assert_eq!(script.pre, vec!["gen-pre", "user-pre"]);
        assert_eq!(script.post, vec!["user-post", "gen-post"]);
    }

    #[test]
    fn test_controller_transfers_become_directives() {
        let mut task = Task::new("run");
        task.get(&file("file:///home/me/in.pdb"), None).unwrap();
        task.put("out.dcd", &file("file:///home/me/out.dcd")).unwrap();

        let script = builder().build(&task).unwrap();
        assert!(script.pre.is_empty());
        assert_eq!(script.stage_in.len(), 1);
        assert_eq!(script.stage_in[0].source, "/home/me/in.pdb");
        assert_eq!(script.stage_in[0].target, "in.pdb");
        assert_eq!(script.stage_out[0].source, "out.dcd");
    }

    #[test]
    fn test_call_task_uses_bootstrap() {
        let task = Task::call(CallSpec::new("pkg.mod.fn"));
        let script = builder().with_interpreter("/opt/py/bin/python").build(&task).unwrap();
        assert_eq!(script.main, "/opt/py/bin/python _bootstrap.py");
    }

    #[test]
    fn test_missing_executable_is_rejected() {
        let task = Task::new("  ");
        assert!(builder().build(&task).is_err());
    }

    #[test]
    fn test_illegal_staging_fails_the_build() {
        let mut task = Task::new("run");
        task.stage_in(FileAction::remove(&file("file:///tmp/x")));
        assert!(matches!(
            builder().build(&task),
            Err(SchedulerError::IllegalStaging(_))
        ));
    }
}
