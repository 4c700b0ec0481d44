//! 归约流水线
//!
//! 每个阶段接收一个片段，返回零个或多个片段，阶段按添加顺序从左到右组合。

use std::fmt;
use std::sync::Arc;
use taskyard_core::models::{FileAction, StagingStep};
use taskyard_core::SchedulerResult;
use tracing::trace;

use crate::rules::{RuleTable, StagingDirective, Translation};
use crate::substitution::DriveMap;

/// 流水线中流动的片段
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Shell(String),
    Action(FileAction),
    Directive(StagingDirective),
}

impl Fragment {
    pub fn is_shell(&self) -> bool {
        matches!(self, Fragment::Shell(_))
    }

    pub fn is_directive(&self) -> bool {
        matches!(self, Fragment::Directive(_))
    }
}

impl From<&StagingStep> for Fragment {
    fn from(step: &StagingStep) -> Self {
        match step {
            StagingStep::Shell(command) => Fragment::Shell(command.clone()),
            StagingStep::Action(action) => Fragment::Action(action.clone()),
        }
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Shell(command) => f.write_str(command),
            Fragment::Action(action) => write!(f, "{action}"),
            Fragment::Directive(d) => write!(f, "{:?} {} -> {}", d.verb, d.source, d.target),
        }
    }
}

pub trait Reducer: Send + Sync {
    fn name(&self) -> &str;

    fn reduce(&self, fragment: Fragment) -> SchedulerResult<Vec<Fragment>>;
}

/// 用规则表翻译文件操作，其他片段原样通过
pub struct RuleReducer {
    table: Arc<RuleTable>,
}

impl RuleReducer {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self { table }
    }
}

impl Reducer for RuleReducer {
    fn name(&self) -> &str {
        "rules"
    }

    fn reduce(&self, fragment: Fragment) -> SchedulerResult<Vec<Fragment>> {
        let Fragment::Action(action) = fragment else {
            return Ok(vec![fragment]);
        };
        match self.table.translate(&action)? {
            Translation::Commands(commands) => {
                Ok(commands.into_iter().map(Fragment::Shell).collect())
            }
            Translation::Directive(directive) => Ok(vec![Fragment::Directive(directive)]),
        }
    }
}

/// 把驱动器前缀替换成当前执行环境下的实际路径
pub struct SubstitutionReducer {
    drives: DriveMap,
}

impl SubstitutionReducer {
    pub fn new(drives: DriveMap) -> Self {
        Self { drives }
    }
}

impl Reducer for SubstitutionReducer {
    fn name(&self) -> &str {
        "substitute"
    }

    fn reduce(&self, fragment: Fragment) -> SchedulerResult<Vec<Fragment>> {
        let fragment = match fragment {
            Fragment::Shell(command) => Fragment::Shell(self.drives.substitute(&command)),
            Fragment::Directive(directive) => Fragment::Directive(StagingDirective {
                verb: directive.verb,
                source: self.drives.substitute(&directive.source),
                target: self.drives.substitute(&directive.target),
            }),
            other => other,
        };
        Ok(vec![fragment])
    }
}

/// 只保留满足条件的片段
pub struct FilterReducer {
    name: String,
    keep: Box<dyn Fn(&Fragment) -> bool + Send + Sync>,
}

impl FilterReducer {
    pub fn new(name: &str, keep: impl Fn(&Fragment) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            keep: Box::new(keep),
        }
    }

    pub fn shell_only() -> Self {
        Self::new("shell_only", Fragment::is_shell)
    }

    pub fn directives_only() -> Self {
        Self::new("directives_only", Fragment::is_directive)
    }
}

impl Reducer for FilterReducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn reduce(&self, fragment: Fragment) -> SchedulerResult<Vec<Fragment>> {
        if (self.keep)(&fragment) {
            Ok(vec![fragment])
        } else {
            Ok(Vec::new())
        }
    }
}

#[derive(Default)]
pub struct ReducerPipeline {
    stages: Vec<Box<dyn Reducer>>,
}

impl ReducerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 规则翻译后做路径替换
    pub fn standard(table: Arc<RuleTable>, drives: DriveMap) -> Self {
        Self::new()
            .then(RuleReducer::new(table))
            .then(SubstitutionReducer::new(drives))
    }

    pub fn then(mut self, stage: impl Reducer + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn run<I>(&self, fragments: I) -> SchedulerResult<Vec<Fragment>>
    where
        I: IntoIterator<Item = Fragment>,
    {
        let mut current: Vec<Fragment> = fragments.into_iter().collect();
        for stage in &self.stages {
            let mut next = Vec::with_capacity(current.len());
            for fragment in current {
                next.extend(stage.reduce(fragment)?);
            }
            trace!("归约阶段 {} 输出 {} 个片段", stage.name(), next.len());
            current = next;
        }
        Ok(current)
    }

    pub fn run_steps<'a, I>(&self, steps: I) -> SchedulerResult<Vec<Fragment>>
    where
        I: IntoIterator<Item = &'a StagingStep>,
    {
        self.run(steps.into_iter().map(Fragment::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::DirectiveVerb;
    use taskyard_core::models::{Drive, File};
    use taskyard_core::SchedulerError;

    fn file(raw: &str) -> File {
        File::at(raw).unwrap()
    }

    fn pipeline() -> ReducerPipeline {
        let drives = DriveMap::new().with_root(Drive::Staging, "/data/staging");
        ReducerPipeline::standard(Arc::new(RuleTable::shell_defaults()), drives)
    }

    #[test]
    fn test_standard_pipeline_renders_concrete_commands() {
        let steps = vec![
            StagingStep::Shell("echo start".into()),
            FileAction::copy(&file("staging://in.pdb"), &file("worker://in.pdb"))
                .unwrap()
                .into(),
        ];
        let out = pipeline().run_steps(&steps).unwrap();
        assert_eq!(
            out,
            vec![
                Fragment::Shell("echo start".into()),
                Fragment::Shell("cp /data/staging/in.pdb in.pdb".into()),
            ]
        );
    }

    #[test]
    fn test_directives_are_substituted_and_can_be_split() {
        let step: StagingStep =
            FileAction::transfer(&file("file:///home/me/in.pdb"), &file("staging://in.pdb"))
                .unwrap()
                .into();
        let out = pipeline().run_steps([&step]).unwrap();
        assert_eq!(
            out,
            vec![Fragment::Directive(StagingDirective {
                verb: DirectiveVerb::Transfer,
                source: "/home/me/in.pdb".into(),
                target: "/data/staging/in.pdb".into(),
            })]
        );

        let shell = pipeline().then(FilterReducer::shell_only()).run_steps([&step]).unwrap();
        assert!(shell.is_empty());
    }

    #[test]
    fn test_illegal_action_aborts_the_run() {
        let step: StagingStep = FileAction::link(&file("file:///etc/hosts"), &file("worker://hosts"))
            .unwrap()
            .into();
        assert!(matches!(
            pipeline().run_steps([&step]),
            Err(SchedulerError::IllegalStaging(_))
        ));
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let out = ReducerPipeline::new()
            .run(vec![Fragment::Shell("true".into())])
            .unwrap();
        assert_eq!(out, vec![Fragment::Shell("true".into())]);
    }
}
