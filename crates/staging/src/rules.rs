//! 文件操作到执行形式的规则表
//!
//! 规则按 (操作类型, 源驱动器, 目标驱动器, 是否目录) 查找，结果三选一：
//! 一组 shell 命令、一条交给外部传输系统的暂存指令、或者非法。
//! 表中没有的组合同样是错误，不会被静默忽略。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use taskyard_core::models::{ActionKind, Drive, FileAction};
use taskyard_core::{SchedulerError, SchedulerResult};

use crate::quoting::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub kind: ActionKind,
    pub source: Drive,
    pub target: Option<Drive>,
    pub folder: bool,
}

impl RuleKey {
    pub fn of(action: &FileAction) -> Self {
        Self {
            kind: action.kind(),
            source: action.source().drive(),
            target: action.target().map(|t| t.drive()),
            folder: action.is_folder(),
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = if self.folder { "目录" } else { "文件" };
        match self.target {
            Some(target) => write!(f, "{} {}:// -> {}:// ({shape})", self.kind, self.source, target),
            None => write!(f, "{} {}:// ({shape})", self.kind, self.source),
        }
    }
}

/// shell 命令模板
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellTemplate {
    Copy,
    CopyTree,
    Move,
    MoveTree,
    /// 跨驱动器移动目录：建目录、移动内容、删除原目录
    MoveContents,
    Link,
    LinkTree,
    Remove,
    RemoveTree,
    Touch,
    MakeDir,
}

impl ShellTemplate {
    pub fn render(&self, source: &str, target: Option<&str>) -> Vec<String> {
        let s = shell_quote(source);
        let bare = |path: &str| shell_quote(path.trim_end_matches('/'));
        let t = target.map(shell_quote).unwrap_or_default();
        let t_bare = target.map(bare).unwrap_or_default();

        match self {
            ShellTemplate::Copy => vec![format!("cp {s} {t}")],
            ShellTemplate::CopyTree => vec![
                format!("mkdir -p {t}"),
                format!("cp -r {}. {t}", shell_quote(source)),
            ],
            ShellTemplate::Move => vec![format!("mv {s} {t}")],
            ShellTemplate::MoveTree => vec![format!("mv {} {t_bare}", bare(source))],
            ShellTemplate::MoveContents => vec![
                format!("mkdir -p {t}"),
                format!("find {s} -mindepth 1 -maxdepth 1 -exec mv -t {t} {{}} +"),
                format!("rmdir {s}"),
            ],
            ShellTemplate::Link => vec![format!("ln -s {s} {t}")],
            ShellTemplate::LinkTree => vec![format!("ln -s {} {t_bare}", bare(source))],
            ShellTemplate::Remove => vec![format!("rm {s}")],
            ShellTemplate::RemoveTree => vec![format!("rm -r {s}")],
            ShellTemplate::Touch => vec![format!("touch {s}")],
            ShellTemplate::MakeDir => vec![format!("mkdir -p {s}")],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveVerb {
    Copy,
    Move,
    Link,
    Transfer,
}

/// 交给外部传输系统的暂存指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingDirective {
    pub verb: DirectiveVerb,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Shell(ShellTemplate),
    Directive(DirectiveVerb),
    Illegal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    Commands(Vec<String>),
    Directive(StagingDirective),
}

#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: HashMap<RuleKey, Rule>,
}

impl RuleTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: RuleKey, rule: Rule) -> Option<Rule> {
        self.rules.insert(key, rule)
    }

    pub fn with(mut self, key: RuleKey, rule: Rule) -> Self {
        self.rules.insert(key, rule);
        self
    }

    pub fn remove(&mut self, key: &RuleKey) -> Option<Rule> {
        self.rules.remove(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RuleKey, &Rule)> {
        self.rules.iter()
    }

    /// Worker 本地 shell 执行：受管驱动器之间用 shell 命令，
    /// 涉及控制端 `file://` 的传输变成暂存指令，其余涉及 `file://` 的操作非法
    pub fn shell_defaults() -> Self {
        let mut table = Self::empty();

        for kind in ActionKind::ALL.into_iter().filter(ActionKind::is_transaction) {
            for source in Drive::ALL {
                for target in Drive::ALL {
                    for folder in [false, true] {
                        let rule = if source.is_managed() && target.is_managed() {
                            Rule::Shell(transaction_template(kind, source, target, folder))
                        } else if kind == ActionKind::Transfer {
                            Rule::Directive(DirectiveVerb::Transfer)
                        } else {
                            Rule::Illegal
                        };
                        table.insert(
                            RuleKey {
                                kind,
                                source,
                                target: Some(target),
                                folder,
                            },
                            rule,
                        );
                    }
                }
            }
        }

        table.insert_single_file_rules();
        table
    }

    /// 远端暂存：所有文件传递都变成暂存指令，单文件操作仍用 shell 命令
    pub fn remote_staging() -> Self {
        let mut table = Self::empty();

        for kind in ActionKind::ALL.into_iter().filter(ActionKind::is_transaction) {
            for source in Drive::ALL {
                for target in Drive::ALL {
                    for folder in [false, true] {
                        let involves_controller = !source.is_managed() || !target.is_managed();
                        let rule = match kind {
                            ActionKind::Link if involves_controller => Rule::Illegal,
                            ActionKind::Copy => Rule::Directive(DirectiveVerb::Copy),
                            ActionKind::Move => Rule::Directive(DirectiveVerb::Move),
                            ActionKind::Link => Rule::Directive(DirectiveVerb::Link),
                            _ => Rule::Directive(DirectiveVerb::Transfer),
                        };
                        table.insert(
                            RuleKey {
                                kind,
                                source,
                                target: Some(target),
                                folder,
                            },
                            rule,
                        );
                    }
                }
            }
        }

        table.insert_single_file_rules();
        table
    }

    fn insert_single_file_rules(&mut self) {
        for source in Drive::ALL {
            for folder in [false, true] {
                let managed = source.is_managed();
                let rules = [
                    (
                        ActionKind::Remove,
                        match (managed, folder) {
                            (false, _) => Rule::Illegal,
                            (true, false) => Rule::Shell(ShellTemplate::Remove),
                            (true, true) => Rule::Shell(ShellTemplate::RemoveTree),
                        },
                    ),
                    (
                        ActionKind::Touch,
                        if managed && !folder {
                            Rule::Shell(ShellTemplate::Touch)
                        } else {
                            Rule::Illegal
                        },
                    ),
                    (
                        ActionKind::MakeDir,
                        if managed {
                            Rule::Shell(ShellTemplate::MakeDir)
                        } else {
                            Rule::Illegal
                        },
                    ),
                ];
                for (kind, rule) in rules {
                    self.insert(
                        RuleKey {
                            kind,
                            source,
                            target: None,
                            folder,
                        },
                        rule,
                    );
                }
            }
        }
    }

    pub fn lookup(&self, key: &RuleKey) -> SchedulerResult<Rule> {
        self.rules
            .get(key)
            .copied()
            .ok_or_else(|| SchedulerError::NoStagingRule(key.to_string()))
    }

    /// 把文件操作翻译成 shell 命令或暂存指令，路径保留 `drive://` 形式
    pub fn translate(&self, action: &FileAction) -> SchedulerResult<Translation> {
        let key = RuleKey::of(action);
        let source = action.source().location.render();
        let target = action.target().map(|t| t.location.render());

        match self.lookup(&key)? {
            Rule::Shell(template) => Ok(Translation::Commands(
                template.render(&source, target.as_deref()),
            )),
            Rule::Directive(verb) => Ok(Translation::Directive(StagingDirective {
                verb,
                source,
                target: target.ok_or_else(|| {
                    SchedulerError::IllegalStaging(format!("暂存指令缺少目标: {action}"))
                })?,
            })),
            Rule::Illegal => Err(SchedulerError::IllegalStaging(format!(
                "{key} 不允许: {action}"
            ))),
        }
    }
}

fn transaction_template(kind: ActionKind, source: Drive, target: Drive, folder: bool) -> ShellTemplate {
    match (kind, folder) {
        (ActionKind::Copy | ActionKind::Transfer, false) => ShellTemplate::Copy,
        (ActionKind::Copy | ActionKind::Transfer, true) => ShellTemplate::CopyTree,
        (ActionKind::Move, false) => ShellTemplate::Move,
        (ActionKind::Move, true) if source == target => ShellTemplate::MoveTree,
        (ActionKind::Move, true) => ShellTemplate::MoveContents,
        (ActionKind::Link, false) => ShellTemplate::Link,
        (ActionKind::Link, true) => ShellTemplate::LinkTree,
        // 单文件操作不经过这里
        (_, false) => ShellTemplate::Touch,
        (_, true) => ShellTemplate::MakeDir,
    }
}
