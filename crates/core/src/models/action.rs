use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::file::File;
use crate::models::location::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Copy,
    Move,
    Link,
    Transfer,
    Remove,
    Touch,
    MakeDir,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Copy,
        ActionKind::Move,
        ActionKind::Link,
        ActionKind::Transfer,
        ActionKind::Remove,
        ActionKind::Touch,
        ActionKind::MakeDir,
    ];

    /// 是否同时有源和目标
    pub fn is_transaction(&self) -> bool {
        matches!(
            self,
            ActionKind::Copy | ActionKind::Move | ActionKind::Link | ActionKind::Transfer
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Copy => "copy",
            ActionKind::Move => "move",
            ActionKind::Link => "link",
            ActionKind::Transfer => "transfer",
            ActionKind::Remove => "remove",
            ActionKind::Touch => "touch",
            ActionKind::MakeDir => "make_dir",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文件操作
///
/// 每个操作声明三组文件：执行前必须存在的（required）、
/// 执行后新出现的（added）、执行后不再存在的（removed）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    Copy { source: File, target: File },
    Move { source: File, target: File },
    Link { source: File, target: File },
    Transfer { source: File, target: File },
    Remove { source: File },
    Touch { source: File },
    MakeDir { source: File },
}

impl FileAction {
    pub fn copy(source: &File, target: &File) -> SchedulerResult<Self> {
        let (source, target) = resolve_pair(source, target)?;
        Ok(FileAction::Copy { source, target })
    }

    pub fn move_to(source: &File, target: &File) -> SchedulerResult<Self> {
        let (source, target) = resolve_pair(source, target)?;
        Ok(FileAction::Move { source, target })
    }

    pub fn link(source: &File, target: &File) -> SchedulerResult<Self> {
        let (source, target) = resolve_pair(source, target)?;
        Ok(FileAction::Link { source, target })
    }

    pub fn transfer(source: &File, target: &File) -> SchedulerResult<Self> {
        let (source, target) = resolve_pair(source, target)?;
        Ok(FileAction::Transfer { source, target })
    }

    pub fn remove(source: &File) -> Self {
        FileAction::Remove {
            source: source.clone(),
        }
    }

    pub fn touch(source: &File) -> SchedulerResult<Self> {
        if source.is_folder() {
            return Err(SchedulerError::InvalidAction(format!(
                "不能 touch 目录: {}",
                source.location
            )));
        }
        Ok(FileAction::Touch {
            source: source.clone(),
        })
    }

    pub fn make_dir(source: &File) -> Self {
        let mut folder = source.clone();
        folder.location = source.location.as_folder();
        FileAction::MakeDir { source: folder }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            FileAction::Copy { .. } => ActionKind::Copy,
            FileAction::Move { .. } => ActionKind::Move,
            FileAction::Link { .. } => ActionKind::Link,
            FileAction::Transfer { .. } => ActionKind::Transfer,
            FileAction::Remove { .. } => ActionKind::Remove,
            FileAction::Touch { .. } => ActionKind::Touch,
            FileAction::MakeDir { .. } => ActionKind::MakeDir,
        }
    }

    pub fn source(&self) -> &File {
        match self {
            FileAction::Copy { source, .. }
            | FileAction::Move { source, .. }
            | FileAction::Link { source, .. }
            | FileAction::Transfer { source, .. }
            | FileAction::Remove { source }
            | FileAction::Touch { source }
            | FileAction::MakeDir { source } => source,
        }
    }

    pub fn target(&self) -> Option<&File> {
        match self {
            FileAction::Copy { target, .. }
            | FileAction::Move { target, .. }
            | FileAction::Link { target, .. }
            | FileAction::Transfer { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.source().is_folder()
    }

    pub fn required(&self) -> Vec<&File> {
        match self {
            FileAction::Touch { .. } | FileAction::MakeDir { .. } => vec![],
            _ => vec![self.source()],
        }
    }

    pub fn added(&self) -> Vec<&File> {
        match self {
            FileAction::Remove { .. } => vec![],
            FileAction::Touch { source } | FileAction::MakeDir { source } => vec![source],
            _ => self.target().into_iter().collect(),
        }
    }

    pub fn removed(&self) -> Vec<&File> {
        match self {
            FileAction::Move { source, .. } | FileAction::Remove { source } => vec![source],
            _ => vec![],
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => write!(
                f,
                "{} {} -> {}",
                self.kind(),
                self.source().location,
                target.location
            ),
            None => write!(f, "{} {}", self.kind(), self.source().location),
        }
    }
}

/// 目标是目录而源是文件时，目标补全为目录下的同名文件
fn resolve_pair(source: &File, target: &File) -> SchedulerResult<(File, File)> {
    if source.is_folder() && !target.is_folder() {
        return Err(SchedulerError::InvalidAction(format!(
            "目录 {} 的目标必须也是目录: {}",
            source.location, target.location
        )));
    }

    if target.is_folder() && !source.is_folder() {
        let location: Location = target.location.join(source.basename());
        return Ok((source.clone(), File::new(location)));
    }

    Ok((source.clone(), target.clone()))
}

/// 暂存阶段中的一步：原样的 shell 片段或一个文件操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStep {
    Shell(String),
    Action(FileAction),
}

impl StagingStep {
    pub fn as_action(&self) -> Option<&FileAction> {
        match self {
            StagingStep::Action(action) => Some(action),
            StagingStep::Shell(_) => None,
        }
    }
}

impl From<FileAction> for StagingStep {
    fn from(action: FileAction) -> Self {
        StagingStep::Action(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(raw: &str) -> File {
        File::at(raw).unwrap()
    }

    #[test]
    fn test_move_sets() {
        let action = FileAction::move_to(&file("worker://out.dcd"), &file("staging://out.dcd")).unwrap();
        assert_eq!(action.kind(), ActionKind::Move);
        assert_eq!(action.required()[0].location.render(), "worker://out.dcd");
        assert_eq!(action.added()[0].location.render(), "staging://out.dcd");
        assert_eq!(action.removed()[0].location.render(), "worker://out.dcd");
    }

    #[test]
    fn test_copy_and_link_keep_source() {
        let copy = FileAction::copy(&file("staging://a"), &file("worker://a")).unwrap();
        assert!(copy.removed().is_empty());
        let link = FileAction::link(&file("staging://a"), &file("worker://a")).unwrap();
        assert!(link.removed().is_empty());
        assert_eq!(link.added().len(), 1);
    }

    #[test]
    fn test_single_file_actions() {
        let touch = FileAction::touch(&file("worker://done")).unwrap();
        assert!(touch.required().is_empty());
        assert_eq!(touch.added().len(), 1);

        let remove = FileAction::remove(&file("worker://tmp"));
        assert_eq!(remove.required().len(), 1);
        assert!(remove.added().is_empty());
        assert_eq!(remove.removed().len(), 1);

        let mkdir = FileAction::make_dir(&file("worker://frames"));
        assert!(mkdir.is_folder());
        assert_eq!(mkdir.source().location.render(), "worker://frames/");

        assert!(FileAction::touch(&file("worker://dir/")).is_err());
    }

    #[test]
    fn test_folder_target_resolves_file_name() {
        let action = FileAction::copy(&file("staging://runs/input.pdb"), &file("worker://inputs/")).unwrap();
        assert_eq!(action.target().unwrap().location.render(), "worker://inputs/input.pdb");
    }

    #[test]
    fn test_folder_source_requires_folder_target() {
        assert!(FileAction::move_to(&file("worker://frames/"), &file("staging://frames")).is_err());
        let ok = FileAction::move_to(&file("worker://frames/"), &file("staging://frames/")).unwrap();
        assert!(ok.is_folder());
    }

    #[test]
    fn test_serde_tagged() {
        let action = FileAction::transfer(&file("file:///tmp/a.pdb"), &file("staging://a.pdb")).unwrap();
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "transfer");
        let back: FileAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);

        let step = StagingStep::from(action);
        let json = serde_json::to_string(&step).unwrap();
        let back: StagingStep = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }
}
