use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use taskyard_core::{SchedulerError, SchedulerResult};
use taskyard_staging::{DirectiveVerb, StagingDirective};
use tokio::fs;
use tracing::debug;

/// 在 Worker 本机执行暂存指令
///
/// 相对路径以任务工作目录为基准。文件夹以 `/` 结尾。
pub struct DirectiveRunner {
    workdir: PathBuf,
}

impl DirectiveRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let trimmed = raw.trim_end_matches('/');
        let path = Path::new(if trimmed.is_empty() { "/" } else { trimmed });
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    pub async fn run_all(&self, directives: &[StagingDirective]) -> SchedulerResult<()> {
        for directive in directives {
            self.run(directive).await?;
        }
        Ok(())
    }

    pub async fn run(&self, directive: &StagingDirective) -> SchedulerResult<()> {
        let source = self.resolve(&directive.source);
        let target = self.resolve(&directive.target);
        debug!(
            "执行暂存指令 {:?}: {} -> {}",
            directive.verb,
            source.display(),
            target.display()
        );

        if !matches!(directive.verb, DirectiveVerb::Link) && fs::metadata(&source).await.is_err() {
            return Err(SchedulerError::FileState(format!(
                "暂存源不存在: {}",
                source.display()
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        match directive.verb {
            DirectiveVerb::Copy | DirectiveVerb::Transfer => copy_any(&source, &target).await?,
            DirectiveVerb::Move => {
                if fs::rename(&source, &target).await.is_err() {
                    copy_any(&source, &target).await?;
                    remove_any(&source).await?;
                }
            }
            DirectiveVerb::Link => link(&source, &target).await?,
        }
        Ok(())
    }
}

async fn copy_any(source: &Path, target: &Path) -> std::io::Result<()> {
    if fs::metadata(source).await?.is_dir() {
        copy_tree(source.to_path_buf(), target.to_path_buf()).await
    } else {
        fs::copy(source, target).await.map(|_| ())
    }
}

fn copy_tree(source: PathBuf, target: PathBuf) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> {
    Box::pin(async move {
        fs::create_dir_all(&target).await?;
        let mut entries = fs::read_dir(&source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from = entry.path();
            let to = target.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_tree(from, to).await?;
            } else {
                fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    })
}

async fn remove_any(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path).await?.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

#[cfg(unix)]
async fn link(source: &Path, target: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(target).await.is_ok() {
        fs::remove_file(target).await?;
    }
    fs::symlink(source, target).await
}

#[cfg(not(unix))]
async fn link(source: &Path, target: &Path) -> std::io::Result<()> {
    copy_any(source, target).await
}
