use std::collections::BTreeMap;
use taskyard_core::models::{Drive, Location};

/// 驱动器到实际路径前缀的映射
///
/// 空前缀表示路径原样使用：`worker://` 在任务工作目录内是相对路径，
/// `file://` 的路径本身就是绝对路径。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveMap {
    roots: BTreeMap<Drive, String>,
}

impl Default for DriveMap {
    fn default() -> Self {
        let roots = Drive::ALL.iter().map(|d| (*d, String::new())).collect();
        Self { roots }
    }
}

impl DriveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 项目的标准布局：
    /// `shared` → 共享根，`staging` → `<共享根>/projects/<项目>/staging`，
    /// `sandbox` → `<共享根>/projects/<项目>/sandbox/<会话>`
    pub fn for_project(shared_root: &str, project: &str, session: &str) -> Self {
        let shared = shared_root.trim_end_matches('/').to_string();
        let project_root = format!("{shared}/projects/{project}");
        Self::default()
            .with_root(Drive::Shared, &shared)
            .with_root(Drive::Staging, &format!("{project_root}/staging"))
            .with_root(Drive::Sandbox, &format!("{project_root}/sandbox/{session}"))
    }

    pub fn with_root(mut self, drive: Drive, root: &str) -> Self {
        self.roots.insert(drive, root.trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self, drive: Drive) -> &str {
        self.roots.get(&drive).map(String::as_str).unwrap_or("")
    }

    fn prefix(&self, drive: Drive) -> String {
        match self.root(drive) {
            "" => String::new(),
            root => format!("{root}/"),
        }
    }

    /// 位置对应的实际路径
    pub fn resolve(&self, location: &Location) -> String {
        let path = location.path();
        match self.root(location.drive()) {
            "" => path.to_string(),
            root => format!("{}/{}", root, path.trim_start_matches('/')),
        }
    }

    /// 替换文本中出现的所有 `drive://` 前缀。
    ///
    /// 只替换完整的驱动器名，`profile://` 之类恰好以驱动器名结尾的协议保持原样。
    pub fn substitute(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find("://") {
            let head = &rest[..pos];
            let start = head
                .char_indices()
                .rev()
                .find(|(_, c)| !c.is_ascii_alphanumeric())
                .map_or(0, |(idx, c)| idx + c.len_utf8());
            match head[start..].parse::<Drive>() {
                Ok(drive) => {
                    result.push_str(&head[..start]);
                    result.push_str(&self.prefix(drive));
                }
                Err(_) => {
                    result.push_str(head);
                    result.push_str("://");
                }
            }
            rest = &rest[pos + 3..];
        }
        result.push_str(rest);
        result
    }
}
