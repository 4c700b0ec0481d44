use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{SchedulerError, SchedulerResult};

/// 逻辑存储区（驱动器）
///
/// - `worker`: 任务工作目录，只在执行期间存在
/// - `staging`: 项目级暂存区，所有 Worker 可见
/// - `shared`: 集群共享文件系统根目录
/// - `sandbox`: 每个会话独立的暂存区
/// - `file`: 控制端本地路径，Worker 不可直接访问
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Drive {
    Worker,
    Staging,
    Shared,
    Sandbox,
    File,
}

impl Drive {
    pub const ALL: [Drive; 5] = [
        Drive::Worker,
        Drive::Staging,
        Drive::Shared,
        Drive::Sandbox,
        Drive::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Drive::Worker => "worker",
            Drive::Staging => "staging",
            Drive::Shared => "shared",
            Drive::Sandbox => "sandbox",
            Drive::File => "file",
        }
    }

    /// Worker 上可以直接用 shell 命令访问的驱动器
    pub fn is_managed(&self) -> bool {
        !matches!(self, Drive::File)
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Drive {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Drive::Worker),
            "staging" => Ok(Drive::Staging),
            "shared" => Ok(Drive::Shared),
            "sandbox" => Ok(Drive::Sandbox),
            "file" => Ok(Drive::File),
            other => Err(SchedulerError::InvalidLocation(format!(
                "未知的驱动器: {other}"
            ))),
        }
    }
}

/// 带驱动器前缀的路径，例如 `staging://runs/traj.dcd`。
///
/// 没有前缀的路径视为 `worker://`，以 `/` 结尾的路径表示目录。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    drive: Drive,
    path: String,
}

impl Location {
    pub fn new(drive: Drive, path: impl Into<String>) -> SchedulerResult<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(SchedulerError::InvalidLocation(format!(
                "{drive}:// 缺少路径部分"
            )));
        }
        Ok(Self::at(drive, path))
    }

    fn at(drive: Drive, path: impl Into<String>) -> Self {
        Self {
            drive,
            path: path.into(),
        }
    }

    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        if raw.is_empty() {
            return Err(SchedulerError::InvalidLocation("路径不能为空".to_string()));
        }

        if let Some((scheme, rest)) = raw.split_once("://") {
            if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
                let drive = scheme.parse::<Drive>()?;
                if rest.is_empty() {
                    return Err(SchedulerError::InvalidLocation(format!(
                        "缺少路径部分: {raw}"
                    )));
                }
                return Ok(Self::at(drive, rest));
            }
        }

        Ok(Self::at(Drive::Worker, raw))
    }

    pub fn drive(&self) -> Drive {
        self.drive
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `drive://path` 形式的完整地址
    pub fn render(&self) -> String {
        format!("{}://{}", self.drive, self.path)
    }

    pub fn is_folder(&self) -> bool {
        self.path.ends_with('/')
    }

    /// 最后一段路径名，目录返回空字符串
    pub fn basename(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[idx + 1..],
            None => &self.path,
        }
    }

    /// 所在目录（带结尾 `/`），位于根时返回 None
    pub fn dirname(&self) -> Option<Location> {
        let trimmed = self.path.trim_end_matches('/');
        trimmed
            .rfind('/')
            .map(|idx| Location::at(self.drive, &trimmed[..=idx]))
    }

    /// 在目录下追加一段路径
    pub fn join(&self, name: &str) -> Location {
        let name = name.trim_start_matches('/');
        if self.is_folder() {
            Location::at(self.drive, format!("{}{}", self.path, name))
        } else {
            Location::at(self.drive, format!("{}/{}", self.path, name))
        }
    }

    pub fn with_drive(&self, drive: Drive) -> Location {
        Location::at(drive, self.path.clone())
    }

    /// 同一路径的目录形式
    pub fn as_folder(&self) -> Location {
        if self.is_folder() {
            self.clone()
        } else {
            Location::at(self.drive, format!("{}/", self.path))
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.drive, self.path)
    }
}

impl FromStr for Location {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Location::parse(s)
    }
}

impl TryFrom<String> for Location {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Location::parse(&value)
    }
}

impl From<Location> for String {
    fn from(value: Location) -> Self {
        value.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_drive() {
        let loc = Location::parse("staging://runs/traj.dcd").unwrap();
        assert_eq!(loc.drive(), Drive::Staging);
        assert_eq!(loc.path(), "runs/traj.dcd");
        assert_eq!(loc.basename(), "traj.dcd");
        assert!(!loc.is_folder());
    }

    #[test]
    fn test_bare_path_defaults_to_worker() {
        let loc = Location::parse("output/frames/").unwrap();
        assert_eq!(loc.drive(), Drive::Worker);
        assert!(loc.is_folder());
        assert_eq!(loc.basename(), "");
        assert_eq!(loc.render(), "worker://output/frames/");
    }

    #[test]
    fn test_absolute_file_path() {
        let loc = Location::parse("file:///home/user/input.pdb").unwrap();
        assert_eq!(loc.drive(), Drive::File);
        assert_eq!(loc.path(), "/home/user/input.pdb");
        assert_eq!(loc.render(), "file:///home/user/input.pdb");
    }

    #[test]
    fn test_render_parse_roundtrip() {
        for raw in [
            "worker://a",
            "shared://x/y/",
            "sandbox://session/data.bin",
            "plain.txt",
            "file:///tmp/z",
        ] {
            let loc = Location::parse(raw).unwrap();
            assert_eq!(Location::parse(&loc.render()).unwrap(), loc);
        }
    }

    #[test]
    fn test_unknown_drive_rejected() {
        assert!(Location::parse("http://example.org/x").is_err());
        assert!(Location::parse("").is_err());
        assert!(Location::parse("staging://").is_err());
    }

    #[test]
    fn test_new_rejects_empty_path() {
        assert!(Location::new(Drive::Staging, "").is_err());
        let loc = Location::new(Drive::Shared, "data/").unwrap();
        assert_eq!(loc.render(), "shared://data/");
    }

    #[test]
    fn test_join_and_dirname() {
        let dir = Location::parse("staging://runs/").unwrap();
        let file = dir.join("traj.dcd");
        assert_eq!(file.render(), "staging://runs/traj.dcd");
        assert_eq!(file.dirname().unwrap(), dir);
        assert_eq!(Location::parse("top.txt").unwrap().dirname(), None);
        assert_eq!(
            Location::parse("shared://a/b").unwrap().as_folder().render(),
            "shared://a/b/"
        );
    }

    #[test]
    fn test_serde_as_string() {
        let loc = Location::parse("sandbox://x.txt").unwrap();
        let json = serde_json::to_string(&loc).unwrap();
        assert_eq!(json, "\"sandbox://x.txt\"");
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
    }
}
