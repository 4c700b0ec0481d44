use serde::{Deserialize, Serialize};

/// 对象存储的缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CacheMode {
    None,
    Unbounded,
    /// 最多保留 `capacity` 个强引用，其余以弱引用保留
    Lru { capacity: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub tasks: CacheMode,
    pub workers: CacheMode,
    pub files: CacheMode,
    pub logs: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tasks: CacheMode::Lru { capacity: 1_000 },
            workers: CacheMode::None,
            files: CacheMode::Lru { capacity: 1_000 },
            logs: CacheMode::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// 共享文件系统根目录，`shared://` 映射到这里
    pub shared_root: String,
    pub cache: CacheConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shared_root: "./shared".to_string(),
            cache: CacheConfig::default(),
        }
    }
}

impl ProjectConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            return Err(anyhow::anyhow!("项目名称不能为空"));
        }

        if self.name.contains(['/', '.', ' ']) {
            return Err(anyhow::anyhow!("项目名称不能包含 '/'、'.' 或空格: {}", self.name));
        }

        if self.shared_root.is_empty() {
            return Err(anyhow::anyhow!("共享目录不能为空"));
        }

        for mode in [self.cache.tasks, self.cache.workers, self.cache.files, self.cache.logs] {
            if mode == (CacheMode::Lru { capacity: 0 }) {
                return Err(anyhow::anyhow!("LRU缓存容量必须大于0"));
            }
        }

        Ok(())
    }
}

/// 文件操作的执行环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// Worker 本地 shell 执行
    #[default]
    Shell,
    /// 交给外部传输系统的暂存指令
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub context: ExecutionContext,
    /// 函数调用任务的解释器
    pub call_interpreter: String,
    pub script_name: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            context: ExecutionContext::Shell,
            call_interpreter: "python3".to_string(),
            script_name: "run.sh".to_string(),
        }
    }
}

impl StagingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.call_interpreter.trim().is_empty() {
            return Err(anyhow::anyhow!("调用解释器不能为空"));
        }

        if self.script_name.is_empty() || self.script_name.contains('/') {
            return Err(anyhow::anyhow!("脚本文件名无效: {}", self.script_name));
        }

        Ok(())
    }
}
