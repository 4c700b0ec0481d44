use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskyard_core::{SchedulerError, SchedulerResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// 脚本退出后等待输出读完的最长时间
const READER_GRACE: Duration = Duration::from_secs(2);

/// 进程结束后的结果
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// 受监管的子进程
///
/// 输出由两个后台任务持续读入缓冲区，轮询循环只通过 `try_finish` 检查退出状态，
/// 从不等待子进程本身。
pub struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<()>>,
    started: Instant,
    workdir: PathBuf,
}

fn drain<R>(source: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(source);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let mut guard = buffer.lock().unwrap_or_else(|p| p.into_inner());
                    guard.extend_from_slice(&line);
                }
                Err(e) => {
                    warn!("读取子进程输出失败: {}", e);
                    break;
                }
            }
        }
    })
}

fn take_text(buffer: &SharedBuffer) -> String {
    let mut guard = buffer.lock().unwrap_or_else(|p| p.into_inner());
    let bytes = std::mem::take(&mut *guard);
    String::from_utf8_lossy(&bytes).into_owned()
}

impl RunningProcess {
    /// 在 `workdir` 中用 bash 执行脚本
    pub fn spawn(script: &Path, workdir: &Path, env: &[(&str, String)]) -> SchedulerResult<Self> {
        let mut cmd = Command::new("bash");
        cmd.arg(script)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动任务脚本失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stderr".to_string()))?;

        let stdout_buffer = SharedBuffer::default();
        let stderr_buffer = SharedBuffer::default();
        let readers = vec![
            drain(stdout, stdout_buffer.clone()),
            drain(stderr, stderr_buffer.clone()),
        ];

        let pid = child.id();
        debug!("任务进程已启动: pid={:?}, 目录={}", pid, workdir.display());

        Ok(Self {
            child,
            pid,
            stdout: stdout_buffer,
            stderr: stderr_buffer,
            readers,
            started: Instant::now(),
            workdir: workdir.to_path_buf(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// 非阻塞地检查进程是否已退出
    pub fn try_finish(&mut self) -> SchedulerResult<Option<ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| SchedulerError::TaskExecution(format!("检查进程状态失败: {e}")))
    }

    /// 结束脚本留下的后台进程，等待输出读完并取出结果
    pub async fn collect(self, status: Option<ExitStatus>) -> ProcessOutcome {
        if let Some(pid) = self.pid {
            kill_group(pid).await;
        }
        for mut reader in self.readers {
            match tokio::time::timeout(READER_GRACE, &mut reader).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("输出读取任务异常结束: {}", e),
                Err(_) => {
                    warn!("输出管道仍被占用，放弃剩余输出");
                    reader.abort();
                }
            }
        }
        ProcessOutcome {
            exit_code: status.and_then(|s| s.code()),
            success: status.is_some_and(|s| s.success()),
            stdout: take_text(&self.stdout),
            stderr: take_text(&self.stderr),
            duration: self.started.elapsed(),
        }
    }

    /// 杀掉整个进程组并回收子进程
    pub async fn kill(mut self) -> ProcessOutcome {
        if let Some(pid) = self.pid {
            kill_group(pid).await;
        }
        if let Err(e) = self.child.start_kill() {
            debug!("结束子进程: {}", e);
        }
        let status = match self.child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("回收子进程失败: {}", e);
                None
            }
        };
        let mut outcome = self.collect(status).await;
        outcome.success = false;
        outcome
    }
}

/// 向以 `pid` 为组长的进程组发送 SIGKILL，组不存在时什么都不做
async fn kill_group(pid: u32) {
    let group = format!("-{pid}");
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!("已结束进程组 {}", pid),
        Ok(_) | Err(_) => {}
    }
}

/// 在指定目录执行一条诊断命令，超时后杀掉
pub async fn run_diagnostic(command: &str, workdir: &Path, timeout: Duration) -> String {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            format!("$ {command}\n{text}[exit {}]", output.status.code().unwrap_or(-1))
        }
        Ok(Err(e)) => format!("$ {command}\n启动失败: {e}"),
        Err(_) => format!("$ {command}\n超时 ({}s)", timeout.as_secs()),
    }
}
