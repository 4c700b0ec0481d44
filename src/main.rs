use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use taskyard_core::{init_logging, AppConfig};
use tokio::signal;
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("taskyard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式任务编排与数据搬运引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/taskyard.toml 与 taskyard.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["worker", "sweep", "sweep-once"])
                .default_value("worker"),
        )
        .arg(
            Arg::new("worker-name")
                .long("worker-name")
                .value_name("NAME")
                .help("Worker 名称 (仅在worker模式下使用)"),
        )
        .arg(
            Arg::new("exit-when-idle")
                .long("exit-when-idle")
                .help("没有可领取的任务时退出")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!("加载配置失败: {}", config_path.map_or("<默认>", String::as_str))
    })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map_or("worker", String::as_str)
        .parse()?;
    if let Some(name) = matches.get_one::<String>("worker-name") {
        config.worker.name = Some(name.clone());
    }

    info!("启动 taskyard");
    info!("项目: {}", config.project.name);
    info!("运行模式: {:?}", mode);

    let app = Application::new(config, mode)
        .await?
        .exit_when_idle(matches.get_flag("exit-when-idle"));

    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::new(app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    let finished = tokio::select! {
        result = &mut app_handle => Some(result),
        _ = wait_for_shutdown_signal() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
            // 正在运行的任务可能需要较长时间结束，第二次信号强制退出
            tokio::select! {
                result = &mut app_handle => result,
                _ = wait_for_shutdown_signal() => {
                    warn!("再次收到关闭信号，强制退出");
                    app_handle.abort();
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                    warn!("应用关闭超时，强制退出");
                    app_handle.abort();
                    return Ok(());
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => info!("taskyard 已退出"),
        Ok(Err(e)) => {
            error!("应用运行失败: {e:#}");
            return Err(e);
        }
        Err(e) => error!("应用任务异常结束: {e}"),
    }
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
