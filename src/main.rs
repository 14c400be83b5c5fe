use anyhow::{bail, Context, Result};
use clap::Parser;
use dirmirror_lib::config::{state_dir, MirrorConfig};
use dirmirror_lib::logging::{log_dir, LogConfig, SizeRotatingWriter};
use dirmirror_lib::{MetadataStore, MirrorEngine, StorageRegistry};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 把本地目录持续单向镜像到对象存储
#[derive(Parser)]
#[command(name = "dirmirror", version, about)]
struct Cli {
    /// 目标对象存储地址（file://, mem://, s3://, gs://, azblob://, webdav://, webdavs://）
    #[arg(long)]
    url: String,

    /// 被监控目录
    #[arg(short = 'f', long)]
    folder: PathBuf,
}

/// 初始化日志系统：控制台 + 状态目录下的日志文件
fn init_logging(root: &Path) {
    let config = LogConfig::load(&state_dir(root));

    let mut env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    if let Ok(directive) = "sqlx=warn".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(&log_dir(root), config.max_size_mb) {
            Ok(file_writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件，仅输出到控制台: {}", e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 等待终止信号
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let signals = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        );
        match signals {
            (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("收到 SIGTERM"),
                    _ = sigint.recv() => info!("收到 SIGINT"),
                    _ = sighup.recv() => info!("收到 SIGHUP"),
                }
                return;
            }
            _ => warn!("无法注册信号处理，仅响应 Ctrl+C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("等待 Ctrl+C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到 Ctrl+C");
}

async fn run(cli: Cli) -> Result<()> {
    let root = cli
        .folder
        .canonicalize()
        .with_context(|| format!("无法访问被监控目录: {}", cli.folder.display()))?;
    if !root.is_dir() {
        bail!("不是目录: {}", root.display());
    }

    let state = state_dir(&root);
    std::fs::create_dir_all(&state)
        .with_context(|| format!("无法创建状态目录: {}", state.display()))?;
    init_logging(&root);

    let config = MirrorConfig::load(&state);
    let store = MetadataStore::open(&root)
        .await
        .context("打开元数据库失败")?;
    let storage = StorageRegistry::with_defaults()
        .open(&cli.url)
        .context("连接对象存储失败")?;

    MirrorEngine::new(root, config, store, storage)
        .run(shutdown_signal())
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
