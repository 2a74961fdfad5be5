use anyhow::Context;
use clap::Parser;
use sftpsync_lib::logging::init_logging;
use sftpsync_lib::storage::SftpConnector;
use sftpsync_lib::{LogConfig, Settings, SyncRunner, TracingSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// 将本地目录单向同步到 SFTP 服务器
#[derive(Debug, Parser)]
#[command(name = "sftpsync", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = "SFTPSYNC_CONFIG", default_value = "sftpsync.json")]
    config: PathBuf,

    /// 只分析并打印同步计划，不修改远程
    #[arg(long)]
    dry_run: bool,

    /// 提高日志级别（-v debug, -vv trace）
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // 初始化日志系统，guard 需要保留到退出
    let log_config = LogConfig::load(&cli.config).with_verbosity(cli.verbose);
    let _log_guard = init_logging(&log_config);

    let mut runner = SyncRunner::new(Arc::new(SftpConnector), Arc::new(TracingSink));
    let config_path = cli.config.clone();
    let load = move || Settings::load(&config_path);

    if cli.dry_run {
        return match runner.analyze(load).await {
            Ok(plan) => {
                let json = serde_json::to_string_pretty(&plan).context("序列化同步计划失败")?;
                println!("{}", json);
                Ok(ExitCode::SUCCESS)
            }
            Err(_) => Ok(ExitCode::FAILURE),
        };
    }

    match runner.run(load).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
