//! 日志模块 - 按日期写入日志文件，同时输出到控制台
//!
//! 文件中每行格式为 `yyyyMMddHHmmss|消息`，文件名为当天日期 `YYYY-MM-DD.txt`。

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，默认为当前目录
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 从配置文件的 `Log` 节加载日志配置，读取失败时使用默认值
    ///
    /// 日志需要在完整配置校验之前初始化，所以这里单独读取。
    pub fn load(config_file: &Path) -> Self {
        fs::read_to_string(config_file)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("Log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 命令行 `-v` 提高日志级别
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.level = "debug".to_string(),
            _ => self.level = "trace".to_string(),
        }
        self
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// 单行格式：可选的 `yyyyMMddHHmmss|` 前缀加消息字段
#[derive(Debug, Clone, Copy)]
pub struct PipeFormat {
    timestamp: bool,
}

impl PipeFormat {
    /// 文件格式，带时间前缀
    pub fn file() -> Self {
        Self { timestamp: true }
    }

    /// 控制台格式，只有消息
    pub fn console() -> Self {
        Self { timestamp: false }
    }
}

impl<S, N> FormatEvent<S, N> for PipeFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if self.timestamp {
            write!(writer, "{}|", Local::now().format("%Y%m%d%H%M%S"))?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// 依赖库只输出警告以上
const QUIET_TARGETS: &[&str] = &["russh=warn", "russh_sftp=warn"];

/// 运行报告的 target，不受日志级别影响
pub const REPORT_TARGET: &str = "sftpsync::report";

fn build_filter(level: tracing::Level) -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for target in QUIET_TARGETS {
        if let Ok(directive) = target.parse() {
            filter = filter.add_directive(directive);
        }
    }
    if let Ok(directive) = format!("{}=info", REPORT_TARGET).parse() {
        filter = filter.add_directive(directive);
    }
    filter
}

/// 初始化日志系统
///
/// 返回的 guard 必须保留到程序退出，否则文件日志可能丢失末尾几行。
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter = build_filter(config.tracing_level());

    let console_layer = tracing_subscriber::fmt::layer()
        .event_format(PipeFormat::console())
        .with_writer(std::io::stdout);

    let mut guard = None;
    let file_layer = if config.enabled {
        let log_dir = config.log_dir();
        let _ = fs::create_dir_all(&log_dir);
        match Builder::new()
            .rotation(Rotation::DAILY)
            .filename_suffix("txt")
            .build(&log_dir)
        {
            Ok(appender) => {
                let (writer, worker) = tracing_appender::non_blocking(appender);
                guard = Some(worker);
                Some(
                    tracing_subscriber::fmt::layer()
                        .event_format(PipeFormat::file())
                        .with_ansi(false)
                        .with_writer(writer),
                )
            }
            Err(e) => {
                // 文件日志创建失败，只输出到控制台
                eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e);
                None
            }
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

/// 运行过程日志的接收端
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// 转发到 tracing，由订阅者写文件和控制台
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn append(&self, line: &str) {
        tracing::info!(target: REPORT_TARGET, "{}", line);
    }
}

/// 在内存中收集日志行
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn append(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_with(format: PipeFormat, message: &str) -> String {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(format)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("{}", message);
        });
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_file_format_has_timestamp_prefix() {
        let output = capture_with(PipeFormat::file(), "同步成功");
        let pattern = regex::Regex::new(r"^\d{14}\|同步成功\n$").unwrap();
        assert!(pattern.is_match(&output), "unexpected line: {:?}", output);
    }

    #[test]
    fn test_console_format_is_message_only() {
        let output = capture_with(PipeFormat::console(), "已上传: 3");
        assert_eq!(output, "已上传: 3\n");
    }

    #[test]
    fn test_report_lines_pass_a_warn_filter() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(PipeFormat::console())
            .with_env_filter(build_filter(tracing::Level::WARN))
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("扫描完成");
            TracingSink.append("程序启动");
            tracing::debug!(target: REPORT_TARGET, "调试");
        });

        let bytes = capture.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), "程序启动\n");
    }

    #[test]
    fn test_load_log_section() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sftpsync.json");
        fs::write(
            &file,
            r#"{ "SftpIp": "h", "Log": { "enabled": false, "level": "warn", "dir": "logs" } }"#,
        )
        .unwrap();

        let config = LogConfig::load(&file);
        assert!(!config.enabled);
        assert_eq!(config.tracing_level(), tracing::Level::WARN);
        assert_eq!(config.log_dir(), PathBuf::from("logs"));

        let missing = LogConfig::load(&dir.path().join("absent.json"));
        assert!(missing.enabled);
        assert_eq!(missing.log_dir(), PathBuf::from("."));
        assert_eq!(
            missing.with_verbosity(1).tracing_level(),
            tracing::Level::DEBUG
        );
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.append("程序启动");
        sink.append("程序结束");
        assert_eq!(sink.lines(), vec!["程序启动", "程序结束"]);
    }
}
