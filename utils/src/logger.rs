use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_log::LogTracer;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Debug)]
pub enum LogError {
    Io(std::io::Error),
    Init(tracing_appender::rolling::InitError),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<tracing_appender::rolling::InitError> for LogError {
    fn from(err: tracing_appender::rolling::InitError) -> Self {
        Self::Init(err)
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io(err) => write!(f, "{err}"),
            LogError::Init(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LogError {}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub time: String,
    pub level: Level,
    pub module: String,
    pub message: String,
}

impl LogRecord {
    fn new(level: Level, module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            module: module.into(),
            message: message.into(),
        }
    }

    fn format_text(&self) -> String {
        format!(
            "{} [{}] {} - {}",
            self.time, self.level, self.module, self.message
        )
    }
}

pub trait LogSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn min_level(&self) -> Level;
    fn emit(&self, record: &LogRecord) -> Result<(), LogError>;
}

struct LogDispatcher {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl LogDispatcher {
    fn emit(&self, record: LogRecord) {
        for sink in &self.sinks {
            if record.level > sink.min_level() {
                continue;
            }
            if sink.emit(&record).is_err() {
                metrics::counter!("log_sink_errors_total", "sink" => sink.name()).increment(1);
            }
        }
    }
}

struct LogSinkLayer {
    dispatcher: Arc<LogDispatcher>,
}

impl<S> Layer<S> for LogSinkLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let message = if visitor.message.is_empty() {
            metadata.name().to_string()
        } else {
            visitor.message
        };

        self.dispatcher
            .emit(LogRecord::new(*metadata.level(), metadata.target(), message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.message, "{:?}", value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }
}

struct ConsoleSink {
    min_level: Level,
    writer: Mutex<tracing_appender::non_blocking::NonBlocking>,
    _guard: WorkerGuard,
}

impl ConsoleSink {
    fn new(min_level: Level) -> Self {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        Self {
            min_level,
            writer: Mutex::new(writer),
            _guard: guard,
        }
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) -> Result<(), LogError> {
        if let Ok(mut writer) = self.writer.lock() {
            use std::io::Write;
            writeln!(writer, "{}", record.format_text())?;
        }
        Ok(())
    }
}

struct FileSink {
    min_level: Level,
    writer: Mutex<tracing_appender::non_blocking::NonBlocking>,
    _guard: WorkerGuard,
}

impl FileSink {
    fn new(path: &Path, min_level: Level) -> Result<Self, LogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_prefix = path.file_name().and_then(|n| n.to_str()).unwrap_or("app");
        let file_appender = tracing_appender::rolling::Builder::new()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_prefix)
            .build(path.parent().unwrap_or_else(|| Path::new(".")))?;
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        Ok(Self {
            min_level,
            writer: Mutex::new(writer),
            _guard: guard,
        })
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) -> Result<(), LogError> {
        if let Ok(mut writer) = self.writer.lock() {
            use std::io::Write;
            writeln!(writer, "{}", record.format_text())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggerConfig {
    pub fn new(level: impl AsRef<str>) -> Self {
        Self {
            level: level.as_ref().to_string(),
            file: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the process logger. All crates log through the `log`
/// macros; `LogTracer` bridges them into the tracing subscriber, which
/// fans events out over the configured sinks.
pub fn init_logger(config: LoggerConfig) -> Result<(), LogError> {
    if LOGGER_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::warn!("Logger already initialized, skipping re-initialization");
        return Ok(());
    }

    let _ = LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init();

    let base_level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::try_new(build_allowlist_filter(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(ConsoleSink::new(base_level))];
    if let Some(path) = &config.file {
        sinks.push(Arc::new(FileSink::new(path, base_level)?));
    }

    let dispatcher = Arc::new(LogDispatcher { sinks });
    let layer = LogSinkLayer { dispatcher };

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();

    Ok(())
}

fn build_allowlist_filter(level: &str) -> String {
    format!(
        "off,analyzer={level},common={level},errors={level},pipeline={level},queue={level},utils={level},totem_dynamic={level}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{info, warn};

    #[test]
    fn test_allowlist_filter() {
        let filter = build_allowlist_filter("debug");
        assert!(filter.starts_with("off,"));
        assert!(filter.contains("pipeline=debug"));
        assert!(filter.contains("queue=debug"));
    }

    #[test]
    fn test_logger_config_builder() {
        let config = LoggerConfig::new("warn").with_file("/var/log/totem-dynamic.log");
        assert_eq!(config.level, "warn");
        assert!(config.file.is_some());
    }

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_logger(LoggerConfig::default());
        let _ = init_logger(LoggerConfig::default());

        info!("info message");
        warn!("warning message");
    }
}
