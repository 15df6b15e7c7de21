use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "agent-client.logs.jsonl";

/// Where log records go.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogTarget {
    Disabled,
    Console,
    JsonFile { dir: PathBuf, file_name: String },
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn resolve_target(enabled: Option<&str>, json_path: Option<&str>) -> LogTarget {
    if enabled.and_then(parse_bool_env) == Some(false) {
        return LogTarget::Disabled;
    }
    let Some(raw) = json_path.map(str::trim).filter(|p| !p.is_empty()) else {
        return LogTarget::Console;
    };
    let path = Path::new(raw);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_owned();
    LogTarget::JsonFile { dir, file_name }
}

fn resolve_env_filter() -> EnvFilter {
    if let Ok(level) = std::env::var("AGENT_CLIENT_LOG_LEVEL")
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber once per process.
///
/// Environment variables:
/// - `AGENT_CLIENT_OBSERVABILITY_ENABLED`: set to a false value to skip installing a subscriber.
/// - `AGENT_CLIENT_LOG_LEVEL`: filter directive, falling back to `RUST_LOG` and then `info`.
/// - `AGENT_CLIENT_JSON_LOG_PATH`: write JSON lines to this file instead of compact console output.
///
/// Does nothing if the host already installed a subscriber.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let enabled = std::env::var("AGENT_CLIENT_OBSERVABILITY_ENABLED").ok();
        let json_path = std::env::var("AGENT_CLIENT_JSON_LOG_PATH").ok();
        match resolve_target(enabled.as_deref(), json_path.as_deref()) {
            LogTarget::Disabled => {}
            LogTarget::Console => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(resolve_env_filter())
                    .with(console_layer)
                    .try_init();
            }
            LogTarget::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(&dir, &file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(resolve_env_filter())
                    .with(json_layer)
                    .try_init();
            }
        }
    });
}
