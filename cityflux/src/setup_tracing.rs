use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::panic::PanicHookInfo;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

const ENV_DEBUG: &str = "CITYFLUX_DEBUG";
const ENV_LOG_FORMAT: &str = "CITYFLUX_LOG_FORMAT";

/// `hyper` logs every connection at debug.
const DEBUG_DIRECTIVES: &str = "debug,hyper=info,hyper_util=info";
const DEFAULT_DIRECTIVES: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// One flattened JSON object per event.
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogSettings {
    format: LogFormat,
    /// Used when `RUST_LOG` is unset or invalid.
    default_directives: &'static str,
}

impl LogSettings {
    /// `CITYFLUX_DEBUG=true` lowers the level to debug and defaults to text output.
    /// `CITYFLUX_LOG_FORMAT` (`json` or `text`) picks the output either way.
    fn from_env_vars(env_vars: &HashMap<String, String>) -> Self {
        let debug_mode = env_vars
            .get(ENV_DEBUG)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        let format = match env_vars
            .get(ENV_LOG_FORMAT)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            _ if debug_mode => LogFormat::Text,
            _ => LogFormat::Json,
        };
        Self {
            format,
            default_directives: if debug_mode {
                DEBUG_DIRECTIVES
            } else {
                DEFAULT_DIRECTIVES
            },
        }
    }
}

/// One line with the panic location when there is no backtrace, so a panic in a spawned task
/// stays a single JSON event.
fn panic_message(panic_info: &PanicHookInfo<'_>, backtrace: &Backtrace) -> String {
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload) {
        (Some(location), Some(payload)) if backtrace.status() != BacktraceStatus::Captured => {
            format!(
                "{}:{}:{}: {payload}",
                location.file(),
                location.line(),
                location.column()
            )
        }
        _ => format!("{panic_info}\n{backtrace}"),
    }
}

fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // only captured with RUST_BACKTRACE or RUST_LIB_BACKTRACE set
    let backtrace = Backtrace::capture();
    tracing::error!("{}", panic_message(panic_info, &backtrace));
}

pub fn register() {
    let settings = LogSettings::from_env_vars(&std::env::vars().collect());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.default_directives));

    let layer = match settings.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
