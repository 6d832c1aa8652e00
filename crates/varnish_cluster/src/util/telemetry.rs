use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Output format of the log lines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Console,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "console" | "compact" => Ok(LogFormat::Console),
            other => Err(format!("unknown log format '{other}', expected json or console")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Console => write!(f, "console"),
        }
    }
}

/// Initialize tracing
///
/// `RUST_LOG` takes precedence over `level` when set.
pub async fn init(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Json => {
            let logger = tracing_subscriber::fmt::layer().json().with_current_span(false);
            tracing::subscriber::set_global_default(Registry::default().with(logger).with(env_filter))
        }
        LogFormat::Console => {
            let logger = tracing_subscriber::fmt::layer().compact();
            tracing::subscriber::set_global_default(Registry::default().with(logger).with(env_filter))
        }
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}
