use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "human" | "text" => Ok(LogFormat::Human),
            other => Err(format!("unknown log format {:?}", other)),
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `LOG_LEVEL` (default "info") applies to
/// this crate and the HTTP stack is kept at warn.
pub fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("tagfs={},tower=warn,hyper=warn,reqwest=warn", level))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Human => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}
