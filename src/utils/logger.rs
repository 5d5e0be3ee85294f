use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    /// One JSON object per line, with thread ids so parallel designs can be told apart.
    Json,
}

impl LogFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "rfsynth=debug,info"
    } else {
        "rfsynth=info"
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the defaults. A second call is a
/// no-op.
pub fn init_logger(format: LogFormat, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .json(),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Logger already installed");
    }
}

pub fn init_cli_logger(verbose: bool) {
    init_logger(LogFormat::Compact, verbose);
}

pub fn init_json_logger() {
    init_logger(LogFormat::Json, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_adds_crate_debug() {
        assert_eq!(default_directives(false), "rfsynth=info");
        assert!(default_directives(true).starts_with("rfsynth=debug"));
    }

    #[test]
    fn test_second_init_is_ignored() {
        init_logger(LogFormat::Compact, false);
        init_json_logger();
        assert_eq!(LogFormat::from_flag(true), LogFormat::Json);
    }
}
