use anyhow::{anyhow, bail, Result};
use tracing_subscriber::EnvFilter;

/// A validated `tracing` filter directive, e.g. `tenant=debug,warn`.
#[derive(Clone, Debug)]
pub struct LogFilter(String);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

// === impl LogFilter ===

impl std::str::FromStr for LogFilter {
    type Err = tracing_subscriber::filter::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvFilter::try_new(s)?;
        Ok(Self(s.to_string()))
    }
}

impl LogFilter {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::new(&self.0)
    }
}

// === impl LogFormat ===

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            s => bail!("invalid log format: {s} (expected plain or json)"),
        }
    }
}

impl LogFormat {
    /// Installs the global subscriber.
    pub fn try_init(self, filter: &LogFilter) -> Result<()> {
        let fmt = tracing_subscriber::fmt().with_env_filter(filter.env_filter());
        match self {
            Self::Plain => fmt.try_init(),
            Self::Json => fmt.json().try_init(),
        }
        .map_err(|e| anyhow!(e))
    }
}
