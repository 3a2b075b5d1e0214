use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use streamtest_core::{RunMode, SessionKind, TesterConfig};

use crate::DisplayFallback;

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigCheckArgs {
    /// Validate for continuous mode (requires a total duration)
    #[arg(long)]
    pub continuous: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub path: PathBuf,
    pub mode: RunMode,
    pub sessions: Vec<SessionKind>,
    pub problem: Option<String>,
    pub config: TesterConfig,
}

impl ConfigReport {
    pub fn is_valid(&self) -> bool {
        self.problem.is_none()
    }
}

/// Validates `config` for the requested mode. The snapshot in the report has
/// its secrets masked.
pub fn check(path: PathBuf, config: &TesterConfig, args: &ConfigCheckArgs) -> ConfigReport {
    let mode = if args.continuous || config.continuous.enabled {
        RunMode::Continuous
    } else {
        RunMode::Single
    };
    ConfigReport {
        path,
        mode,
        sessions: SessionKind::enabled(config),
        problem: config.validate(mode).err().map(|err| err.to_string()),
        config: config.redacted(),
    }
}

impl DisplayFallback for ConfigReport {
    fn display(&self) -> String {
        let sessions: Vec<&str> = self.sessions.iter().map(|kind| kind.as_str()).collect();
        let mut lines = vec![
            format!("config: {}", self.path.display()),
            format!("mode: {:?}", self.mode),
            format!("server: {}", self.config.api.server),
            format!("sessions: {}", sessions.join(", ")),
        ];
        match &self.problem {
            Some(problem) => lines.push(format!("[error] {problem}")),
            None => lines.push("[ok] configuration is valid".to_string()),
        }
        match toml::to_string_pretty(&self.config) {
            Ok(snapshot) => {
                lines.push(String::new());
                lines.push(snapshot);
            }
            Err(err) => lines.push(format!("snapshot unavailable: {err}")),
        }
        lines.join("\n")
    }
}
