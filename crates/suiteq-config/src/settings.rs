//! Settings file parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Redis URL schemes the store client can connect through.
const REDIS_SCHEMES: &[&str] = &["redis", "rediss", "unix", "redis+unix"];

/// All suiteq settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub redis_url: String,
    pub worker: WorkerSettings,
    pub reporter: ReporterSettings,
    /// Program and leading arguments of the execution engine.
    pub engine: Vec<String>,
    pub files: FileSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub max_requeues: u32,
    /// A worker whose heartbeat is older than this is presumed dead.
    pub liveness: Duration,
    pub queue_wait_timeout: Duration,
    /// Failures + errors after which no more jobs are started. 0 disables.
    pub fail_fast: u32,
    /// Files whose known duration reaches this many seconds are split
    /// into examples.
    pub file_split_threshold: Option<f64>,
    pub graceful_shutdown_timeout: Duration,
    pub shutdown_signal: ShutdownSignal,
    pub keep_alive: bool,
    pub early_release: bool,
    /// Record per-job timings into the build.
    pub update_timings: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReporterSettings {
    pub timeout: Duration,
    /// Command line that replays a worker's jobs.
    pub rerun_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSettings {
    pub suffix: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Signal that asks a supervised worker to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    Term,
    Int,
    Hup,
    Quit,
}

impl FromStr for ShutdownSignal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        match name.strip_prefix("SIG").unwrap_or(&name) {
            "TERM" => Ok(ShutdownSignal::Term),
            "INT" => Ok(ShutdownSignal::Int),
            "HUP" => Ok(ShutdownSignal::Hup),
            "QUIT" => Ok(ShutdownSignal::Quit),
            _ => Err(ConfigError::InvalidValue {
                field: "shutdown-signal".to_string(),
                message: format!("unsupported signal: {s}"),
            }),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            worker: WorkerSettings::default(),
            reporter: ReporterSettings::default(),
            engine: Vec::new(),
            files: FileSettings::default(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_requeues: 3,
            liveness: Duration::from_secs(60),
            queue_wait_timeout: Duration::from_secs(30),
            fail_fast: 0,
            file_split_threshold: None,
            graceful_shutdown_timeout: Duration::from_secs(60),
            shutdown_signal: ShutdownSignal::Term,
            keep_alive: false,
            early_release: true,
            update_timings: false,
        }
    }
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            rerun_prefix: "suiteq work".to_string(),
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            suffix: "_spec.rb".to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Settings {
    /// Read and parse a settings file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loading settings");
        Self::from_kdl(&text)
    }

    /// Parse settings from KDL text. Anything not set keeps its default.
    pub fn from_kdl(kdl: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;
        let mut settings = Settings::default();

        for node in doc.nodes() {
            match node.name().value() {
                "redis" => {
                    settings.redis_url = get_string_prop(node, "url")
                        .or_else(|| get_first_string_arg(node))
                        .ok_or_else(|| ConfigError::MissingField("redis url".to_string()))?;
                }
                "worker" => parse_worker(node, &mut settings.worker)?,
                "reporter" => parse_reporter(node, &mut settings.reporter)?,
                "engine" => {
                    settings.engine = get_all_string_args(node);
                    if settings.engine.is_empty() {
                        return Err(ConfigError::MissingField("engine program".to_string()));
                    }
                }
                "files" => parse_files(node, &mut settings.files),
                other => debug!(node = other, "Ignoring unknown settings node"),
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Check values that cannot be expressed in the types.
    pub fn validate(&self) -> ConfigResult<()> {
        let url = url::Url::parse(&self.redis_url).map_err(|e| ConfigError::InvalidValue {
            field: "redis url".to_string(),
            message: e.to_string(),
        })?;
        if !REDIS_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::InvalidValue {
                field: "redis url".to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if let Some(threshold) = self.worker.file_split_threshold {
            if !(threshold.is_finite() && threshold > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "file-split-threshold".to_string(),
                    message: format!("must be a positive number of seconds, got {threshold}"),
                });
            }
        }
        if self.worker.liveness.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "liveness".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        for pattern in self.files.include.iter().chain(&self.files.exclude) {
            regex::Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn parse_worker(node: &KdlNode, worker: &mut WorkerSettings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        let name = child.name().value();
        match name {
            "max-requeues" => worker.max_requeues = get_u32_arg(child, name)?,
            "liveness" => worker.liveness = get_duration_arg(child, name)?,
            "queue-wait-timeout" => worker.queue_wait_timeout = get_duration_arg(child, name)?,
            "fail-fast" => worker.fail_fast = get_u32_arg(child, name)?,
            "file-split-threshold" => {
                worker.file_split_threshold = Some(get_seconds_arg(child, name)?)
            }
            "graceful-shutdown-timeout" => {
                worker.graceful_shutdown_timeout = get_duration_arg(child, name)?
            }
            "shutdown-signal" => {
                let signal = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(name.to_string()))?;
                worker.shutdown_signal = signal.parse()?;
            }
            "keep-alive" => worker.keep_alive = get_bool_arg(child, name)?,
            "early-release" => worker.early_release = get_bool_arg(child, name)?,
            "update-timings" => worker.update_timings = get_bool_arg(child, name)?,
            other => debug!(node = other, "Ignoring unknown worker setting"),
        }
    }
    Ok(())
}

fn parse_reporter(node: &KdlNode, reporter: &mut ReporterSettings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        let name = child.name().value();
        match name {
            "timeout" => reporter.timeout = get_duration_arg(child, name)?,
            "rerun-prefix" => {
                reporter.rerun_prefix = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(name.to_string()))?
            }
            other => debug!(node = other, "Ignoring unknown reporter setting"),
        }
    }
    Ok(())
}

fn parse_files(node: &KdlNode, files: &mut FileSettings) {
    let Some(children) = node.children() else {
        return;
    };
    for child in children.nodes() {
        match child.name().value() {
            "suffix" => {
                if let Some(suffix) = get_first_string_arg(child) {
                    files.suffix = suffix;
                }
            }
            "include" => files.include.extend(get_all_string_args(child)),
            "exclude" => files.exclude.extend(get_all_string_args(child)),
            _ => {}
        }
    }
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn get_u32_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_integer()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(field, "expected a non-negative integer"))
}

fn get_seconds_arg(node: &KdlNode, field: &str) -> ConfigResult<f64> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    let secs = value
        .as_float()
        .or_else(|| value.as_integer().map(|n| n as f64))
        .ok_or_else(|| invalid(field, "expected a number of seconds"))?;
    if secs < 0.0 || !secs.is_finite() {
        return Err(invalid(field, "expected a non-negative number of seconds"));
    }
    Ok(secs)
}

fn get_duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    get_seconds_arg(node, field).map(Duration::from_secs_f64)
}

fn get_bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    match first_arg(node) {
        // A bare flag node means "on".
        None => Ok(true),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| invalid(field, "expected #true or #false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let settings = Settings::from_kdl("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.worker.max_requeues, 3);
        assert_eq!(settings.worker.liveness, Duration::from_secs(60));
        assert!(settings.worker.early_release);
    }

    #[test]
    fn test_parse_full_settings() {
        let kdl = r#"
            redis url="redis://cache:6379/2"
            worker {
                max-requeues 1
                liveness 30
                queue-wait-timeout 5
                fail-fast 10
                file-split-threshold 12.5
                graceful-shutdown-timeout 20
                shutdown-signal "SIGINT"
                keep-alive #true
                early-release #false
                update-timings
            }
            reporter {
                timeout 600
                rerun-prefix "bin/suiteq work"
            }
            engine "bin/run-tests" "--json"
            files {
                suffix "_test.rb"
                include "models/"
                exclude "slow/" "flaky/"
            }
        "#;

        let settings = Settings::from_kdl(kdl).unwrap();
        assert_eq!(settings.redis_url, "redis://cache:6379/2");
        assert_eq!(settings.worker.max_requeues, 1);
        assert_eq!(settings.worker.liveness, Duration::from_secs(30));
        assert_eq!(settings.worker.fail_fast, 10);
        assert_eq!(settings.worker.file_split_threshold, Some(12.5));
        assert_eq!(settings.worker.shutdown_signal, ShutdownSignal::Int);
        assert!(settings.worker.keep_alive);
        assert!(!settings.worker.early_release);
        assert!(settings.worker.update_timings);
        assert_eq!(settings.reporter.timeout, Duration::from_secs(600));
        assert_eq!(settings.reporter.rerun_prefix, "bin/suiteq work");
        assert_eq!(settings.engine, vec!["bin/run-tests", "--json"]);
        assert_eq!(settings.files.suffix, "_test.rb");
        assert_eq!(settings.files.exclude, vec!["slow/", "flaky/"]);
    }

    #[test]
    fn test_rejects_bad_redis_scheme() {
        let result = Settings::from_kdl(r#"redis url="http://localhost""#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let kdl = r#"files { include "models/(" }"#;
        assert!(matches!(
            Settings::from_kdl(kdl).unwrap_err(),
            ConfigError::Pattern { .. }
        ));
    }

    #[test]
    fn test_rejects_negative_requeues() {
        let kdl = "worker { max-requeues -1 }";
        assert!(Settings::from_kdl(kdl).is_err());
    }

    #[test]
    fn test_shutdown_signal_names() {
        assert_eq!("term".parse::<ShutdownSignal>().unwrap(), ShutdownSignal::Term);
        assert_eq!("SIGQUIT".parse::<ShutdownSignal>().unwrap(), ShutdownSignal::Quit);
        assert!("KILL".parse::<ShutdownSignal>().is_err());
    }
}
