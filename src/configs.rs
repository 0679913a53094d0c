use crate::process::control::ProcessControl;
use crate::process::types::Priority;
use crate::process::WatchedProcess;
use crate::report::Reporter;
use chrono::NaiveTime;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const USAGE: &str = "tumbler <watch interval (seconds) > 0> <command 1> <start delay 1 (seconds)> \
<stop delay 1 (seconds)> ... <command n> <start delay n> <stop delay n>, \
or tumbler <config.xml|config.yml>. A stop delay of -1 excludes the process from the watch list.";

/// Stop delay excluding a process from liveness checks.
pub const UNWATCHED: i64 = -1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Too few arguments passed. Usage: {}", USAGE)]
    TooFewArguments,
    #[error("Wrong argument '{0}' passed. Usage: {}", USAGE)]
    WrongArgument(String),
    #[error("File '{0}' not found")]
    NotFound(PathBuf),
    #[error("Unsupported configuration file '{0}': expected .xml, .yml or .yaml")]
    UnsupportedExtension(PathBuf),
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File '{path}' is invalid XML: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },
    #[error("File '{path}' is invalid YAML: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Watch interval must be a positive number of seconds, got {0}")]
    WatchInterval(i64),
    #[error("Invalid {field} {value} for '{command}'")]
    Delay {
        command: String,
        field: &'static str,
        value: i64,
    },
    #[error("Invalid restart time '{0}': expected HH:MM or HH:MM:SS")]
    RestartTime(String),
    #[error("No processes configured")]
    NoProcesses,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TumblerConfig {
    pub watch_interval: Duration,
    pub processes: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: Option<String>,
    pub command: String,
    pub start_delay_secs: u64,
    /// [`UNWATCHED`] or a non-negative number of seconds.
    pub stop_delay_secs: i64,
    pub priority: Priority,
    pub restart_times: Vec<NaiveTime>,
}

impl ProcessSpec {
    pub fn build(&self, control: Arc<dyn ProcessControl>, reporter: Reporter) -> WatchedProcess {
        let stop_delay = u64::try_from(self.stop_delay_secs)
            .ok()
            .map(Duration::from_secs);
        let process = WatchedProcess::new(
            &self.command,
            Duration::from_secs(self.start_delay_secs),
            stop_delay,
            control,
            reporter,
        )
        .with_priority(self.priority)
        .with_restart_times(self.restart_times.iter().copied());
        match &self.name {
            Some(name) => process.with_name(name),
            None => process,
        }
    }
}

impl TumblerConfig {
    /// `args` excludes the program name. A single argument names a config file.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        if let [path] = args {
            return Self::from_file(Path::new(path));
        }
        if args.len() < 4 || (args.len() - 1) % 3 != 0 {
            return Err(ConfigError::TooFewArguments);
        }

        let watch_interval = parse_int(&args[0])?;
        let processes = args[1..]
            .chunks(3)
            .map(|group| {
                Ok(RawProcess {
                    name: None,
                    command: group[0].clone(),
                    start_time: parse_int(&group[1])?,
                    end_time: parse_int(&group[2])?,
                    priority: None,
                    restart_times: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        RawConfig {
            watch_time: watch_interval,
            processes,
        }
        .validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        let open = || {
            File::open(path)
                .map(BufReader::new)
                .map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
        };

        let raw = match extension.as_deref() {
            Some("xml") => {
                let document: XmlDocument =
                    quick_xml::de::from_reader(open()?).map_err(|source| ConfigError::Xml {
                        path: path.to_path_buf(),
                        source,
                    })?;
                document.into_raw()
            }
            Some("yml" | "yaml") => {
                serde_yaml::from_reader(open()?).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => return Err(ConfigError::UnsupportedExtension(path.to_path_buf())),
        };
        raw.validate()
    }
}

fn parse_int(value: &str) -> Result<i64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::WrongArgument(value.to_string()))
}

fn parse_restart_time(value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| ConfigError::RestartTime(value.to_string()))
}

/// Unvalidated form shared by every source.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    watch_time: i64,
    processes: Vec<RawProcess>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawProcess {
    #[serde(default)]
    name: Option<String>,
    command: String,
    start_time: i64,
    end_time: i64,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    restart_times: Vec<String>,
}

impl RawConfig {
    fn validate(self) -> Result<TumblerConfig, ConfigError> {
        if self.watch_time <= 0 {
            return Err(ConfigError::WatchInterval(self.watch_time));
        }
        if self.processes.is_empty() {
            return Err(ConfigError::NoProcesses);
        }
        let processes = self
            .processes
            .into_iter()
            .map(RawProcess::validate)
            .collect::<Result<_, _>>()?;
        Ok(TumblerConfig {
            watch_interval: Duration::from_secs(self.watch_time as u64),
            processes,
        })
    }
}

impl RawProcess {
    fn validate(self) -> Result<ProcessSpec, ConfigError> {
        let start_delay_secs =
            u64::try_from(self.start_time).map_err(|_| ConfigError::Delay {
                command: self.command.clone(),
                field: "start delay",
                value: self.start_time,
            })?;
        if self.end_time < UNWATCHED {
            return Err(ConfigError::Delay {
                command: self.command,
                field: "stop delay",
                value: self.end_time,
            });
        }
        let restart_times = self
            .restart_times
            .iter()
            .map(|time| parse_restart_time(time))
            .collect::<Result<_, _>>()?;
        Ok(ProcessSpec {
            name: self.name,
            command: self.command,
            start_delay_secs,
            stop_delay_secs: self.end_time,
            priority: self.priority.unwrap_or_default(),
            restart_times,
        })
    }
}

/// `<Tumbler watch_time="60"><Process command=".." start_time="1" end_time="2"/></Tumbler>`
#[derive(Debug, Deserialize)]
struct XmlDocument {
    #[serde(rename = "@watch_time")]
    watch_time: i64,
    #[serde(rename = "Process", default)]
    processes: Vec<XmlProcess>,
}

#[derive(Debug, Deserialize)]
struct XmlProcess {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@command")]
    command: String,
    #[serde(rename = "@start_time")]
    start_time: i64,
    #[serde(rename = "@end_time")]
    end_time: i64,
    #[serde(rename = "@priority", default)]
    priority: Option<Priority>,
    /// Comma separated.
    #[serde(rename = "@restart_times", default)]
    restart_times: Option<String>,
}

impl XmlDocument {
    fn into_raw(self) -> RawConfig {
        let processes = self
            .processes
            .into_iter()
            .map(|process| RawProcess {
                name: process.name,
                command: process.command,
                start_time: process.start_time,
                end_time: process.end_time,
                priority: process.priority,
                restart_times: process
                    .restart_times
                    .map(|times| {
                        times
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        RawConfig {
            watch_time: self.watch_time,
            processes,
        }
    }
}
