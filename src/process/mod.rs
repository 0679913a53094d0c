pub mod command_line;
pub mod control;
pub mod types;

use self::command_line::CommandLine;
use self::control::{ChildHandle, ProcessControl};
use self::types::*;
use crate::report::Reporter;
use chrono::{NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// One managed child program and its start/stop/restart state.
pub struct WatchedProcess {
    name: Option<String>,
    command_line: CommandLine,
    start_delay: Duration,
    /// `None` keeps the entry out of liveness checks.
    stop_delay: Option<Duration>,
    priority: Priority,
    restarts: Vec<ScheduledRestart>,

    handle: Option<Box<dyn ChildHandle>>,
    pid: Option<u32>,
    resolved_name: Option<String>,
    started_ok: bool,
    stopped_ok: bool,

    control: Arc<dyn ProcessControl>,
    reporter: Reporter,
}

impl WatchedProcess {
    pub fn new(
        command_line: &str,
        start_delay: Duration,
        stop_delay: Option<Duration>,
        control: Arc<dyn ProcessControl>,
        reporter: Reporter,
    ) -> Self {
        Self {
            name: None,
            command_line: CommandLine::parse(command_line),
            start_delay,
            stop_delay,
            priority: Priority::default(),
            restarts: Vec::new(),
            handle: None,
            pid: None,
            resolved_name: None,
            started_ok: false,
            stopped_ok: false,
            control,
            reporter,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_restart_times(mut self, times: impl IntoIterator<Item = NaiveTime>) -> Self {
        self.restarts = times.into_iter().map(ScheduledRestart::new).collect();
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn restart_times(&self) -> impl Iterator<Item = NaiveTime> + '_ {
        self.restarts.iter().map(|r| r.at)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_ok(&self) -> bool {
        self.started_ok
    }

    pub fn stopped_ok(&self) -> bool {
        self.stopped_ok
    }

    pub fn is_watched(&self) -> bool {
        self.stop_delay.is_some()
    }

    pub fn is_alive(&mut self) -> bool {
        match &mut self.handle {
            Some(handle) => !handle.has_exited(),
            None => false,
        }
    }

    /// Best name available for status lines.
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.resolved_name.as_deref().or(self.name.as_deref()) {
            return name;
        }
        match self.command_line.split() {
            Ok(command) => &command.executable,
            Err(_) => self.command_line.raw(),
        }
    }

    fn pid_label(&self) -> String {
        self.pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into())
    }

    #[instrument(skip(self), fields(name = self.display_name()))]
    pub async fn start(&mut self, stagger: Stagger) {
        self.launch();
        if stagger == Stagger::Wait && !self.start_delay.is_zero() {
            debug!(delay = ?self.start_delay, "Waiting before next start");
            tokio::time::sleep(self.start_delay).await;
        }
    }

    fn launch(&mut self) {
        self.started_ok = false;

        if self.is_alive() {
            self.reporter.status(&format!(
                "Process '{}' PID={} is already running",
                self.display_name(),
                self.pid_label()
            ));
            self.started_ok = true;
            return;
        }

        let command = match self.command_line.split() {
            Ok(command) => command,
            Err(err) => {
                self.reporter.status(&format!(
                    "Invalid command line for process start ({err}): {}",
                    self.command_line.raw()
                ));
                return;
            }
        };

        let mut handle = match self.control.launch(command) {
            Ok(handle) => handle,
            Err(err) => {
                self.reporter.status(&err.to_string());
                return;
            }
        };

        if handle.has_exited() {
            self.reporter
                .status(&format!("Process {} has already exited", command.executable));
            self.handle = Some(handle);
            self.pid = None;
            self.resolved_name = None;
            return;
        }

        if let Err(err) = handle.set_priority(self.priority) {
            warn!(?err, priority = %self.priority, "Failed to apply priority");
        }
        self.pid = handle.pid();
        self.resolved_name = Some(handle.name());
        self.handle = Some(handle);
        self.started_ok = true;
        self.reporter.status(&format!(
            "++ Started process '{}' PID={}",
            self.display_name(),
            self.pid_label()
        ));
    }

    /// Stops the child if there is one. Failures are reported, never returned.
    #[instrument(skip(self), fields(name = self.display_name()))]
    pub async fn try_stop(&mut self, stagger: Stagger) {
        self.stopped_ok = false;
        let name = self.display_name().to_string();
        let pid = self.pid_label();

        match self.handle.take() {
            None => {
                self.reporter
                    .status(&format!("-- Process '{name}' is not running, nothing to stop"));
            }
            Some(mut handle) => match handle.close().await {
                Ok(outcome) => {
                    let line = match outcome {
                        StopOutcome::Closed => format!("-- Stopped process '{name}' PID={pid}"),
                        StopOutcome::Killed => format!(
                            "-- Killed process '{name}' PID={pid} after it ignored the close request"
                        ),
                        StopOutcome::AlreadyExited => {
                            format!("-- Process '{name}' PID={pid} had already exited")
                        }
                    };
                    self.reporter.status(&line);
                    self.stopped_ok = true;
                }
                Err(err) => {
                    self.reporter
                        .status(&format!("!! Failed to stop process '{name}' PID={pid}: {err}"));
                }
            },
        }

        self.pid = None;
        self.resolved_name = None;

        if stagger == Stagger::Wait {
            if let Some(delay) = self.stop_delay.filter(|d| !d.is_zero()) {
                debug!(?delay, "Waiting before next stop");
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Restarts the entry when `now` has passed a configured time of day that
    /// has not fired yet today. Several due times collapse into one restart.
    pub async fn try_restart_at(&mut self, now: NaiveDateTime) -> bool {
        let (today, time) = (now.date(), now.time());
        let due: Vec<usize> = self
            .restarts
            .iter()
            .enumerate()
            .filter(|(_, restart)| restart.is_due(today, time))
            .map(|(index, _)| index)
            .collect();
        if due.is_empty() {
            return false;
        }

        self.reporter.status(&format!(
            "-+ Restarting process '{}' PID={}.",
            self.display_name(),
            self.pid_label()
        ));
        self.try_stop(Stagger::Skip).await;
        self.start(Stagger::Skip).await;

        for index in due {
            self.restarts[index].last_fired = Some(today);
        }
        true
    }
}
