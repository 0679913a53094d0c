use crate::process::types::Stagger;
use crate::process::WatchedProcess;
use crate::report::Reporter;
use chrono::{Local, NaiveDateTime};
use clap::ValueEnum;
use color_eyre::eyre::bail;
use color_eyre::Result;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, instrument};

/// Requests delivered to the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Stop every process, then exit.
    Shutdown,
    /// Exit right away and leave the processes running.
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Stopped,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StopOrder {
    /// Same order as startup.
    Forward,
    /// Last started, first stopped.
    #[default]
    Reverse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub group_restarted: bool,
    pub scheduled_restarts: usize,
}

pub struct Supervisor {
    processes: Vec<WatchedProcess>,
    watch_interval: Duration,
    stop_order: StopOrder,
    first_start: bool,
    reporter: Reporter,
}

impl Supervisor {
    pub fn new(
        processes: Vec<WatchedProcess>,
        watch_interval: Duration,
        stop_order: StopOrder,
        reporter: Reporter,
    ) -> Self {
        Self {
            processes,
            watch_interval,
            stop_order,
            first_start: true,
            reporter,
        }
    }

    /// Starts every process in order, waiting out each start delay.
    /// Returns whether all of them came up.
    pub async fn start_all(&mut self) -> bool {
        if self.first_start {
            self.reporter.status("First start...");
        }
        for process in &mut self.processes {
            process.start(Stagger::Wait).await;
        }
        self.first_start = false;
        self.processes.iter().all(WatchedProcess::started_ok)
    }

    pub async fn stop_all(&mut self) {
        match self.stop_order {
            StopOrder::Forward => {
                for process in self.processes.iter_mut() {
                    process.try_stop(Stagger::Wait).await;
                }
            }
            StopOrder::Reverse => {
                for process in self.processes.iter_mut().rev() {
                    process.try_stop(Stagger::Wait).await;
                }
            }
        }
        let unconfirmed = self.processes.iter().filter(|p| !p.stopped_ok()).count();
        debug!(unconfirmed, "Group stopped");
    }

    /// Indices of watched processes that are no longer alive.
    pub fn dead_watched(&mut self) -> Vec<usize> {
        self.processes
            .iter_mut()
            .enumerate()
            .filter_map(|(index, process)| {
                (process.is_watched() && !process.is_alive()).then_some(index)
            })
            .collect()
    }

    pub async fn poll(&mut self) -> PollOutcome {
        self.poll_at(Local::now().naive_local()).await
    }

    /// One watch iteration: restarts the whole group if a watched process
    /// died, then runs the scheduled daily restarts.
    #[instrument(skip(self))]
    pub async fn poll_at(&mut self, now: NaiveDateTime) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        let dead = self.dead_watched();
        if !dead.is_empty() {
            for index in dead {
                let process = &self.processes[index];
                let pid = process
                    .pid()
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".into());
                self.reporter.status(&format!(
                    "No process '{}' PID={pid}. Stopping remaining list...",
                    process.display_name()
                ));
            }
            self.stop_all().await;
            self.reporter.status("Remaining processes stopped. Restarting...");
            let all_started = self.start_all().await;
            if all_started {
                self.reporter.status("Process list restart complete.");
            } else {
                self.reporter
                    .status("Process list restart incomplete, retrying on next check.");
            }
            outcome.group_restarted = true;
        }

        for process in &mut self.processes {
            if process.try_restart_at(now).await {
                outcome.scheduled_restarts += 1;
            }
        }
        outcome
    }

    /// Boots the group and watches it until a [`Control`] arrives.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut controls: UnboundedReceiver<Control>) -> Result<Exit> {
        if !self.start_all().await {
            self.reporter
                .status("Some processes failed to start. Stopping the ones that did...");
            self.stop_all().await;
            bail!("Startup aborted: not every process could be started");
        }
        info!(
            processes = self.processes.len(),
            interval = ?self.watch_interval,
            "Watching processes"
        );

        loop {
            let outcome = self.poll().await;
            debug!(
                group_restarted = outcome.group_restarted,
                scheduled_restarts = outcome.scheduled_restarts,
                "Poll complete"
            );
            select! {
                biased;
                control = controls.recv() => match control {
                    Some(Control::Detach) => {
                        self.reporter.status("Exiting, processes are kept running.");
                        return Ok(Exit::Detached);
                    }
                    Some(Control::Shutdown) | None => break,
                },
                _ = tokio::time::sleep(self.watch_interval) => {}
            }
        }

        self.reporter.status("Exit sequence. Stopping all processes...");
        self.stop_all().await;
        self.reporter.status("Processes stopped. Exiting...");
        Ok(Exit::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeControl;
    use crate::report::testing::RecordingReporter;
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Fixture {
        control: FakeControl,
        reporter: Arc<RecordingReporter>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                control: FakeControl::new(),
                reporter: Arc::new(RecordingReporter::default()),
            }
        }

        fn process(&self, command: &str, start: u64, stop: Option<u64>) -> WatchedProcess {
            WatchedProcess::new(
                command,
                Duration::from_secs(start),
                stop.map(Duration::from_secs),
                Arc::new(self.control.clone()),
                self.reporter.clone(),
            )
        }

        fn supervisor(&self, processes: Vec<WatchedProcess>, order: StopOrder) -> Supervisor {
            Supervisor::new(
                processes,
                Duration::from_secs(1),
                order,
                self.reporter.clone(),
            )
        }
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_is_staggered() {
        let fixture = Fixture::new();
        let mut supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 1, Some(2)),
                fixture.process("b", 0, None),
            ],
            StopOrder::Reverse,
        );

        let before = Instant::now();
        assert!(supervisor.start_all().await);
        let elapsed = before.elapsed();

        assert_eq!(fixture.control.launches(), vec!["a", "b"]);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(fixture.reporter.count_containing("First start"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watched_death_restarts_group() {
        let fixture = Fixture::new();
        let mut supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 1, Some(2)),
                fixture.process("b", 0, None),
            ],
            StopOrder::Reverse,
        );
        supervisor.start_all().await;

        assert_eq!(supervisor.poll_at(noon()).await, PollOutcome::default());

        fixture.control.crash("a");
        assert_eq!(supervisor.dead_watched(), vec![0]);
        let outcome = supervisor.poll_at(noon()).await;

        assert!(outcome.group_restarted);
        assert_eq!(fixture.control.closes(), vec!["b", "a"]);
        assert_eq!(fixture.control.launches(), vec!["a", "b", "a", "b"]);
        assert_eq!(fixture.control.running("a"), 1);
        assert_eq!(fixture.control.running("b"), 1);
        assert!(supervisor.dead_watched().is_empty());
        assert_eq!(fixture.reporter.count_containing("No process 'a'"), 1);
        assert_eq!(fixture.reporter.count_containing("First start"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_death_never_restarts_group() {
        let fixture = Fixture::new();
        let mut supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 1, Some(2)),
                fixture.process("b", 0, None),
            ],
            StopOrder::Reverse,
        );
        supervisor.start_all().await;

        fixture.control.crash("b");
        for _ in 0..5 {
            assert!(supervisor.dead_watched().is_empty());
            assert!(!supervisor.poll_at(noon()).await.group_restarted);
        }
        assert_eq!(fixture.control.launches().len(), 2);
        assert!(fixture.control.closes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_stop_order() {
        let fixture = Fixture::new();
        let mut supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 0, Some(0)),
                fixture.process("b", 0, Some(0)),
                fixture.process("c", 0, Some(0)),
            ],
            StopOrder::Forward,
        );
        supervisor.start_all().await;
        supervisor.stop_all().await;

        assert_eq!(fixture.control.closes(), vec!["a", "b", "c"]);
        assert_eq!(fixture.reporter.count_containing("-- Stopped process"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_waits_only_for_watched() {
        let fixture = Fixture::new();
        let mut supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 0, Some(3)),
                fixture.process("b", 0, None),
            ],
            StopOrder::Reverse,
        );
        supervisor.start_all().await;

        let before = Instant::now();
        supervisor.stop_all().await;
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_restart_runs_independently() {
        let fixture = Fixture::new();
        let scheduled = fixture
            .process("a", 0, Some(0))
            .with_restart_times([NaiveTime::from_hms_opt(6, 0, 0).unwrap()]);
        let mut supervisor = fixture.supervisor(
            vec![scheduled, fixture.process("b", 0, Some(0))],
            StopOrder::Reverse,
        );
        supervisor.start_all().await;

        let outcome = supervisor.poll_at(noon()).await;
        assert!(!outcome.group_restarted);
        assert_eq!(outcome.scheduled_restarts, 1);

        for _ in 0..3 {
            assert_eq!(supervisor.poll_at(noon()).await.scheduled_restarts, 0);
        }
        assert_eq!(fixture.control.launches(), vec!["a", "b", "a"]);
        assert_eq!(fixture.control.closes(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_shutdown_stops_everything() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 0, Some(1)),
                fixture.process("b", 0, Some(1)),
            ],
            StopOrder::Reverse,
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervisor.run(receiver));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        sender.send(Control::Shutdown).unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Exit::Stopped);
        assert_eq!(fixture.control.closes(), vec!["b", "a"]);
        assert_eq!(fixture.control.running("a"), 0);
        assert_eq!(fixture.control.running("b"), 0);
        assert_eq!(fixture.reporter.count_containing("Exit sequence"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_restarts_group_between_polls() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 1, Some(2)),
                fixture.process("b", 0, None),
            ],
            StopOrder::Reverse,
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervisor.run(receiver));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fixture.control.launches(), vec!["a", "b"]);

        fixture.control.crash("a");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fixture.control.launches(), vec!["a", "b", "a", "b"]);

        sender.send(Control::Shutdown).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), Exit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_checks_before_first_interval() {
        let fixture = Fixture::new();
        // Midnight is always due, so the first poll restarts the entry
        let process = fixture
            .process("a", 0, Some(0))
            .with_restart_times([NaiveTime::from_hms_opt(0, 0, 0).unwrap()]);
        let supervisor = Supervisor::new(
            vec![process],
            Duration::from_secs(60),
            StopOrder::Reverse,
            fixture.reporter.clone(),
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervisor.run(receiver));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.control.launches(), vec!["a", "a"]);

        sender.send(Control::Shutdown).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), Exit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_detach_keeps_processes() {
        let fixture = Fixture::new();
        let supervisor =
            fixture.supervisor(vec![fixture.process("a", 0, Some(1))], StopOrder::Reverse);
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(Control::Detach).unwrap();

        assert_eq!(supervisor.run(receiver).await.unwrap(), Exit::Detached);
        assert!(fixture.control.closes().is_empty());
        assert_eq!(fixture.control.running("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_aborts_when_a_process_fails_to_start() {
        let fixture = Fixture::new();
        fixture.control.set_missing("ghost");
        let supervisor = fixture.supervisor(
            vec![
                fixture.process("a", 0, Some(0)),
                fixture.process("ghost", 0, Some(0)),
            ],
            StopOrder::Reverse,
        );
        let (_sender, receiver) = mpsc::unbounded_channel();

        assert!(supervisor.run(receiver).await.is_err());
        assert_eq!(fixture.control.running("a"), 0);
        assert_eq!(fixture.control.closes(), vec!["a"]);
        assert_eq!(fixture.reporter.count_containing("File ghost not found."), 1);
    }
}
