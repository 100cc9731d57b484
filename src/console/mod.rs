//! # Consoles
//!
//! A [`Console`] binds one supervised process to an identity and a
//! [`LogStacker`] recording everything the process prints. The
//! [`ConsoleManager`] keeps the registry of consoles, sweeps closed ones
//! and closes the rest on shutdown.
//!
//! Consoles are never resurrected: once closed, a program has to be started
//! again, which creates a new console with a new identity.

pub mod stacker;
pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ConsoleConfig;
use crate::core::packet::{ConsoleEntry, MAX_STRING_LEN};
use crate::error::{Error, Result};
use crate::program::Program;
use crate::utils::metrics::global_metrics;

pub use stacker::{LogStacker, TrackerId};
pub use supervisor::{Supervisor, SupervisorHandle};

/// Prefix of lines the server itself writes into a console log.
pub const SERVER_LINE_PREFIX: &str = "[procmux]";

/// One supervised process and its captured output.
#[derive(Debug)]
pub struct Console {
    id: Uuid,
    program: Arc<Program>,
    log: Mutex<LogStacker>,
    closed: AtomicBool,
    handle: SupervisorHandle,
}

impl Console {
    /// Launch `program` and start recording its output.
    #[instrument(skip_all, fields(program = %program.name()))]
    pub fn start(program: Arc<Program>, config: &ConsoleConfig) -> Result<Arc<Self>> {
        let loader = program.loader()?;
        let supervisor = Supervisor::spawn(loader.as_ref(), config)?;

        let console = Arc::new(Self {
            id: Uuid::new_v4(),
            program,
            log: Mutex::new(LogStacker::new(config.log_capacity)),
            closed: AtomicBool::new(false),
            handle: supervisor.handle(),
        });

        global_metrics().console_started();
        info!(console = %console.id, pid = ?console.handle.pid(), "Console started");

        tokio::spawn(Arc::clone(&console).forward(supervisor));
        Ok(console)
    }

    /// Copy every output line into the log until the stream ends.
    async fn forward(self: Arc<Self>, mut supervisor: Supervisor) {
        let mut reason = None;

        while let Some(item) = supervisor.line().await {
            match item {
                Ok(line) => self.lock().add(clip_line(line)),
                Err(e) => {
                    warn!(console = %self.id, error = %e, "Process failed");
                    reason = Some(e.to_string());
                }
            }
        }

        if !self.is_closed() {
            let line = match reason {
                Some(reason) => format!("{SERVER_LINE_PREFIX} process exited: {reason}"),
                None => format!("{SERVER_LINE_PREFIX} process exited"),
            };
            self.lock().add(line);
        }
        self.close();
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop forwarding output and input. The process keeps running.
    ///
    /// Returns whether this call closed the console.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handle.close();
        global_metrics().console_closed();
        info!(console = %self.id, program = %self.program.name(), "Console closed");
        true
    }

    /// Kill the process, then close.
    pub fn terminate(&self) -> bool {
        self.handle.kill();
        self.close()
    }

    /// Queue a command line for the process.
    pub async fn send_command(&self, command: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConsoleAlreadyClosed(self.id));
        }
        self.handle
            .send(command)
            .await
            .map_err(|_| Error::ConsoleAlreadyClosed(self.id))
    }

    /// The last `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        self.lock().get(n)
    }

    /// Register a tracker and take the last `backlog` lines in one step, so
    /// no line is both in the backlog and unseen by the tracker.
    pub fn join(&self, backlog: usize) -> (TrackerId, Vec<String>) {
        let mut log = self.lock();
        let lines = log.get(backlog);
        (log.add_tracker(), lines)
    }

    pub fn add_tracker(&self) -> TrackerId {
        self.lock().add_tracker()
    }

    pub fn remove_tracker(&self, tracker: TrackerId) -> bool {
        self.lock().remove_tracker(tracker)
    }

    pub fn tracker_count(&self) -> usize {
        self.lock().tracker_count()
    }

    /// Lines `tracker` has not seen yet, oldest first.
    pub fn read_changes(&self, tracker: TrackerId) -> Vec<String> {
        self.lock().read_all_changes(tracker)
    }

    pub fn entry(&self) -> ConsoleEntry {
        ConsoleEntry {
            console_id: self.id,
            program: self.program.name().to_string(),
            loader: self.program.loader_kind().name().to_string(),
            running: !self.is_closed(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogStacker> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cut a line down to what one string field can carry.
fn clip_line(mut line: String) -> String {
    if line.len() > MAX_STRING_LEN {
        let mut end = MAX_STRING_LEN;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    line
}

/// Registry of every console the server has started.
#[derive(Debug)]
pub struct ConsoleManager {
    consoles: DashMap<Uuid, Arc<Console>>,
    config: ConsoleConfig,
}

impl ConsoleManager {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            consoles: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Start `program` unless it already has a live console.
    pub fn start(&self, program: Arc<Program>) -> Result<Arc<Console>> {
        if self.find_running(program.name()).is_some() {
            return Err(Error::ProgramAlreadyRunning(program.name().to_string()));
        }

        let console = Console::start(program, &self.config)?;
        self.consoles.insert(console.id(), Arc::clone(&console));
        Ok(console)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Console>> {
        self.consoles.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// The live console of `program`, if any.
    pub fn find_running(&self, program: &str) -> Option<Arc<Console>> {
        self.consoles
            .iter()
            .find(|entry| !entry.is_closed() && entry.program().name() == program)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<ConsoleEntry> {
        let mut entries: Vec<ConsoleEntry> =
            self.consoles.iter().map(|entry| entry.entry()).collect();
        entries.sort_by(|a, b| a.program.cmp(&b.program));
        entries
    }

    pub fn len(&self) -> usize {
        self.consoles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consoles.is_empty()
    }

    /// Drop closed consoles from the registry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.consoles.len();
        self.consoles.retain(|_, console| !console.is_closed());
        let removed = before.saturating_sub(self.consoles.len());
        if removed > 0 {
            debug!(removed, "Swept closed consoles");
        }
        removed
    }

    /// Close every registered console.
    pub fn close_all(&self) {
        for entry in self.consoles.iter() {
            entry.close();
        }
    }

    /// Sweep periodically until `cancel` fires, then close everything.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }

        info!(consoles = self.consoles.len(), "Closing consoles");
        self.close_all();
        self.sweep();
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ProgramConfig;
    use std::collections::HashMap;
    use std::time::Duration;

    fn program(name: &str, command: &str) -> Arc<Program> {
        let config = ProgramConfig {
            name: name.to_string(),
            path: std::env::temp_dir(),
            loader: "exec".to_string(),
            options: HashMap::from([("program".to_string(), command.to_string())]),
        };
        Arc::new(Program::from_config(&config).unwrap())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn commands_echo_into_the_log() {
        let manager = ConsoleManager::new(ConsoleConfig::default());
        let console = manager.start(program("echo", "cat")).unwrap();
        let tracker = console.add_tracker();

        console.send_command("say hi".into()).await.unwrap();
        wait_for(|| console.recent(10).len() == 1).await;

        assert_eq!(console.read_changes(tracker), vec!["say hi".to_string()]);
        assert!(console.read_changes(tracker).is_empty());
        assert!(console.terminate());
        assert!(!console.terminate());
    }

    #[test]
    fn long_lines_are_clipped_on_a_char_boundary() {
        let line = "é".repeat(MAX_STRING_LEN);
        let clipped = clip_line(line);
        assert!(clipped.len() <= MAX_STRING_LEN);
        assert!(clipped.chars().all(|c| c == 'é'));
        assert_eq!(clip_line("short".into()), "short");
    }

    #[tokio::test]
    async fn second_start_of_a_running_program_is_rejected() {
        let manager = ConsoleManager::new(ConsoleConfig::default());
        let lobby = program("lobby", "cat");
        let console = manager.start(Arc::clone(&lobby)).unwrap();

        assert!(matches!(
            manager.start(Arc::clone(&lobby)),
            Err(Error::ProgramAlreadyRunning(_))
        ));

        console.terminate();
        let restarted = manager.start(lobby).unwrap();
        assert_ne!(restarted.id(), console.id());
        restarted.terminate();
    }

    #[tokio::test]
    async fn exited_process_closes_console_with_final_line() {
        let manager = ConsoleManager::new(ConsoleConfig::default());
        let console = manager.start(program("broken", "false")).unwrap();

        wait_for(|| console.is_closed()).await;
        let lines = console.recent(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[procmux] process exited: "));

        assert!(matches!(
            console.send_command("ignored".into()).await,
            Err(Error::ConsoleAlreadyClosed(_))
        ));
        assert_eq!(manager.sweep(), 1);
        assert!(manager.get(&console.id()).is_none());
    }

    #[tokio::test]
    async fn run_closes_everything_on_cancel() {
        let manager = Arc::new(ConsoleManager::new(ConsoleConfig::default()));
        let console = manager.start(program("lobby", "cat")).unwrap();
        let cancel = CancellationToken::new();

        let runner = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run(cancel).await })
        };

        cancel.cancel();
        runner.await.unwrap();
        assert!(console.is_closed());
        assert!(manager.is_empty());
    }
}
