//! Escalating termination of process groups.
//!
//! Graceful signal to every target, a fixed grace interval, then a forceful
//! signal to whatever survived. Each stage is recorded so callers (and tests)
//! can see exactly how far the escalation went.

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default wait between the graceful and forceful signals.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl From<KillSignal> for Signal {
    fn from(signal: KillSignal) -> Self {
        match signal {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Signal delivery, abstracted so escalation can be driven without real processes.
pub trait Signaller: Send + Sync {
    /// Signal the process group led by `pid` (or `pid` alone if it has none).
    fn signal_group(&self, pid: i32, signal: KillSignal) -> bool;
    /// Signal exactly one process.
    fn signal_process(&self, pid: i32, signal: KillSignal) -> bool;
    fn is_alive(&self, pid: i32) -> bool;
}

/// Real signal delivery via `nix`.
#[derive(Debug, Default)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn signal_group(&self, pid: i32, signal: KillSignal) -> bool {
        let target = Pid::from_raw(pid);
        match getpgid(Some(target)) {
            // Never take down our own group.
            Ok(pgid) if pgid != getpgrp() => {
                killpg(pgid, Signal::from(signal)).is_ok() || self.signal_process(pid, signal)
            }
            _ => self.signal_process(pid, signal),
        }
    }

    fn signal_process(&self, pid: i32, signal: KillSignal) -> bool {
        kill(Pid::from_raw(pid), Signal::from(signal)).is_ok()
    }

    fn is_alive(&self, pid: i32) -> bool {
        kill(Pid::from_raw(pid), None::<Signal>).is_ok()
    }
}

/// Escalation stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Signalling,
    Grace,
    Forcing,
    Finished,
}

/// Outcome of one escalation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Stages visited, ending in `Finished`.
    pub stages: Vec<Stage>,
    /// Targets that accepted the graceful signal.
    pub signalled: Vec<i32>,
    /// Targets still alive after the grace interval.
    pub survivors: Vec<i32>,
    /// Survivors that accepted the forceful signal.
    pub forced: Vec<i32>,
}

impl TerminationReport {
    pub fn escalated(&self) -> bool {
        self.stages.contains(&Stage::Forcing)
    }
}

/// Graceful-then-forceful termination state machine.
#[derive(Clone)]
pub struct Escalation {
    signaller: Arc<dyn Signaller>,
    grace: Duration,
}

impl Escalation {
    pub fn new(signaller: Arc<dyn Signaller>, grace: Duration) -> Self {
        Self { signaller, grace }
    }

    pub fn signaller(&self) -> &Arc<dyn Signaller> {
        &self.signaller
    }

    /// Drive every pid in `pids` to termination.
    pub async fn run(&self, pids: &[i32]) -> TerminationReport {
        let mut report = TerminationReport::default();
        let mut stage = Stage::Signalling;

        loop {
            report.stages.push(stage);
            stage = match stage {
                Stage::Signalling => {
                    for &pid in pids {
                        if self.signaller.signal_group(pid, KillSignal::Terminate) {
                            report.signalled.push(pid);
                        }
                    }
                    if pids.is_empty() {
                        Stage::Finished
                    } else {
                        Stage::Grace
                    }
                }
                Stage::Grace => {
                    tokio::time::sleep(self.grace).await;
                    report.survivors = pids
                        .iter()
                        .copied()
                        .filter(|&pid| self.signaller.is_alive(pid))
                        .collect();
                    if report.survivors.is_empty() {
                        Stage::Finished
                    } else {
                        Stage::Forcing
                    }
                }
                Stage::Forcing => {
                    for &pid in &report.survivors {
                        if self.signaller.signal_group(pid, KillSignal::Kill) {
                            report.forced.push(pid);
                        }
                    }
                    info!(forced = ?report.forced, "escalated to SIGKILL");
                    Stage::Finished
                }
                Stage::Finished => break,
            };
        }

        debug!(?report, "termination finished");
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory process table. Pids in `stubborn` ignore SIGTERM.
    #[derive(Default)]
    pub(crate) struct FakeSignaller {
        pub alive: Mutex<HashSet<i32>>,
        pub stubborn: HashSet<i32>,
        pub log: Mutex<Vec<(i32, KillSignal)>>,
    }

    impl FakeSignaller {
        pub fn with(alive: &[i32], stubborn: &[i32]) -> Self {
            Self {
                alive: Mutex::new(alive.iter().copied().collect()),
                stubborn: stubborn.iter().copied().collect(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn deliver(&self, pid: i32, signal: KillSignal) -> bool {
            self.log.lock().unwrap().push((pid, signal));
            let mut alive = self.alive.lock().unwrap();
            if !alive.contains(&pid) {
                return false;
            }
            if signal == KillSignal::Kill || !self.stubborn.contains(&pid) {
                alive.remove(&pid);
            }
            true
        }
    }

    impl Signaller for FakeSignaller {
        fn signal_group(&self, pid: i32, signal: KillSignal) -> bool {
            self.deliver(pid, signal)
        }

        fn signal_process(&self, pid: i32, signal: KillSignal) -> bool {
            self.deliver(pid, signal)
        }

        fn is_alive(&self, pid: i32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    #[tokio::test]
    async fn cooperative_targets_stop_at_grace() {
        let fake = Arc::new(FakeSignaller::with(&[10, 11], &[]));
        let escalation = Escalation::new(fake.clone(), Duration::from_millis(5));

        let report = escalation.run(&[10, 11]).await;
        assert_eq!(
            report.stages,
            vec![Stage::Signalling, Stage::Grace, Stage::Finished]
        );
        assert_eq!(report.signalled, vec![10, 11]);
        assert!(report.survivors.is_empty());
        assert!(!report.escalated());
    }

    #[tokio::test]
    async fn survivors_are_forced() {
        let fake = Arc::new(FakeSignaller::with(&[20, 21, 22], &[21]));
        let escalation = Escalation::new(fake.clone(), Duration::from_millis(5));

        let report = escalation.run(&[20, 21, 22]).await;
        assert_eq!(report.survivors, vec![21]);
        assert_eq!(report.forced, vec![21]);
        assert_eq!(report.stages.last(), Some(&Stage::Finished));
        assert!(report.escalated());
        assert!(fake.alive.lock().unwrap().is_empty());

        let log = fake.log.lock().unwrap();
        let kills: Vec<_> = log
            .iter()
            .filter(|(_, s)| *s == KillSignal::Kill)
            .collect();
        assert_eq!(kills, vec![&(21, KillSignal::Kill)]);
    }

    #[tokio::test]
    async fn already_dead_targets_are_not_signalled() {
        let fake = Arc::new(FakeSignaller::with(&[], &[]));
        let escalation = Escalation::new(fake, Duration::from_millis(5));
        let report = escalation.run(&[30]).await;
        assert!(report.signalled.is_empty());
        assert!(report.survivors.is_empty());
    }

    #[tokio::test]
    async fn empty_target_list_skips_grace() {
        let fake = Arc::new(FakeSignaller::default());
        let escalation = Escalation::new(fake, Duration::from_secs(60));
        let report = escalation.run(&[]).await;
        assert_eq!(report.stages, vec![Stage::Signalling, Stage::Finished]);
    }
}
