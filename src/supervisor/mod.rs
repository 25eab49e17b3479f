//! Restart supervisor.
//!
//! When the adapter cannot be recovered in-process, the supervisor replaces
//! the running image with a fresh copy of itself (`execve`, no fork), so two
//! processes never hold the adapter at the same time. The only state handed
//! over is the queue directory and the decremented restart budget, both in
//! the environment; the queue is closed without deleting its log so the new
//! process replays whatever was not delivered.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::queue::DurableQueue;
use crate::types::{QUEUE_DIR_ENV, RESTART_BUDGET_ENV};

/// Everything needed to start the replacement image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub program: PathBuf,
    /// Full argv, including argv[0], copied verbatim.
    pub args: Vec<OsString>,
    /// Variables added on top of the inherited environment.
    pub env: Vec<(OsString, OsString)>,
}

/// Replaces the current process image.
pub trait ProcessImage: Send + Sync + fmt::Debug {
    /// Only returns if the replacement did not happen.
    fn replace(&self, plan: &ExecPlan) -> io::Result<()>;
}

/// `execve` into the plan; never returns on success.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfExec;

#[cfg(unix)]
impl ProcessImage for SelfExec {
    fn replace(&self, plan: &ExecPlan) -> io::Result<()> {
        use std::os::unix::process::CommandExt;

        let mut command = std::process::Command::new(&plan.program);
        if let Some((arg0, rest)) = plan.args.split_first() {
            command.arg0(arg0).args(rest);
        }
        command.envs(plan.env.iter().map(|(k, v)| (k, v)));
        Err(command.exec())
    }
}

#[cfg(not(unix))]
impl ProcessImage for SelfExec {
    fn replace(&self, _plan: &ExecPlan) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-place restart requires a unix platform",
        ))
    }
}

/// Owner of the self-restart boundary.
#[derive(Debug)]
pub struct RestartSupervisor {
    image: Box<dyn ProcessImage>,
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl RestartSupervisor {
    /// Supervisor that re-executes the current binary with the current argv.
    pub fn new() -> Self {
        Self {
            image: Box::new(SelfExec),
            program: None,
            args: std::env::args_os().collect(),
        }
    }

    /// Supervisor with an explicit image, program and argv.
    pub fn with_image(image: Box<dyn ProcessImage>, program: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            image,
            program: Some(program),
            args,
        }
    }

    /// Replace the process to recover from an unusable adapter.
    ///
    /// Returns `false` right away, with no side effects, when
    /// `budget_remaining` is zero; the caller must treat that as fatal.
    /// Otherwise the queue is closed (log kept) and the image replaced. With
    /// the real image this call does not return on success, so `false` after
    /// that point means the replacement failed and is equally fatal. `true`
    /// is only seen with an image that records the plan instead of running it.
    pub async fn restart(&self, queue: &DurableQueue, budget_remaining: u32) -> bool {
        if budget_remaining == 0 {
            tracing::error!("No process restarts remaining, cannot restart");
            return false;
        }

        let program = match &self.program {
            Some(program) => program.clone(),
            None => match std::env::current_exe() {
                Ok(program) => program,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to get executable path, cannot restart");
                    return false;
                }
            },
        };

        let remaining = budget_remaining - 1;
        tracing::warn!(
            budget = remaining,
            queue_dir = %queue.dir().display(),
            "Restarting process"
        );

        if let Err(e) = queue.close(false).await {
            tracing::error!(error = %e, "Failed to close queue before restart");
        }

        let plan = ExecPlan {
            program,
            args: self.args.clone(),
            env: vec![
                (
                    OsString::from(QUEUE_DIR_ENV),
                    queue.dir().as_os_str().to_os_string(),
                ),
                (
                    OsString::from(RESTART_BUDGET_ENV),
                    OsString::from(remaining.to_string()),
                ),
            ],
        };

        match self.image.replace(&plan) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    program = %plan.program.display(),
                    error = %e,
                    "Failed to restart"
                );
                false
            }
        }
    }
}

impl Default for RestartSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Image that records plans instead of running them.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingImage {
    pub(crate) plans: std::sync::Arc<parking_lot::Mutex<Vec<ExecPlan>>>,
    pub(crate) fail: bool,
}

#[cfg(test)]
impl ProcessImage for RecordingImage {
    fn replace(&self, plan: &ExecPlan) -> io::Result<()> {
        self.plans.lock().push(plan.clone());
        if self.fail {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "exec denied"))
        } else {
            Ok(())
        }
    }
}
