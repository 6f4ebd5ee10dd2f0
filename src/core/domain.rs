use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::runnable::RunSpec;

/// How a supervised process ended.
///
/// Variants are declared from least to most severe, so `Ord` picks the worse
/// of two outcomes when two processes finish together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Termination {
    Success,
    Stopped,
    Failed,
    Signaled,
    MemoryExceeded,
    TimedOut,
}

impl Termination {
    pub fn severity(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == Termination::Success
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Termination::Success => "success",
            Termination::Stopped => "stop",
            Termination::Failed => "failed",
            Termination::Signaled => "signal",
            Termination::MemoryExceeded => "memory",
            Termination::TimedOut => "timeout",
        };
        f.write_str(name)
    }
}

/// Everything a finished run reports back to its controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
    pub peak_memory_bytes: u64,
    pub spawned: bool,
}

impl RunOutcome {
    pub(crate) fn not_started(termination: Termination) -> Self {
        Self {
            termination,
            exit_code: None,
            signal: None,
            elapsed: Duration::ZERO,
            peak_memory_bytes: 0,
            spawned: false,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    /// True when the process did not end through a regular exit code.
    pub fn is_abnormal_exit(&self) -> bool {
        self.exit_code.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Pending,
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimit,
    MemoryLimit,
    CompileError,
    NotApplicable,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Verdict::Pending => "PD",
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::RuntimeError => "RE",
            Verdict::TimeLimit => "TLE",
            Verdict::MemoryLimit => "MLE",
            Verdict::CompileError => "CE",
            Verdict::NotApplicable => "NA",
        };
        f.write_str(code)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildStep {
    pub source: PathBuf,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// A program taking part in judging: how to run it and, optionally, how to
/// build it first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub build: Option<BuildStep>,
    pub run: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Program {
    pub fn command<I, S>(run: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            build: None,
            run: run.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn with_build(mut self, build: BuildStep) -> Self {
        self.build = Some(build);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn run_spec(&self, limits: &ExecutionLimits) -> RunSpec {
        let spec = RunSpec::new(self.run.iter().cloned()).limits(limits);
        match &self.cwd {
            Some(cwd) => spec.cwd(cwd),
            None => spec,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Testcase {
    pub input: String,
    pub answer: Option<String>,
    /// Data the interactor needs before judging starts. `None` means it has
    /// not arrived yet and will be supplied while the session runs.
    pub secret: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Solution,
    Interactor,
    Generator,
    Reference,
    Compiler,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Solution => "solution",
            Role::Interactor => "interactor",
            Role::Generator => "generator",
            Role::Reference => "reference",
            Role::Compiler => "compiler",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JudgeState {
    Idle,
    Compiling,
    Running,
    Stopped,
    Judged(Verdict),
}

impl JudgeState {
    pub fn verdict(&self) -> Verdict {
        match self {
            JudgeState::Judged(verdict) => *verdict,
            JudgeState::Stopped => Verdict::NotApplicable,
            JudgeState::Idle | JudgeState::Compiling | JudgeState::Running => Verdict::Pending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JudgeEvent {
    State(JudgeState),
    Chunk {
        role: Role,
        stream: StreamKind,
        data: Bytes,
    },
    Iteration {
        index: u64,
        seed: u64,
    },
}

/// Where controllers report progress. A dropped receiver is not an error.
pub type EventSink = UnboundedSender<JudgeEvent>;

pub(crate) fn emit(sink: &EventSink, event: JudgeEvent) {
    let _ = sink.send(event);
}

pub(crate) fn emit_chunk(sink: &EventSink, role: Role, stream: StreamKind, data: &Bytes) {
    emit(
        sink,
        JudgeEvent::Chunk {
            role,
            stream,
            data: data.clone(),
        },
    );
}
