use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::core::domain::{
    EventSink, ExecutionLimits, JudgeEvent, JudgeState, Program, Role, RunOutcome, Testcase,
    Verdict, emit,
};
use crate::core::pipeline::{JudgeError, LiveRuns, SessionGuard};
use crate::core::pipeline::compiling::{CompileStage, compile_programs};
use crate::core::pipeline::conversation::Conversation;
use crate::core::pipeline::relay::SecretGate;
use crate::core::runnable::{RunError, Runnable};
use crate::core::traits::compiler::Compiler;
use crate::core::traits::sampler::ProcessSampler;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractiveProblem {
    pub solution: Program,
    pub interactor: Program,
    /// The time limit applies to both processes, the memory limit only to
    /// the solution.
    pub limits: ExecutionLimits,
}

/// Everything that crossed the pipes during a dialogue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transcript {
    /// Interactor output and operator input, in the order the solution got it.
    pub solution_input: Vec<u8>,
    pub solution_output: Vec<u8>,
    pub solution_stderr: Vec<u8>,
    pub interactor_stderr: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractiveReport {
    pub state: JudgeState,
    pub verdict: Verdict,
    pub solution: Option<RunOutcome>,
    pub interactor: Option<RunOutcome>,
    pub transcript: Transcript,
}

impl InteractiveReport {
    fn without_run(state: JudgeState) -> Self {
        Self {
            state,
            verdict: state.verdict(),
            solution: None,
            interactor: None,
            transcript: Transcript::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InteractiveJudge {
    compiler: Arc<dyn Compiler>,
    sampler: Arc<dyn ProcessSampler>,
    settings: Settings,
}

impl InteractiveJudge {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        sampler: Arc<dyn ProcessSampler>,
        settings: Settings,
    ) -> Self {
        Self {
            compiler,
            sampler,
            settings,
        }
    }

    /// Starts judging one testcase in the background. When the testcase has
    /// no secret yet, the interactor gets no input until
    /// [`InteractiveSession::provide_secret`] is called.
    pub fn start(
        &self,
        problem: InteractiveProblem,
        testcase: &Testcase,
        sink: EventSink,
    ) -> Result<InteractiveSession, RunError> {
        if problem.solution.run.is_empty() || problem.interactor.run.is_empty() {
            return Err(RunError::EmptyCommand);
        }

        let gate = match &testcase.secret {
            Some(secret) => SecretGate::resolved(secret.clone()),
            None => SecretGate::new(),
        };
        let guard = SessionGuard::new();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let dialogue = Dialogue {
            problem,
            compiler: self.compiler.clone(),
            sampler: self.sampler.clone(),
            settings: self.settings.clone(),
            gate: gate.clone(),
            stop: guard.token().clone(),
            live: guard.live().clone(),
            sink,
        };
        let task = tokio::spawn(dialogue.drive(input_rx));

        Ok(InteractiveSession {
            input: SessionInput {
                gate,
                input: input_tx,
            },
            task,
            guard,
        })
    }
}

/// Clonable input side of an [`InteractiveSession`].
#[derive(Clone, Debug)]
pub struct SessionInput {
    gate: SecretGate,
    input: mpsc::UnboundedSender<Bytes>,
}

impl SessionInput {
    /// Opens the secret gate. Returns false if a secret was already set.
    pub fn provide_secret(&self, secret: impl Into<Bytes>) -> bool {
        self.gate.resolve(secret)
    }

    /// Operator input for the solution, delivered after the secret gate.
    pub fn send_input(&self, data: impl Into<Bytes>) -> bool {
        self.input.send(data.into()).is_ok()
    }
}

/// A running interactive judgement. Dropping it, or dropping an unfinished
/// [`finish`](Self::finish), kills both processes on the spot.
#[derive(Debug)]
pub struct InteractiveSession {
    input: SessionInput,
    task: JoinHandle<Result<InteractiveReport, RunError>>,
    guard: SessionGuard,
}

impl InteractiveSession {
    pub fn provide_secret(&self, secret: impl Into<Bytes>) -> bool {
        self.input.provide_secret(secret)
    }

    pub fn send_input(&self, data: impl Into<Bytes>) -> bool {
        self.input.send_input(data)
    }

    pub fn input(&self) -> SessionInput {
        self.input.clone()
    }

    pub fn stop(&self) {
        self.guard.token().cancel();
    }

    /// Token that stops the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.guard.token().clone()
    }

    pub async fn finish(self) -> Result<InteractiveReport, JudgeError> {
        let Self {
            task,
            guard: _guard,
            ..
        } = self;
        match task.await {
            Ok(report) => Ok(report?),
            Err(e) => Err(JudgeError::Panicked(e.to_string())),
        }
    }
}

struct Dialogue {
    problem: InteractiveProblem,
    compiler: Arc<dyn Compiler>,
    sampler: Arc<dyn ProcessSampler>,
    settings: Settings,
    gate: SecretGate,
    stop: CancellationToken,
    live: LiveRuns,
    sink: EventSink,
}

impl Dialogue {
    #[tracing::instrument(skip_all)]
    async fn drive(
        self,
        mut input: mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<InteractiveReport, RunError> {
        emit(&self.sink, JudgeEvent::State(JudgeState::Compiling));
        let programs = [
            (Role::Solution, &self.problem.solution),
            (Role::Interactor, &self.problem.interactor),
        ];
        match compile_programs(&*self.compiler, &programs, &self.stop, &self.sink).await {
            CompileStage::Ready => {}
            CompileStage::Rejected { verdict, .. } => {
                return Ok(self.finish_early(JudgeState::Judged(verdict)));
            }
            CompileStage::Stopped => return Ok(self.finish_early(JudgeState::Stopped)),
        }
        if self.stop.is_cancelled() {
            return Ok(self.finish_early(JudgeState::Stopped));
        }
        emit(&self.sink, JudgeEvent::State(JudgeState::Running));

        let limits = &self.problem.limits;
        let interactor_limits = ExecutionLimits {
            time_ms: limits.time_ms,
            memory_bytes: None,
        };
        let mut solution = Runnable::new("solution", self.sampler.clone())
            .with_sample_interval(self.settings.sample_interval);
        let mut interactor = Runnable::new("interactor", self.sampler.clone())
            .with_sample_interval(self.settings.sample_interval);

        let solution_events = solution.run(self.problem.solution.run_spec(limits))?;
        let interactor_events = interactor.run(self.problem.interactor.run_spec(&interactor_limits))?;
        let (Some(solution_handle), Some(interactor_handle)) =
            (solution.handle().cloned(), interactor.handle().cloned())
        else {
            return Err(RunError::EmptyCommand);
        };
        self.live.track(&solution_handle);
        self.live.track(&interactor_handle);

        let mut streams = StreamMap::new();
        streams.insert(Role::Solution, solution_events.into_stream());
        streams.insert(Role::Interactor, interactor_events.into_stream());

        let mut conversation = Conversation::new(
            solution_handle.clone(),
            interactor_handle.clone(),
            Role::Interactor,
            self.gate.clone(),
            self.sink.clone(),
        );

        let mut stopped = false;
        let mut input_open = true;
        loop {
            tokio::select! {
                next = streams.next() => match next {
                    Some((role, event)) => conversation.handle(role, event),
                    None => break,
                },
                data = input.recv(), if input_open => match data {
                    Some(data) => conversation.operator_input(data),
                    None => input_open = false,
                },
                _ = self.stop.cancelled(), if !stopped => {
                    tracing::debug!("interactive session stopped");
                    stopped = true;
                    conversation.stop();
                }
            }
        }

        let solution_outcome = solution_handle.done().await;
        let interactor_outcome = interactor_handle.done().await;
        let state = if stopped {
            JudgeState::Stopped
        } else {
            JudgeState::Judged(conversation.verdict(
                &solution_outcome,
                &interactor_outcome,
                self.settings.abnormal_exit_policy,
            ))
        };
        tracing::info!(
            verdict = %state.verdict(),
            solution = %solution_outcome.termination,
            interactor = %interactor_outcome.termination,
            "interactive testcase judged"
        );
        emit(&self.sink, JudgeEvent::State(state));

        Ok(InteractiveReport {
            state,
            verdict: state.verdict(),
            solution: Some(solution_outcome),
            interactor: Some(interactor_outcome),
            transcript: conversation.into_transcript(),
        })
    }

    fn finish_early(&self, state: JudgeState) -> InteractiveReport {
        emit(&self.sink, JudgeEvent::State(state));
        InteractiveReport::without_run(state)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::domain::{BuildStep, StreamKind, Termination};
    use crate::core::traits::compiler::{CompileError, MockCompiler};
    use crate::native::sampler::NoopSampler;

    fn judge() -> InteractiveJudge {
        let mut compiler = MockCompiler::new();
        compiler.expect_compile().return_const(Ok(()));
        judge_with(compiler)
    }

    fn judge_with(compiler: MockCompiler) -> InteractiveJudge {
        let settings = Settings {
            sample_interval: Duration::from_millis(20),
            ..Settings::default()
        };
        InteractiveJudge::new(Arc::new(compiler), Arc::new(NoopSampler), settings)
    }

    fn sh(script: &str) -> Program {
        Program::command(["sh", "-c", script])
    }

    fn problem(solution: &str, interactor: &str) -> InteractiveProblem {
        InteractiveProblem {
            solution: sh(solution),
            interactor: sh(interactor),
            limits: ExecutionLimits {
                time_ms: Some(5000),
                memory_bytes: None,
            },
        }
    }

    fn with_secret(secret: &str) -> Testcase {
        Testcase {
            secret: Some(secret.to_string()),
            ..Testcase::default()
        }
    }

    // Reads the secret number, tells the solution "go", checks its answer.
    const GUESSING_INTERACTOR: &str =
        "read secret; echo go; read answer; [ \"$answer\" = \"$secret\" ] || exit 1";

    #[tokio::test]
    async fn test_correct_dialogue_is_accepted() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let session = judge()
            .start(
                problem("read cmd; echo 42", GUESSING_INTERACTOR),
                &with_secret("42\n"),
                sink,
            )
            .unwrap();

        let report = session.finish().await.unwrap();
        assert_eq!(report.verdict, Verdict::Accepted);
        assert_eq!(report.state, JudgeState::Judged(Verdict::Accepted));
        assert_eq!(report.transcript.solution_input, b"go\n");
        assert_eq!(report.transcript.solution_output, b"42\n");

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let JudgeEvent::State(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                JudgeState::Compiling,
                JudgeState::Running,
                JudgeState::Judged(Verdict::Accepted),
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_guess_is_wrong_answer() {
        let (sink, _events) = mpsc::unbounded_channel();
        let session = judge()
            .start(
                problem("read cmd; echo 7", GUESSING_INTERACTOR),
                &with_secret("42\n"),
                sink,
            )
            .unwrap();

        let report = session.finish().await.unwrap();
        assert_eq!(report.verdict, Verdict::WrongAnswer);
        assert_eq!(
            report.interactor.unwrap().termination,
            Termination::Failed
        );
    }

    #[tokio::test]
    async fn test_late_secret_reaches_interactor_first() {
        let (sink, _events) = mpsc::unbounded_channel();
        // The solution speaks first; the interactor must still see the secret
        // before the solution's line.
        let interactor = "read first; read second; [ \"$first\" = secret ] && [ \"$second\" = hello ]";
        let session = judge()
            .start(problem("echo hello", interactor), &Testcase::default(), sink)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.provide_secret("secret\n"));
        assert!(!session.provide_secret("again\n"));

        let report = session.finish().await.unwrap();
        assert_eq!(report.verdict, Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_operator_input_is_queued_behind_gate() {
        let (sink, _events) = mpsc::unbounded_channel();
        let session = judge()
            .start(
                problem("read line; echo \"$line\"", "read secret; read reply; [ \"$reply\" = typed ]"),
                &Testcase::default(),
                sink,
            )
            .unwrap();

        assert!(session.send_input("typed\n"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.provide_secret("s\n");

        let report = session.finish().await.unwrap();
        assert_eq!(report.verdict, Verdict::Accepted);
        assert_eq!(report.transcript.solution_input, b"typed\n");
    }

    #[tokio::test]
    async fn test_solution_timeout_is_time_limit() {
        let (sink, _events) = mpsc::unbounded_channel();
        let mut problem = problem("sleep 5", "read secret; cat");
        problem.limits.time_ms = Some(500);
        let session = judge().start(problem, &with_secret("x\n"), sink).unwrap();

        let report = session.finish().await.unwrap();
        assert_eq!(report.verdict, Verdict::TimeLimit);
    }

    #[tokio::test]
    async fn test_stop_reports_stopped() {
        let (sink, _events) = mpsc::unbounded_channel();
        let session = judge()
            .start(problem("sleep 5", "sleep 5"), &with_secret("x\n"), sink)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        session.stop();
        let report = session.finish().await.unwrap();

        assert_eq!(report.state, JudgeState::Stopped);
        assert_eq!(report.verdict, Verdict::NotApplicable);
        assert_eq!(report.solution.unwrap().termination, Termination::Stopped);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_session_kills_processes_without_yielding() {
        use crate::core::pipeline::testing::{dies_without_yielding, read_pid};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let solution = format!("echo $$ > {}; exec sleep 5", pid_file.display());
        let (sink, _events) = mpsc::unbounded_channel();
        let session = judge()
            .start(problem(&solution, "sleep 5"), &with_secret("x\n"), sink)
            .unwrap();

        let pid = read_pid(&pid_file).await;
        drop(session);
        assert!(dies_without_yielding(pid, Duration::from_secs(2)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abandoned_finish_kills_processes() {
        use crate::core::pipeline::testing::{dies_without_yielding, read_pid};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let solution = format!("echo $$ > {}; exec sleep 5", pid_file.display());
        let (sink, _events) = mpsc::unbounded_channel();
        let session = judge()
            .start(problem(&solution, "sleep 5"), &with_secret("x\n"), sink)
            .unwrap();

        let pid = read_pid(&pid_file).await;
        let finished = tokio::time::timeout(Duration::from_millis(100), session.finish()).await;
        assert!(finished.is_err());
        assert!(dies_without_yielding(pid, Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_compile_error_skips_running() {
        let mut compiler = MockCompiler::new();
        compiler.expect_compile().return_const(Err(CompileError::Internal {
            msg: "no compiler".to_string(),
        }));
        let (sink, mut events) = mpsc::unbounded_channel();

        let mut problem = problem("true", "true");
        problem.solution = problem.solution.with_build(BuildStep {
            source: "sol.cpp".into(),
            command: vec!["g++".to_string()],
            cwd: None,
        });
        let session = judge_with(compiler)
            .start(problem, &with_secret(""), sink)
            .unwrap();

        let report = session.finish().await.unwrap();
        assert_eq!(report.verdict, Verdict::CompileError);
        assert!(report.solution.is_none());

        let mut saw_compiler_output = false;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, JudgeEvent::State(JudgeState::Running));
            if let JudgeEvent::Chunk {
                role: Role::Compiler,
                stream: StreamKind::Stderr,
                ..
            } = event
            {
                saw_compiler_output = true;
            }
        }
        assert!(saw_compiler_output);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected_up_front() {
        let (sink, _events) = mpsc::unbounded_channel();
        let problem = InteractiveProblem {
            solution: Program::command(Vec::<String>::new()),
            interactor: sh("true"),
            limits: ExecutionLimits::default(),
        };
        assert_eq!(
            judge()
                .start(problem, &Testcase::default(), sink)
                .unwrap_err(),
            RunError::EmptyCommand
        );
    }
}
