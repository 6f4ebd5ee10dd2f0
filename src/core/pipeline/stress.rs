//! Stress racing: a generator feeds random cases to a solution and a trusted
//! reference until their answers differ.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::core::classify::classify_run;
use crate::core::domain::{
    EventSink, ExecutionLimits, JudgeEvent, JudgeState, Program, Role, RunOutcome, StreamKind,
    Termination, Verdict, emit, emit_chunk,
};
use crate::core::pipeline::{JudgeError, LiveRuns, SessionGuard};
use crate::core::pipeline::compiling::{CompileStage, compile_programs};
use crate::core::pipeline::conversation::Conversation;
use crate::core::pipeline::relay::SecretGate;
use crate::core::runnable::{RunError, RunEvent, RunHandle, Runnable};
use crate::core::traits::compiler::Compiler;
use crate::core::traits::sampler::ProcessSampler;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StressProblem {
    pub generator: Program,
    pub solution: Program,
    pub reference: Program,
    pub limits: ExecutionLimits,
    /// The reference acts as an interactor and the generator output is its
    /// secret.
    pub interactive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressEnd {
    Diverged { verdict: Verdict },
    Crashed { role: Role, termination: Termination },
    CompileFailed { role: Role, verdict: Verdict },
    Stopped,
    /// The overall time budget ran out without a counterexample.
    TimedOut,
}

impl StressEnd {
    pub fn verdict(&self) -> Verdict {
        match self {
            StressEnd::Diverged { verdict } | StressEnd::CompileFailed { verdict, .. } => *verdict,
            StressEnd::Crashed { termination, .. } => {
                let outcome = RunOutcome::not_started(*termination);
                classify_run(&outcome).unwrap_or(Verdict::RuntimeError)
            }
            StressEnd::Stopped => Verdict::NotApplicable,
            StressEnd::TimedOut => Verdict::Accepted,
        }
    }

    fn state(&self) -> JudgeState {
        match self {
            StressEnd::Stopped => JudgeState::Stopped,
            end => JudgeState::Judged(end.verdict()),
        }
    }
}

/// Input and outputs of one iteration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StressCase {
    pub seed: u64,
    pub input: Vec<u8>,
    pub solution_output: Vec<u8>,
    pub reference_output: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StressReport {
    pub iterations: u64,
    pub end: StressEnd,
    pub last_case: Option<StressCase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct StressJudge {
    compiler: Arc<dyn Compiler>,
    sampler: Arc<dyn ProcessSampler>,
    settings: Settings,
}

impl StressJudge {
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

    pub fn start(&self, problem: StressProblem, sink: EventSink) -> Result<StressSession, RunError> {
        if [&problem.generator, &problem.solution, &problem.reference]
            .iter()
            .any(|program| program.run.is_empty())
        {
            return Err(RunError::EmptyCommand);
        }

        let guard = SessionGuard::new();
        let slot = |label: &str| {
            Runnable::new(label, self.sampler.clone())
                .with_sample_interval(self.settings.sample_interval)
        };
        let race = Race {
            generator: slot("generator"),
            solution: slot("solution"),
            reference: slot("reference"),
            problem,
            compiler: self.compiler.clone(),
            settings: self.settings.clone(),
            stop: guard.token().clone(),
            live: guard.live().clone(),
            sink,
        };
        let task = tokio::spawn(race.drive());
        Ok(StressSession { task, guard })
    }
}

/// A running stress race. Dropping it, or an unfinished
/// [`finish`](Self::finish), kills every process of the current iteration on
/// the spot.
#[derive(Debug)]
pub struct StressSession {
    task: JoinHandle<Result<StressReport, RunError>>,
    guard: SessionGuard,
}

impl StressSession {
    pub fn stop(&self) {
        self.guard.token().cancel();
    }

    /// Token that stops the race when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.guard.token().clone()
    }

    pub async fn finish(self) -> Result<StressReport, JudgeError> {
        let Self {
            task,
            guard: _guard,
        } = self;
        match task.await {
            Ok(report) => Ok(report?),
            Err(e) => Err(JudgeError::Panicked(e.to_string())),
        }
    }
}

struct Race {
    generator: Runnable,
    solution: Runnable,
    reference: Runnable,
    problem: StressProblem,
    compiler: Arc<dyn Compiler>,
    settings: Settings,
    stop: CancellationToken,
    live: LiveRuns,
    sink: EventSink,
}

struct Round {
    case: StressCase,
    end: Option<StressEnd>,
}

/// Process handles of one iteration.
struct Trio {
    generator: RunHandle,
    solution: RunHandle,
    reference: RunHandle,
}

impl Trio {
    fn stop_all(&self) {
        self.generator.stop();
        self.solution.stop();
        self.reference.stop();
    }
}

impl Race {
    #[tracing::instrument(skip_all)]
    async fn drive(mut self) -> Result<StressReport, RunError> {
        let started_at = Utc::now();
        let deadline = (!self.settings.stress_time_limit.is_zero())
            .then(|| Instant::now() + self.settings.stress_time_limit);

        emit(&self.sink, JudgeEvent::State(JudgeState::Compiling));
        let programs = [
            (Role::Generator, &self.problem.generator),
            (Role::Solution, &self.problem.solution),
            (Role::Reference, &self.problem.reference),
        ];
        let compiled = compile_programs(&*self.compiler, &programs, &self.stop, &self.sink).await;
        let mut iterations = 0;
        let mut last_case = None;

        let end = match compiled {
            CompileStage::Rejected { role, verdict } => StressEnd::CompileFailed { role, verdict },
            CompileStage::Stopped => StressEnd::Stopped,
            CompileStage::Ready => {
                emit(&self.sink, JudgeEvent::State(JudgeState::Running));
                loop {
                    if self.stop.is_cancelled() {
                        break StressEnd::Stopped;
                    }
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        break StressEnd::TimedOut;
                    }

                    let seed = rand::random::<u64>();
                    iterations += 1;
                    tracing::debug!(iteration = iterations, seed, "stress iteration");
                    emit(
                        &self.sink,
                        JudgeEvent::Iteration {
                            index: iterations,
                            seed,
                        },
                    );

                    let round = self.round(seed, deadline).await?;
                    last_case = Some(round.case);
                    if let Some(end) = round.end {
                        break end;
                    }

                    let delay = self.settings.stress_delay;
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = self.stop.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        };

        tracing::info!(iterations, end = ?end, verdict = %end.verdict(), "stress race finished");
        emit(&self.sink, JudgeEvent::State(end.state()));
        Ok(StressReport {
            iterations,
            end,
            last_case,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn round(&mut self, seed: u64, deadline: Option<Instant>) -> Result<Round, RunError> {
        let limits = &self.problem.limits;
        let helper_limits = ExecutionLimits {
            time_ms: limits.time_ms,
            memory_bytes: None,
        };

        let mut streams = StreamMap::new();
        streams.insert(
            Role::Reference,
            self.reference
                .run(self.problem.reference.run_spec(&helper_limits))?
                .into_stream(),
        );
        streams.insert(
            Role::Generator,
            self.generator
                .run(self.problem.generator.run_spec(&helper_limits))?
                .into_stream(),
        );
        streams.insert(
            Role::Solution,
            self.solution
                .run(self.problem.solution.run_spec(limits))?
                .into_stream(),
        );
        let (Some(generator), Some(solution), Some(reference)) = (
            self.generator.handle().cloned(),
            self.solution.handle().cloned(),
            self.reference.handle().cloned(),
        ) else {
            return Err(RunError::EmptyCommand);
        };
        let trio = Trio {
            generator,
            solution,
            reference,
        };
        for run in [&trio.generator, &trio.solution, &trio.reference] {
            self.live.track(run);
        }

        let seed_line = Bytes::from(format!("{seed}\n"));
        emit_chunk(&self.sink, Role::Generator, StreamKind::Stdin, &seed_line);
        trio.generator.write(seed_line);
        trio.generator.close_stdin();

        let gate = SecretGate::new();
        let mut conversation = self.problem.interactive.then(|| {
            Conversation::new(
                trio.solution.clone(),
                trio.reference.clone(),
                Role::Reference,
                gate.clone(),
                self.sink.clone(),
            )
        });

        let mut case = StressCase {
            seed,
            ..StressCase::default()
        };
        let mut crashed = None;
        let mut solution_outcome = None;
        let mut reference_outcome = None;
        let mut stopped = false;
        let mut timed_out = false;
        let sleep = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                next = streams.next() => {
                    let Some((role, event)) = next else {
                        break;
                    };
                    if let RunEvent::Close(outcome) = &event {
                        match role {
                            Role::Solution => solution_outcome = Some(outcome.clone()),
                            Role::Reference => reference_outcome = Some(outcome.clone()),
                            _ => {}
                        }
                    }
                    match (&mut conversation, role) {
                        (Some(conversation), Role::Solution | Role::Reference) => {
                            let cascade = matches!(&event, RunEvent::Error(_))
                                || matches!(&event, RunEvent::Close(o) if !o.termination.is_success());
                            conversation.handle(role, event);
                            if cascade {
                                trio.generator.stop();
                            }
                        }
                        _ => self.observe(role, event, &trio, &gate, &mut case, &mut crashed),
                    }
                }
                _ = self.stop.cancelled(), if !stopped => {
                    stopped = true;
                    trio.stop_all();
                }
                _ = &mut sleep, if deadline.is_some() && !timed_out => {
                    timed_out = true;
                    trio.stop_all();
                }
            }
        }

        if let Some(conversation) = &conversation {
            let transcript = conversation.transcript();
            case.solution_output = transcript.solution_output.clone();
            case.reference_output = transcript.solution_input.clone();
        }

        let end = if stopped {
            Some(StressEnd::Stopped)
        } else if timed_out {
            Some(StressEnd::TimedOut)
        } else if let Some((role, termination)) = crashed {
            Some(StressEnd::Crashed { role, termination })
        } else {
            let solution = match solution_outcome {
                Some(outcome) => outcome,
                None => trio.solution.done().await,
            };
            let reference = match reference_outcome {
                Some(outcome) => outcome,
                None => trio.reference.done().await,
            };
            self.judge_round(conversation.as_ref(), &case, &solution, &reference)
        };
        Ok(Round { case, end })
    }

    /// Routes one event in the plain (non-interactive) layout, and generator
    /// events in both layouts.
    fn observe(
        &self,
        role: Role,
        event: RunEvent,
        trio: &Trio,
        gate: &SecretGate,
        case: &mut StressCase,
        crashed: &mut Option<(Role, Termination)>,
    ) {
        let interactive = self.problem.interactive;
        match event {
            RunEvent::Stdout(data) => {
                emit_chunk(&self.sink, role, StreamKind::Stdout, &data);
                match role {
                    Role::Generator => {
                        case.input.extend_from_slice(&data);
                        if !interactive {
                            trio.solution.write(data.clone());
                            trio.reference.write(data);
                        }
                    }
                    Role::Solution => case.solution_output.extend_from_slice(&data),
                    _ => case.reference_output.extend_from_slice(&data),
                }
            }
            RunEvent::Stderr(data) => emit_chunk(&self.sink, role, StreamKind::Stderr, &data),
            RunEvent::StdoutEnd if role == Role::Generator => {
                if interactive {
                    gate.resolve(Bytes::from(case.input.clone()));
                } else {
                    trio.solution.close_stdin();
                    trio.reference.close_stdin();
                }
            }
            RunEvent::Error(msg) => {
                tracing::warn!(%role, "process error: {}", msg);
                if crashed.is_none() {
                    *crashed = Some((role, Termination::Failed));
                }
                trio.stop_all();
            }
            RunEvent::Close(outcome) => {
                let termination = outcome.termination;
                if termination.is_success() {
                    return;
                }
                // Stopped only ever comes from our own cascade.
                if termination != Termination::Stopped && crashed.is_none() {
                    tracing::debug!(%role, %termination, "stress process failed");
                    *crashed = Some((role, termination));
                }
                trio.stop_all();
            }
            RunEvent::Spawn { .. } | RunEvent::StdoutEnd | RunEvent::StderrEnd => {}
        }
    }

    fn judge_round(
        &self,
        conversation: Option<&Conversation>,
        case: &StressCase,
        solution: &RunOutcome,
        reference: &RunOutcome,
    ) -> Option<StressEnd> {
        match conversation {
            Some(conversation) => {
                match conversation.verdict(solution, reference, self.settings.abnormal_exit_policy) {
                    Verdict::Accepted => None,
                    verdict => Some(StressEnd::Diverged { verdict }),
                }
            }
            None if case.solution_output == case.reference_output => None,
            None => Some(StressEnd::Diverged {
                verdict: Verdict::WrongAnswer,
            }),
        }
    }
}
