use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::core::classify::classify_run;
use crate::core::domain::{
    EventSink, ExecutionLimits, JudgeEvent, JudgeState, Program, Role, RunOutcome, StreamKind,
    Testcase, Verdict, emit, emit_chunk,
};
use crate::core::pipeline::compiling::{CompileStage, compile_programs};
use crate::core::runnable::{RunError, RunEvent, Runnable};
use crate::core::traits::compiler::Compiler;
use crate::core::traits::sampler::ProcessSampler;

/// How solution output is matched against the expected answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Comparison {
    #[default]
    Exact,
    /// Ignores trailing whitespace on each line and trailing blank lines.
    Lines,
}

impl Comparison {
    pub fn matches(self, output: &[u8], answer: &[u8]) -> bool {
        match self {
            Comparison::Exact => output == answer,
            Comparison::Lines => normalized_lines(output).eq(normalized_lines(answer)),
        }
    }
}

fn normalized_lines(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut lines: Vec<&[u8]> = text
        .split(|&b| b == b'\n')
        .map(|line| line.trim_ascii_end())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.into_iter()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandardProblem {
    pub solution: Program,
    pub limits: ExecutionLimits,
    pub comparison: Comparison,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandardReport {
    pub state: JudgeState,
    pub verdict: Verdict,
    pub outcome: Option<RunOutcome>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Judges a solution against a static input and expected answer.
#[derive(Clone, Debug)]
pub struct StandardJudge {
    compiler: Arc<dyn Compiler>,
    sampler: Arc<dyn ProcessSampler>,
    settings: Settings,
}

impl StandardJudge {
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

    #[tracing::instrument(skip_all)]
    pub async fn judge(
        &self,
        problem: &StandardProblem,
        testcase: &Testcase,
        sink: &EventSink,
        stop: &CancellationToken,
    ) -> Result<StandardReport, RunError> {
        if problem.solution.run.is_empty() {
            return Err(RunError::EmptyCommand);
        }

        emit(sink, JudgeEvent::State(JudgeState::Compiling));
        let programs = [(Role::Solution, &problem.solution)];
        match compile_programs(&*self.compiler, &programs, stop, sink).await {
            CompileStage::Ready => {}
            CompileStage::Rejected { verdict, .. } => {
                return Ok(early_report(sink, JudgeState::Judged(verdict)));
            }
            CompileStage::Stopped => return Ok(early_report(sink, JudgeState::Stopped)),
        }
        if stop.is_cancelled() {
            return Ok(early_report(sink, JudgeState::Stopped));
        }
        emit(sink, JudgeEvent::State(JudgeState::Running));

        let mut runnable = Runnable::new("solution", self.sampler.clone())
            .with_sample_interval(self.settings.sample_interval);
        let mut events = runnable.run(problem.solution.run_spec(&problem.limits))?;
        if let Some(handle) = runnable.handle() {
            let input = Bytes::from(testcase.input.clone());
            emit_chunk(sink, Role::Solution, StreamKind::Stdin, &input);
            handle.write(input);
            handle.close_stdin();
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut outcome = None;
        let mut errored = false;
        let mut stopping = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RunEvent::Stdout(data)) => {
                        emit_chunk(sink, Role::Solution, StreamKind::Stdout, &data);
                        stdout.extend_from_slice(&data);
                    }
                    Some(RunEvent::Stderr(data)) => {
                        emit_chunk(sink, Role::Solution, StreamKind::Stderr, &data);
                        stderr.extend_from_slice(&data);
                    }
                    Some(RunEvent::Error(msg)) => {
                        tracing::warn!("solution error: {}", msg);
                        errored = true;
                    }
                    Some(RunEvent::Close(closed)) => outcome = Some(closed),
                    Some(_) => {}
                    None => break,
                },
                _ = stop.cancelled(), if !stopping => {
                    stopping = true;
                    runnable.stop();
                }
            }
        }

        let outcome = match (outcome, runnable.handle()) {
            (Some(outcome), _) => outcome,
            (None, Some(handle)) => handle.done().await,
            (None, None) => return Err(RunError::EmptyCommand),
        };
        let state = if stopping {
            JudgeState::Stopped
        } else {
            JudgeState::Judged(self.verdict(problem, testcase, &outcome, &stdout, errored))
        };
        tracing::info!(
            verdict = %state.verdict(),
            termination = %outcome.termination,
            elapsed_ms = outcome.elapsed_ms(),
            "testcase judged"
        );
        emit(sink, JudgeEvent::State(state));

        Ok(StandardReport {
            state,
            verdict: state.verdict(),
            outcome: Some(outcome),
            stdout,
            stderr,
        })
    }

    fn verdict(
        &self,
        problem: &StandardProblem,
        testcase: &Testcase,
        outcome: &RunOutcome,
        stdout: &[u8],
        errored: bool,
    ) -> Verdict {
        if let Some(verdict) = classify_run(outcome) {
            return verdict;
        }
        // Output read past a pipe or wait error is not trusted.
        let verdict = match &testcase.answer {
            None => Verdict::NotApplicable,
            Some(answer) if problem.comparison.matches(stdout, answer.as_bytes()) => {
                Verdict::Accepted
            }
            Some(_) => Verdict::WrongAnswer,
        };
        match verdict {
            Verdict::Accepted | Verdict::WrongAnswer if errored => Verdict::RuntimeError,
            verdict => verdict,
        }
    }
}

fn early_report(sink: &EventSink, state: JudgeState) -> StandardReport {
    emit(sink, JudgeEvent::State(state));
    StandardReport {
        state,
        verdict: state.verdict(),
        outcome: None,
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_comparison() {
        assert!(Comparison::Exact.matches(b"1 2\n", b"1 2\n"));
        assert!(!Comparison::Exact.matches(b"1 2\n", b"1 2"));
        assert!(!Comparison::Exact.matches(b"1 2 \n", b"1 2\n"));
    }

    #[test]
    fn test_line_comparison_ignores_trailing_space() {
        assert!(Comparison::Lines.matches(b"1 2  \r\n3\n\n\n", b"1 2\n3"));
        assert!(Comparison::Lines.matches(b"", b"\n\n"));
        assert!(!Comparison::Lines.matches(b"1  2\n", b"1 2\n"));
        assert!(!Comparison::Lines.matches(b"1\n\n2\n", b"1\n2\n"));
    }
}
