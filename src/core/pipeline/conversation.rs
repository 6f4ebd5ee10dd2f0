use bytes::Bytes;

use crate::core::classify::{AbnormalExitPolicy, resolve_interactive};
use crate::core::domain::{EventSink, Role, RunOutcome, StreamKind, Verdict, emit_chunk};
use crate::core::pipeline::interactive::Transcript;
use crate::core::pipeline::relay::{GatedInput, SecretGate};
use crate::core::runnable::{RunEvent, RunHandle};

/// Wires a solution and an interactor into one dialogue: each side's stdout
/// becomes the other side's stdin, behind the secret gate.
pub(crate) struct Conversation {
    solution: RunHandle,
    interactor: RunHandle,
    interactor_role: Role,
    to_solution: GatedInput,
    to_interactor: GatedInput,
    transcript: Transcript,
    sink: EventSink,
    solution_errored: bool,
    interactor_errored: bool,
}

impl Conversation {
    pub(crate) fn new(
        solution: RunHandle,
        interactor: RunHandle,
        interactor_role: Role,
        gate: SecretGate,
        sink: EventSink,
    ) -> Self {
        Self {
            to_solution: GatedInput::spawn(solution.clone(), gate.clone(), false),
            to_interactor: GatedInput::spawn(interactor.clone(), gate, true),
            solution,
            interactor,
            interactor_role,
            transcript: Transcript::default(),
            sink,
            solution_errored: false,
            interactor_errored: false,
        }
    }

    pub(crate) fn handle(&mut self, role: Role, event: RunEvent) {
        if role == Role::Solution {
            self.on_solution(event);
        } else {
            self.on_interactor(event);
        }
    }

    fn on_solution(&mut self, event: RunEvent) {
        match event {
            RunEvent::Stdout(data) => {
                self.transcript.solution_output.extend_from_slice(&data);
                emit_chunk(&self.sink, Role::Solution, StreamKind::Stdout, &data);
                self.to_interactor.push(data);
            }
            RunEvent::Stderr(data) => {
                self.transcript.solution_stderr.extend_from_slice(&data);
                emit_chunk(&self.sink, Role::Solution, StreamKind::Stderr, &data);
            }
            RunEvent::StdoutEnd => self.to_interactor.close(),
            RunEvent::Error(msg) => {
                tracing::warn!(role = %Role::Solution, "process error: {}", msg);
                self.solution_errored = true;
                self.interactor.stop();
                self.interactor.close_stdin();
            }
            RunEvent::Close(outcome) => {
                if !outcome.termination.is_success() {
                    self.interactor.stop();
                }
                self.to_interactor.close();
            }
            RunEvent::Spawn { .. } | RunEvent::StderrEnd => {}
        }
    }

    fn on_interactor(&mut self, event: RunEvent) {
        let role = self.interactor_role;
        match event {
            RunEvent::Stdout(data) => {
                self.transcript.solution_input.extend_from_slice(&data);
                emit_chunk(&self.sink, role, StreamKind::Stdout, &data);
                self.to_solution.push(data);
            }
            RunEvent::Stderr(data) => {
                self.transcript.interactor_stderr.extend_from_slice(&data);
                emit_chunk(&self.sink, role, StreamKind::Stderr, &data);
            }
            RunEvent::StdoutEnd => self.to_solution.close(),
            RunEvent::Error(msg) => {
                tracing::warn!(%role, "process error: {}", msg);
                self.interactor_errored = true;
                self.solution.stop();
                self.solution.close_stdin();
            }
            RunEvent::Close(outcome) => {
                if !outcome.termination.is_success() {
                    self.solution.stop();
                }
                self.to_solution.close();
            }
            RunEvent::Spawn { .. } | RunEvent::StderrEnd => {}
        }
    }

    /// Input typed by the operator, queued behind the gate like interactor
    /// output.
    pub(crate) fn operator_input(&mut self, data: Bytes) {
        self.transcript.solution_input.extend_from_slice(&data);
        emit_chunk(&self.sink, Role::Solution, StreamKind::Stdin, &data);
        self.to_solution.push(data);
    }

    pub(crate) fn stop(&self) {
        self.solution.stop();
        self.interactor.stop();
    }

    pub(crate) fn verdict(
        &self,
        solution: &RunOutcome,
        interactor: &RunOutcome,
        policy: AbnormalExitPolicy,
    ) -> Verdict {
        let verdict = resolve_interactive(solution, interactor, policy);
        let errored = self.solution_errored || self.interactor_errored;
        match verdict {
            Verdict::Accepted | Verdict::WrongAnswer if errored => Verdict::RuntimeError,
            verdict => verdict,
        }
    }

    pub(crate) fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub(crate) fn into_transcript(self) -> Transcript {
        self.transcript
    }
}
