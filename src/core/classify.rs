//! Maps raw run outcomes to judge verdicts.

use std::str::FromStr;

use crate::core::domain::{RunOutcome, Termination, Verdict};

/// How to break the tie when the solution and the interactor both end with a
/// generic failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbnormalExitPolicy {
    /// Blame the solution only when it has no exit code at all.
    #[default]
    NullExitOnly,
    /// Blame the solution for any non-zero exit.
    AnyNonZero,
}

impl FromStr for AbnormalExitPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "null-exit-only" => Ok(AbnormalExitPolicy::NullExitOnly),
            "any-non-zero" => Ok(AbnormalExitPolicy::AnyNonZero),
            other => Err(other.to_string()),
        }
    }
}

/// Verdict for a testcase run, or `None` when the process exited cleanly and
/// its output still has to be checked.
pub fn classify_run(outcome: &RunOutcome) -> Option<Verdict> {
    classify(outcome.termination, Verdict::RuntimeError)
}

/// Verdict for a compile step, or `None` when compilation succeeded.
pub fn classify_compile(outcome: &RunOutcome) -> Option<Verdict> {
    classify(outcome.termination, Verdict::CompileError)
}

fn classify(termination: Termination, failure: Verdict) -> Option<Verdict> {
    match termination {
        Termination::TimedOut => Some(Verdict::TimeLimit),
        Termination::MemoryExceeded => Some(Verdict::MemoryLimit),
        Termination::Stopped => Some(Verdict::NotApplicable),
        Termination::Signaled | Termination::Failed => Some(failure),
        Termination::Success => None,
    }
}

/// Resolves a solution/interactor pair into one verdict using the worse of
/// the two terminations.
pub fn resolve_interactive(
    solution: &RunOutcome,
    interactor: &RunOutcome,
    policy: AbnormalExitPolicy,
) -> Verdict {
    let worst = solution.termination.max(interactor.termination);
    match worst {
        Termination::Success | Termination::Stopped => Verdict::Accepted,
        Termination::Failed => {
            if solution_is_at_fault(solution, interactor, policy) {
                Verdict::RuntimeError
            } else {
                Verdict::WrongAnswer
            }
        }
        Termination::Signaled => Verdict::RuntimeError,
        Termination::MemoryExceeded => Verdict::MemoryLimit,
        Termination::TimedOut => Verdict::TimeLimit,
    }
}

fn solution_is_at_fault(
    solution: &RunOutcome,
    interactor: &RunOutcome,
    policy: AbnormalExitPolicy,
) -> bool {
    let solution_failed = solution.termination == Termination::Failed;
    let interactor_failed = interactor.termination == Termination::Failed;
    match (solution_failed, interactor_failed) {
        (true, false) => true,
        (false, _) => false,
        (true, true) => match policy {
            AbnormalExitPolicy::NullExitOnly => solution.is_abnormal_exit(),
            AbnormalExitPolicy::AnyNonZero => true,
        },
    }
}
