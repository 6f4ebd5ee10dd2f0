use crate::core::domain::{BuildStep, RunOutcome, Verdict};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("compilation failed: {verdict}")]
    Failed {
        verdict: Verdict,
        outcome: RunOutcome,
        output: String,
    },
    #[error("compilation was stopped")]
    Stopped,
    #[error("internal error: {msg}")]
    Internal { msg: String },
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Compiler: std::fmt::Debug + Send + Sync {
    async fn compile(&self, step: &BuildStep) -> Result<(), CompileError>;
}
