use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{EventSink, Program, Role, StreamKind, Verdict, emit_chunk},
    traits::compiler::{CompileError, Compiler},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileStage {
    Ready,
    Rejected { role: Role, verdict: Verdict },
    Stopped,
}

/// Builds every program that has a build step, in order, stopping at the
/// first rejection. Compiler output goes to the sink as compiler stderr.
#[tracing::instrument(skip_all)]
pub async fn compile_programs(
    compiler: &dyn Compiler,
    programs: &[(Role, &Program)],
    stop: &CancellationToken,
    sink: &EventSink,
) -> CompileStage {
    for (role, program) in programs {
        let Some(step) = &program.build else {
            continue;
        };
        if stop.is_cancelled() {
            return CompileStage::Stopped;
        }

        tracing::debug!(%role, "Start compiling");
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => return CompileStage::Stopped,
            result = compiler.compile(step) => result,
        };
        tracing::debug!(%role, "Compilation result: {:?}", result);

        match result {
            Ok(()) => {}
            Err(CompileError::Failed {
                verdict, output, ..
            }) => {
                if !output.is_empty() {
                    emit_chunk(sink, Role::Compiler, StreamKind::Stderr, &Bytes::from(output));
                }
                return CompileStage::Rejected {
                    role: *role,
                    verdict,
                };
            }
            Err(CompileError::Stopped) => return CompileStage::Stopped,
            Err(CompileError::Internal { msg }) => {
                tracing::error!("Internal error while compiling {}: {}", role, msg);
                emit_chunk(sink, Role::Compiler, StreamKind::Stderr, &Bytes::from(msg));
                return CompileStage::Rejected {
                    role: *role,
                    verdict: Verdict::CompileError,
                };
            }
        }
    }
    CompileStage::Ready
}
