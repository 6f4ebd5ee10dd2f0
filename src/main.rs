use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use judge_runtime::config::Settings;
use judge_runtime::core::domain::{
    ExecutionLimits, JudgeEvent, Program, Role, StreamKind, Testcase,
};
use judge_runtime::core::pipeline::interactive::{
    InteractiveJudge, InteractiveProblem, SessionInput,
};
use judge_runtime::core::pipeline::standard::{Comparison, StandardJudge, StandardProblem};
use judge_runtime::core::pipeline::stress::{StressJudge, StressProblem};
use judge_runtime::core::runnable::{RunEvent, RunSpec, Runnable};
use judge_runtime::native::compiler::CommandCompiler;
use judge_runtime::native::sampler::detect_sampler;

#[derive(Parser, Debug)]
#[command(version, about = "Runs and judges competitive programming solutions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one command under limits and print how it ended.
    Run {
        #[command(flatten)]
        limits: LimitArgs,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Text written to the process's stdin.
        #[arg(long)]
        input: Option<String>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Judge a solution against an input file and an expected answer.
    Judge {
        #[command(flatten)]
        limits: LimitArgs,
        #[arg(long)]
        solution: String,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        answer: Option<PathBuf>,
        /// Ignore trailing whitespace and trailing blank lines.
        #[arg(long)]
        lines: bool,
    },
    /// Let a solution talk to an interactor. Without --secret the first line
    /// of stdin is the secret; remaining lines go to the solution.
    Interact {
        #[command(flatten)]
        limits: LimitArgs,
        #[arg(long)]
        solution: String,
        #[arg(long)]
        interactor: String,
        #[arg(long)]
        secret: Option<String>,
    },
    /// Race a solution against a reference on generated cases.
    Stress {
        #[command(flatten)]
        limits: LimitArgs,
        #[arg(long)]
        generator: String,
        #[arg(long)]
        solution: String,
        #[arg(long)]
        reference: String,
        /// Treat the reference as an interactor fed by the generator.
        #[arg(long)]
        interactive: bool,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct LimitArgs {
    /// Wall-clock limit in milliseconds, 0 for none.
    #[arg(long, default_value_t = 0)]
    time_ms: u64,
    /// Memory limit in megabytes, 0 for none.
    #[arg(long, default_value_t = 0)]
    memory_mb: u64,
}

impl LimitArgs {
    fn limits(self) -> ExecutionLimits {
        ExecutionLimits {
            time_ms: (self.time_ms > 0).then_some(self.time_ms),
            memory_bytes: (self.memory_mb > 0)
                .then_some(self.memory_mb.saturating_mul(1024 * 1024)),
        }
    }
}

fn program(command: &str) -> Program {
    Program::command(command.split_whitespace())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    tracing::debug!(?settings, "settings loaded");

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping");
                stop.cancel();
            }
        });
    }

    let sampler = detect_sampler();
    let compiler = Arc::new(
        CommandCompiler::new(sampler.clone())
            .with_timeout(settings.compile_timeout)
            .with_sample_interval(settings.sample_interval),
    );

    match cli.command {
        Command::Run {
            limits,
            cwd,
            input,
            command,
        } => {
            let mut spec = RunSpec::new(command).limits(&limits.limits());
            if let Some(cwd) = cwd {
                spec = spec.cwd(cwd);
            }
            let mut runnable = Runnable::new("run", sampler.clone())
                .with_sample_interval(settings.sample_interval);
            let mut events = runnable.run(spec)?;
            if let Some(handle) = runnable.handle() {
                if let Some(input) = input {
                    handle.write(input);
                }
                handle.close_stdin();
            }

            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            let mut stopping = false;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(RunEvent::Stdout(data)) => stdout.write_all(&data).await?,
                        Some(RunEvent::Stderr(data)) => stderr.write_all(&data).await?,
                        Some(RunEvent::Error(msg)) => tracing::error!("{}", msg),
                        Some(RunEvent::Close(outcome)) => {
                            stdout.flush().await?;
                            println!(
                                "termination={} exit_code={:?} signal={:?} elapsed_ms={} peak_memory_bytes={}",
                                outcome.termination,
                                outcome.exit_code,
                                outcome.signal,
                                outcome.elapsed_ms(),
                                outcome.peak_memory_bytes
                            );
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = stop.cancelled(), if !stopping => {
                        stopping = true;
                        runnable.stop();
                    }
                }
            }
        }
        Command::Judge {
            limits,
            solution,
            input,
            answer,
            lines,
        } => {
            let testcase = Testcase {
                input: tokio::fs::read_to_string(&input).await?,
                answer: match answer {
                    Some(path) => Some(tokio::fs::read_to_string(path).await?),
                    None => None,
                },
                secret: None,
            };
            let problem = StandardProblem {
                solution: program(&solution),
                limits: limits.limits(),
                comparison: if lines {
                    Comparison::Lines
                } else {
                    Comparison::Exact
                },
            };
            let (sink, events) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(events));

            let judge = StandardJudge::new(compiler, sampler, settings);
            let report = judge.judge(&problem, &testcase, &sink, &stop).await?;
            drop(sink);
            printer.await?;

            if let Some(outcome) = &report.outcome {
                println!(
                    "verdict={} elapsed_ms={} peak_memory_bytes={}",
                    report.verdict,
                    outcome.elapsed_ms(),
                    outcome.peak_memory_bytes
                );
            } else {
                println!("verdict={}", report.verdict);
            }
        }
        Command::Interact {
            limits,
            solution,
            interactor,
            secret,
        } => {
            let problem = InteractiveProblem {
                solution: program(&solution),
                interactor: program(&interactor),
                limits: limits.limits(),
            };
            let testcase = Testcase {
                secret: secret.map(|secret| format!("{}\n", secret.trim_end())),
                ..Testcase::default()
            };
            let (sink, events) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(events));

            let judge = InteractiveJudge::new(compiler, sampler, settings);
            let needs_secret = testcase.secret.is_none();
            let session = judge.start(problem, &testcase, sink)?;
            stop_on(&stop, session.cancellation_token());
            forward_stdin(session.input(), needs_secret);

            let report = session.finish().await?;
            printer.await?;
            println!("verdict={}", report.verdict);
        }
        Command::Stress {
            limits,
            generator,
            solution,
            reference,
            interactive,
        } => {
            let problem = StressProblem {
                generator: program(&generator),
                solution: program(&solution),
                reference: program(&reference),
                limits: limits.limits(),
                interactive,
            };
            let (sink, events) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_iterations(events));

            let judge = StressJudge::new(compiler, sampler, settings);
            let session = judge.start(problem, sink)?;
            stop_on(&stop, session.cancellation_token());
            let report = session.finish().await?;
            printer.await?;

            println!(
                "end={:?} verdict={} iterations={} duration_ms={}",
                report.end,
                report.end.verdict(),
                report.iterations,
                (report.finished_at - report.started_at).num_milliseconds()
            );
            if let Some(case) = report.last_case {
                println!("seed={}", case.seed);
                println!("--- input\n{}", String::from_utf8_lossy(&case.input));
                println!("--- solution\n{}", String::from_utf8_lossy(&case.solution_output));
                println!("--- reference\n{}", String::from_utf8_lossy(&case.reference_output));
            }
        }
    }

    Ok(())
}

/// Cancels `target` once `stop` fires.
fn stop_on(stop: &CancellationToken, target: CancellationToken) {
    let stop = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => target.cancel(),
            _ = target.cancelled() => {}
        }
    });
}

/// Forwards stdin lines to the session from a detached thread, so a pending
/// read never holds the runtime open. The first line is the secret when the
/// session still waits for one.
fn forward_stdin(input: SessionInput, mut first_is_secret: bool) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let line = match line {
                Ok(line) => format!("{line}\n"),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    break;
                }
            };
            let delivered = if std::mem::take(&mut first_is_secret) {
                input.provide_secret(line)
            } else {
                input.send_input(line)
            };
            if !delivered {
                break;
            }
        }
    });
}

async fn print_events(mut events: mpsc::UnboundedReceiver<JudgeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            JudgeEvent::State(state) => tracing::info!(?state, "state changed"),
            JudgeEvent::Chunk {
                role,
                stream: StreamKind::Stderr,
                data,
            } => eprint!("[{role}] {}", String::from_utf8_lossy(&data)),
            JudgeEvent::Chunk {
                role: role @ (Role::Solution | Role::Interactor),
                stream: StreamKind::Stdout,
                data,
            } => print!("[{role}] {}", String::from_utf8_lossy(&data)),
            JudgeEvent::Chunk { .. } | JudgeEvent::Iteration { .. } => {}
        }
    }
}

async fn print_iterations(mut events: mpsc::UnboundedReceiver<JudgeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            JudgeEvent::Iteration { index, seed } => tracing::info!(index, seed, "iteration"),
            JudgeEvent::State(state) => tracing::info!(?state, "state changed"),
            JudgeEvent::Chunk { .. } => {}
        }
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limits_mean_unlimited() {
        let limits = LimitArgs {
            time_ms: 0,
            memory_mb: 0,
        }
        .limits();
        assert_eq!(limits, ExecutionLimits::default());
    }

    #[test]
    fn test_huge_memory_limit_saturates() {
        let limits = LimitArgs {
            time_ms: 1500,
            memory_mb: u64::MAX,
        }
        .limits();
        assert_eq!(limits.time_ms, Some(1500));
        assert_eq!(limits.memory_bytes, Some(u64::MAX));
    }
}
