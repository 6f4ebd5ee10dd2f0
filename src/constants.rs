pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_STRESS_DELAY_MS: u64 = 50;
pub const DEFAULT_STRESS_TIME_LIMIT_MS: u64 = 0;
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 10_000;

pub const PIPE_CHUNK_SIZE: usize = 8 * 1024;

pub const SAMPLE_INTERVAL_ENV: &str = "JUDGE_SAMPLE_INTERVAL_MS";
pub const STRESS_DELAY_ENV: &str = "JUDGE_STRESS_DELAY_MS";
pub const STRESS_TIME_LIMIT_ENV: &str = "JUDGE_STRESS_TIME_LIMIT_MS";
pub const COMPILE_TIMEOUT_ENV: &str = "JUDGE_COMPILE_TIMEOUT_MS";
pub const ABNORMAL_EXIT_POLICY_ENV: &str = "JUDGE_ABNORMAL_EXIT_POLICY";
