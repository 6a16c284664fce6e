//! 重试执行器：对不可靠的远程调用（LLM 生成 / 工具调用）按 RetryPolicy 做指数退避重试
//!
//! 第 attempt 次重试前等待 `min(max_backoff, initial_backoff * multiplier^attempt)`，
//! 开启 jitter 时再乘以 [0.7, 1.3] 内的随机因子。只有 retry_on 中的失败类型会被重试；
//! 次数耗尽后原样返回最后一次错误，绝不吞掉终止性失败。
//!
//! 等待通过 Sleeper 完成，生产环境为 tokio::time::sleep，测试中可替换为记录型实现。

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// jitter 随机因子下界
const JITTER_MIN: f64 = 0.7;
/// jitter 随机因子上界
const JITTER_MAX: f64 = 1.3;

/// 失败类型：RetryPolicy 只根据类型决定是否重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    RateLimited,
    Server,
    /// 其它可能自行恢复的失败（工具内部异常等）
    Transient,
    /// 参数或请求本身有误，重试没有意义
    InvalidInput,
    Permanent,
}

impl FailureKind {
    /// 默认可重试集合：所有暂时性失败
    pub fn transient_kinds() -> HashSet<FailureKind> {
        [
            FailureKind::Timeout,
            FailureKind::Network,
            FailureKind::RateLimited,
            FailureKind::Server,
            FailureKind::Transient,
        ]
        .into_iter()
        .collect()
    }
}

/// 可分类的错误：LlmError、ToolError 等实现此 trait 以接入 RetryExecutor
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// 重试策略：构造后不可变；LLM 调用与工具调用各持有一份
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: bool,
    retry_on: HashSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
            retry_on: FailureKind::transient_kinds(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
        jitter: bool,
        retry_on: HashSet<FailureKind>,
    ) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            multiplier,
            jitter,
            retry_on,
        }
    }

    /// LLM 调用的默认策略：3 次，初始 400ms
    pub fn for_llm() -> Self {
        Self {
            initial_backoff: Duration::from_millis(400),
            ..Self::default()
        }
    }

    /// 工具调用的默认策略（更保守）：2 次，初始 200ms
    pub fn for_tools() -> Self {
        Self {
            attempts: 2,
            initial_backoff: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// 不重试：只调用一次
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn retry_on(&self) -> &HashSet<FailureKind> {
        &self.retry_on
    }

    pub fn should_retry(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// 第 attempt 次（从 0 开始）重试前的基础等待时长，不含 jitter，已按 max_backoff 封顶
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_backoff.as_secs_f64();
        if !secs.is_finite() || secs > cap {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// 实际等待时长：基础退避，开启 jitter 时乘以 [0.7, 1.3] 的随机因子
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        if !self.jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        base.mul_f64(factor)
    }
}

/// 退避等待的抽象
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 真实等待：tokio::time::sleep
#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 重试执行器：持有 Sleeper，可在多个调用方间共享
#[derive(Clone)]
pub struct RetryExecutor {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor").finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// 在 policy 下调用 op；label 仅用于日志
    pub async fn run<T, E, F, Fut>(&self, policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let attempts = policy.attempts().max(1);
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let kind = err.failure_kind();
            if !policy.should_retry(kind) {
                tracing::debug!(op = label, ?kind, error = %err, "failure not retryable");
                return Err(err);
            }
            if attempt + 1 >= attempts {
                tracing::warn!(op = label, attempts, error = %err, "retry attempts exhausted");
                return Err(err);
            }
            let delay = policy.delay_for(attempt);
            tracing::warn!(
                op = label,
                attempt = attempt + 1,
                attempts,
                ?kind,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[derive(Debug)]
    struct TestError {
        kind: FailureKind,
        call: u32,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?} on call {}", self.kind, self.call)
        }
    }

    impl Classify for TestError {
        fn failure_kind(&self) -> FailureKind {
            self.kind
        }
    }

    fn policy(attempts: u32, initial_ms: u64, max_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            multiplier,
            false,
            FailureKind::transient_kinds(),
        )
    }

    fn recording() -> (Arc<RecordingSleeper>, RetryExecutor) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let exec = RetryExecutor::with_sleeper(sleeper.clone());
        (sleeper, exec)
    }

    #[tokio::test]
    async fn test_succeeds_after_k_failures_with_k_sleeps() {
        let (sleeper, exec) = recording();
        let calls = AtomicU32::new(0);
        let p = policy(5, 100, 250, 2.0);

        let result: Result<&str, TestError> = exec
            .run(&p, "flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 3 {
                        Err(TestError { kind: FailureKind::Network, call: n })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let slept = sleeper.slept.lock().unwrap().clone();
        assert_eq!(
            slept,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(250),
            ]
        );
        assert!(slept.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let (sleeper, exec) = recording();
        let calls = AtomicU32::new(0);
        let p = policy(3, 10, 1000, 2.0);

        let result: Result<(), TestError> = exec
            .run(&p, "always-fails", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(TestError { kind: FailureKind::Timeout, call: n }) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.call, 3);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_kind_fails_immediately() {
        let (sleeper, exec) = recording();
        let calls = AtomicU32::new(0);
        let p = policy(4, 10, 1000, 2.0);

        let result: Result<(), TestError> = exec
            .run(&p, "bad-input", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(TestError { kind: FailureKind::InvalidInput, call: n }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(5, 1000, 3000, 10.0);
        assert_eq!(p.backoff_for(0), Duration::from_secs(1));
        assert_eq!(p.backoff_for(1), Duration::from_secs(3));
        assert_eq!(p.backoff_for(2), Duration::from_secs(3));
        assert_eq!(p.backoff_for(40), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy::new(
            3,
            Duration::from_millis(1000),
            Duration::from_millis(1000),
            2.0,
            true,
            FailureKind::transient_kinds(),
        );
        for _ in 0..200 {
            let d = p.delay_for(0);
            assert!(d >= Duration::from_millis(700), "{d:?}");
            assert!(d <= Duration::from_millis(1300), "{d:?}");
        }
    }

    #[test]
    fn test_attempts_never_below_one() {
        let p = RetryPolicy::new(
            0,
            Duration::from_millis(1),
            Duration::from_millis(1),
            2.0,
            false,
            HashSet::new(),
        );
        assert_eq!(p.attempts(), 1);
        assert_eq!(RetryPolicy::for_tools().attempts(), 2);
        assert_eq!(RetryPolicy::for_llm().initial_backoff(), Duration::from_millis(400));
    }
}
