//! 核心层：重试、错误与恢复、运行状态、装配

pub mod builder;
pub mod error;
pub mod recovery;
pub mod retry;
pub mod state;

pub use builder::{create_llm_from_config, select_provider, AgentBuilder, LlmProvider};
pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use retry::{Classify, FailureKind, RetryExecutor, RetryPolicy, Sleeper, TokioSleeper};
pub use state::{RunOutcome, RunState};
