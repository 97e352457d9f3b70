use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Closed から Open へ遷移する連続失敗回数
    pub failure_threshold: u32,
    /// HalfOpen から Closed へ戻るために必要な試行成功回数
    pub success_threshold: u32,
    /// Open を維持する時間。経過後の最初の呼び出しが試行になる
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
        }
    }
}
