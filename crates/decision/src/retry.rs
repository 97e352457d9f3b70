use std::time::Duration;

/// 1 回だけ行う再試行の待ち時間設定。
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(50),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// 待ち時間を返す。jitter 有効時は基準値の ±50% の範囲でばらつかせる。
    pub fn compute_delay(&self) -> Duration {
        if !self.jitter {
            return self.backoff;
        }
        self.backoff.mul_f64(0.5 + rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_half_of_base() {
        let config = RetryConfig {
            backoff: Duration::from_millis(100),
            jitter: true,
        };
        for _ in 0..100 {
            let delay = config.compute_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_without_jitter() {
        let config = RetryConfig {
            backoff: Duration::from_millis(100),
            jitter: false,
        };
        assert_eq!(config.compute_delay(), Duration::from_millis(100));
    }
}
