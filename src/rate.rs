/// 帧率计算器
/// Sliding-window throughput estimation
use std::collections::VecDeque;
use std::time::Instant;

/// 时间窗口容量 (样本数)
pub const RATE_WINDOW: usize = 30;

/// 滑动窗口FPS计算 + 全程平均FPS
#[derive(Debug, Clone)]
pub struct RateEstimator {
    timestamps: VecDeque<Instant>,
    rate: f64,
    frame_count: u64,
    start_time: Option<Instant>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            timestamps: VecDeque::with_capacity(RATE_WINDOW),
            rate: 0.0,
            frame_count: 0,
            start_time: None,
        }
    }

    pub fn tick(&mut self) -> f64 {
        self.tick_at(Instant::now())
    }

    /// 记录一个时间点并返回当前瞬时帧率
    ///
    /// 样本不足2个或窗口时长为0时, 保持上一次的帧率不变
    pub fn tick_at(&mut self, now: Instant) -> f64 {
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.frame_count += 1;

        if self.timestamps.len() == RATE_WINDOW {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);

        if let (Some(first), Some(last)) = (self.timestamps.front(), self.timestamps.back()) {
            if self.timestamps.len() >= 2 {
                let span = last.saturating_duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    self.rate = (self.timestamps.len() - 1) as f64 / span;
                }
            }
        }
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn average(&self) -> f64 {
        self.average_at(Instant::now())
    }

    /// 全程平均帧率, 首次tick之前为0
    pub fn average_at(&self, now: Instant) -> f64 {
        match self.start_time {
            Some(start) if self.frame_count > 0 => {
                let elapsed = now.saturating_duration_since(start).as_secs_f64();
                if elapsed > 0.0 {
                    self.frame_count as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_single_tick_keeps_initial_rate() {
        let mut est = RateEstimator::new();
        assert_eq!(est.tick_at(Instant::now()), 0.0);
        assert_eq!(est.frame_count(), 1);
    }

    #[test]
    fn test_converges_at_33ms() {
        let mut est = RateEstimator::new();
        let base = Instant::now();
        let mut rate = 0.0;
        for i in 0..30u32 {
            rate = est.tick_at(base + Duration::from_millis(33) * i);
        }
        // 29 / (29 * 0.033)
        assert!((rate - 30.30).abs() < 0.05, "rate = {rate}");
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut est = RateEstimator::new();
        let base = Instant::now();
        // 前10帧很慢, 之后40帧为10ms间隔
        for i in 0..10u32 {
            est.tick_at(base + Duration::from_secs(1) * i);
        }
        let fast_base = base + Duration::from_secs(10);
        let mut rate = 0.0;
        for i in 0..40u32 {
            rate = est.tick_at(fast_base + Duration::from_millis(10) * i);
        }
        assert!((rate - 100.0).abs() < 0.5, "rate = {rate}");
        assert_eq!(est.frame_count(), 50);
    }

    #[test]
    fn test_zero_span_keeps_previous_rate() {
        let mut est = RateEstimator::new();
        let base = Instant::now();
        est.tick_at(base);
        let r = est.tick_at(base + Duration::from_millis(50));
        assert!((r - 20.0).abs() < 1e-6);

        let mut same = RateEstimator::new();
        same.tick_at(base);
        assert_eq!(same.tick_at(base), 0.0);
    }

    #[test]
    fn test_average() {
        let mut est = RateEstimator::new();
        assert_eq!(est.average_at(Instant::now()), 0.0);
        let base = Instant::now();
        for i in 0..10u32 {
            est.tick_at(base + Duration::from_millis(100) * i);
        }
        let avg = est.average_at(base + Duration::from_secs(2));
        assert!((avg - 5.0).abs() < 1e-6);
    }
}
