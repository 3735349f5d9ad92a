use std::time::{Duration, Instant};

/// 断点记录写入节流器
///
/// 距上次写入同时满足“新增字节数”和“时间间隔”两个条件时才允许写入，
/// 避免每个数据块都落盘。
pub struct SyncThrottle {
    min_bytes: u64,
    min_interval: Duration,
    last_bytes: u64,
    last_sync: Instant,
}

impl SyncThrottle {
    pub fn new(min_bytes: u64, min_interval: Duration, start_bytes: u64) -> Self {
        Self {
            min_bytes,
            min_interval,
            last_bytes: start_bytes,
            last_sync: Instant::now(),
        }
    }

    pub fn should_sync(&self, downloaded: u64) -> bool {
        downloaded.saturating_sub(self.last_bytes) >= self.min_bytes
            && self.last_sync.elapsed() >= self.min_interval
    }

    pub fn mark(&mut self, downloaded: u64) {
        self.last_bytes = downloaded;
        self.last_sync = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_both_bytes_and_time() {
        let mut throttle = SyncThrottle::new(100, Duration::from_millis(30), 0);
        assert!(!throttle.should_sync(500));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!throttle.should_sync(50));
        assert!(throttle.should_sync(100));

        throttle.mark(100);
        assert!(!throttle.should_sync(300));
    }

    #[test]
    fn test_zero_thresholds_always_sync() {
        let throttle = SyncThrottle::new(0, Duration::ZERO, 10);
        assert!(throttle.should_sync(10));
    }
}
