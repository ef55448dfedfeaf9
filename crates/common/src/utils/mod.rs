/// 工具函数集合

/// 计算轮询次数上限：ceil(timeout / interval)，interval 为 0 时只尝试一次
pub fn bounded_attempts(timeout_secs: u64, retry_interval_secs: u64) -> u64 {
    if timeout_secs == 0 {
        return 0;
    }
    if retry_interval_secs == 0 {
        return 1;
    }
    timeout_secs.div_ceil(retry_interval_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_attempts() {
        assert_eq!(bounded_attempts(0, 1), 0);
        assert_eq!(bounded_attempts(5, 1), 5);
        assert_eq!(bounded_attempts(5, 2), 3);
        assert_eq!(bounded_attempts(5, 0), 1);
    }
}
