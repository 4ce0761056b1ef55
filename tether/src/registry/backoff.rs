use std::time::Duration;

/// Recovery delays for attempts 1..=6; later attempts use [`TAIL`].
///
/// The ladder keeps recovery fast for transient faults while bounding the
/// probe rate during a real outage.
const LADDER: [Duration; 6] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(32),
];

const TAIL: Duration = Duration::from_secs(50);

/// Delay before retry number `attempt` (1-based).
pub fn retry_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return LADDER[0];
    }
    LADDER
        .get(attempt as usize - 1)
        .copied()
        .unwrap_or(TAIL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_is_doubling_then_fixed() {
        let secs: Vec<u64> = (1..=9).map(|a| retry_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 50, 50, 50]);
    }

    #[test]
    fn test_attempt_zero_clamps_to_first_step() {
        assert_eq!(retry_delay(0), Duration::from_secs(1));
    }
}
