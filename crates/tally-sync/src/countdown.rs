use chrono::{DateTime, Duration, Utc};

/// Time left before ordering closes. Advisory only; the server decides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Countdown {
    deadline: DateTime<Utc>,
}

impl Countdown {
    /// Remaining seconds at or below which the countdown is urgent.
    pub const URGENT_SECS: i64 = 5 * 60;

    pub fn new(deadline: DateTime<Utc>) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).max(Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn is_urgent(&self, now: DateTime<Utc>) -> bool {
        let left = self.remaining(now);
        !left.is_zero() && left <= Duration::seconds(Self::URGENT_SECS)
    }

    /// `MM:SS`, minutes uncapped (`75:03`), or `Expired`.
    pub fn format_mm_ss(&self, now: DateTime<Utc>) -> String {
        let left = self.remaining(now);
        if left.is_zero() {
            return "Expired".to_string();
        }
        let secs = left.num_seconds();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}
