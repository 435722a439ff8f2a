use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeState {
    pub name: &'static str,
    pub seconds: u64,
}

pub const TIME_STATES: [TimeState; 8] = [
    TimeState { name: "1 hour", seconds: 3600 },
    TimeState { name: "2 hours", seconds: 7200 },
    TimeState { name: "4 hours", seconds: 14400 },
    TimeState { name: "12 hours", seconds: 43200 },
    TimeState { name: "1 day", seconds: 86400 },
    TimeState { name: "1 week", seconds: 604800 },
    TimeState { name: "1 month", seconds: 2592000 },
    TimeState { name: "1 year", seconds: 31104000 },
];

pub const DEFAULT_TIME_UNIT_SECONDS: u64 = TIME_STATES[0].seconds;

const LAST_INDEX: usize = TIME_STATES.len() - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeRangeError {
    #[error("time range index {0} out of range (0..=7)")]
    OutOfRange(usize),
}

/// Position in [`TIME_STATES`]. Index 0 is the most recent, shortest window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    index: usize,
}

impl TimeRange {
    pub fn new(index: usize) -> Result<Self, TimeRangeError> {
        if index > LAST_INDEX {
            return Err(TimeRangeError::OutOfRange(index));
        }
        Ok(Self { index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> TimeState {
        TIME_STATES[self.index]
    }

    pub fn seconds(&self) -> u64 {
        self.state().seconds
    }

    pub fn is_default(&self) -> bool {
        self.seconds() == DEFAULT_TIME_UNIT_SECONDS
    }

    pub fn can_go_back(&self) -> bool {
        self.index < LAST_INDEX
    }

    pub fn can_go_forward(&self) -> bool {
        self.index > 0
    }

    /// Widen the window further into the past. Stays put on the last state.
    pub fn back(self) -> Self {
        Self {
            index: (self.index + 1).min(LAST_INDEX),
        }
    }

    pub fn forward(self) -> Self {
        Self {
            index: self.index.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeRangeView {
    pub index: usize,
    pub name: &'static str,
    pub seconds: u64,
    pub can_go_back: bool,
    pub can_go_forward: bool,
}

impl From<TimeRange> for TimeRangeView {
    fn from(r: TimeRange) -> Self {
        Self {
            index: r.index,
            name: r.state().name,
            seconds: r.seconds(),
            can_go_back: r.can_go_back(),
            can_go_forward: r.can_go_forward(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_one_hour() {
        let r = TimeRange::default();
        assert_eq!(r.seconds(), 3600);
        assert!(r.is_default());
        assert!(!r.can_go_forward());
        assert!(r.can_go_back());
    }

    #[test]
    fn paging_is_bounded_on_both_ends() {
        let mut r = TimeRange::default();
        for _ in 0..20 {
            r = r.back();
        }
        assert_eq!(r.index(), 7);
        assert_eq!(r.seconds(), 31104000);
        assert!(!r.can_go_back());

        let r = r.forward().forward();
        assert_eq!(r.seconds(), 604800);

        assert_eq!(TimeRange::default().forward(), TimeRange::default());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        assert_eq!(TimeRange::new(8), Err(TimeRangeError::OutOfRange(8)));
        assert_eq!(TimeRange::new(4).unwrap().seconds(), 86400);
    }

    #[test]
    fn view_carries_state_name() {
        let v = TimeRangeView::from(TimeRange::new(1).unwrap());
        assert_eq!(v.name, "2 hours");
        assert!(v.can_go_forward && v.can_go_back);
    }
}
