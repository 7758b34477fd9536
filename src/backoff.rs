use std::time::Duration;

const INITIAL: Duration = Duration::from_secs(1);
const MAX: Duration = Duration::from_secs(120);

/// Doubling retry delay for reconnect loops.
///
/// Starts at one second and doubles on every [`Backoff::next_delay`] until it saturates at the
/// cap. Once saturated, [`Backoff::can_quit`] reports `true` and the caller may give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    saturated: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL, MAX)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
            saturated: false,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.current >= self.max {
            self.saturated = true;
        }
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn can_quit(&self) -> bool {
        self.saturated
    }

    pub fn reset(&mut self) {
        self.current = INITIAL.min(self.max);
        self.saturated = false;
    }
}
