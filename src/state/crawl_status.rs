/// Crawl status definitions for a peer within one epoch
///
/// Waiting is implicit in the store (neither flag present); Doing and Done are
/// epoch-scoped flags. Transitions only move forward within an epoch.
use std::fmt;

/// Represents the crawl status of a peer in the current epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlStatus {
    /// Known but not yet picked up this epoch
    Waiting,

    /// A crawl session is (or was, before a crash) running for this peer
    Doing,

    /// The crawl session finished; terminal for the epoch
    Done,
}

impl CrawlStatus {
    /// Returns true if moving from `self` to `next` keeps the status monotonic
    ///
    /// Waiting -> Doing -> Done, with Waiting -> Done allowed for peers that
    /// complete without an observed Doing flag. Done is terminal.
    pub fn can_transition_to(&self, next: CrawlStatus) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Doing)
                | (Self::Waiting, Self::Done)
                | (Self::Doing, Self::Done)
                | (Self::Doing, Self::Doing)
        )
    }

    /// Converts the status to its string representation in keys and stats
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Doing => "doing",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        assert!(CrawlStatus::Waiting.can_transition_to(CrawlStatus::Doing));
        assert!(CrawlStatus::Doing.can_transition_to(CrawlStatus::Done));
        assert!(CrawlStatus::Waiting.can_transition_to(CrawlStatus::Done));

        assert!(!CrawlStatus::Done.can_transition_to(CrawlStatus::Waiting));
        assert!(!CrawlStatus::Done.can_transition_to(CrawlStatus::Doing));
        assert!(!CrawlStatus::Doing.can_transition_to(CrawlStatus::Waiting));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", CrawlStatus::Waiting), "waiting");
        assert_eq!(CrawlStatus::Done.to_string(), "done");
    }
}
