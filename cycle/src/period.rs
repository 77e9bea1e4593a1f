//! Auction period boundaries.
//!
//! Auctions run in weekly cycles: Monday 01:00:00 through Sunday 23:59:59.
//! The settlement job always works on the most recently *completed* cycle,
//! so the boundaries are derived from the date one week before "now":
//!
//! ```text
//!   Mon 03-04 01:00          Sun 03-10 23:59:59   Mon 03-11 01:00
//!        |------- previous cycle -------|              |--- current ---> now
//! ```
//!
//! Everything here works on civil (zone-less) date-times; callers resolve the
//! result in the cadence's time zone.

use jiff::{
    Span, Timestamp,
    civil::{Date, DateTime},
    tz::TimeZone,
};

/// Hour of the day at which every auction cycle starts.
pub const CYCLE_START_HOUR: i8 = 1;

/// Length of a cycle in whole days between its first and last date.
const CYCLE_LAST_DAY_OFFSET: i64 = 6;

/// Start of the previous auction cycle relative to `now`: the Monday of the
/// week containing `now - 7 days`, at 01:00.
///
/// If `now` is a Monday before 01:00 the current cycle has not started yet,
/// and this returns the Monday of the prior week, whose cycle ended the
/// evening before.
pub fn previous_auction_start(now: DateTime) -> DateTime {
    let week_ago = now.date().saturating_sub(Span::new().days(7));
    monday_of(week_ago).at(CYCLE_START_HOUR, 0, 0, 0)
}

/// Last second of the cycle that started at `start`: six days later at
/// 23:59:59.
pub fn previous_auction_end(start: DateTime) -> DateTime {
    start
        .date()
        .saturating_add(Span::new().days(CYCLE_LAST_DAY_OFFSET))
        .at(23, 59, 59, 0)
}

fn monday_of(date: Date) -> Date {
    let offset = date.weekday().to_monday_zero_offset();
    date.saturating_sub(Span::new().days(i64::from(offset)))
}

/// A completed auction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuctionPeriod {
    pub start: DateTime,
    pub end: DateTime,
}

impl AuctionPeriod {
    /// The cycle that most recently finished before `now`.
    pub fn previous(now: DateTime) -> Self {
        let start = previous_auction_start(now);
        Self {
            start,
            end: previous_auction_end(start),
        }
    }

    /// The cycle that most recently finished before `now`, with `now`
    /// interpreted in `tz`.
    pub fn previous_in(now: Timestamp, tz: &TimeZone) -> Self {
        Self::previous(now.to_zoned(tz.clone()).datetime())
    }

    /// Resolve both boundaries to instants in `tz`.
    pub fn to_timestamps(
        &self,
        tz: &TimeZone,
    ) -> Result<(Timestamp, Timestamp), jiff::Error> {
        let start = self.start.to_zoned(tz.clone())?.timestamp();
        let end = self.end.to_zoned(tz.clone())?.timestamp();
        Ok((start, end))
    }

    /// Whether a civil date-time falls inside the cycle (inclusive).
    pub fn contains(&self, at: DateTime) -> bool {
        self.start <= at && at <= self.end
    }
}
