//! Sort types and feed ordering
//!
//! Every sort type maps onto one of five deterministic comparators:
//!  - hot: logarithmic score decayed by age
//!  - new: newest first
//!  - active: most recent reply (or publication) first
//!  - top: highest score first
//!  - controversial: many votes, evenly split, first
//!
//! Time-windowed variants (`topDay`, `controversialWeek`, ...) share the
//! comparator of their family; the window itself is applied by the subplebbit
//! when it builds the pages.

use crate::comment::Comment;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Reference epoch of the hot score, in seconds.
const HOT_EPOCH: i64 = 1_134_028_003;

/// Seconds of age that weigh as much as one order of magnitude of score.
const HOT_DECAY: f64 = 45_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortType {
    Hot,
    New,
    Active,
    TopHour,
    TopDay,
    TopWeek,
    TopMonth,
    TopYear,
    TopAll,
    ControversialHour,
    ControversialDay,
    ControversialWeek,
    ControversialMonth,
    ControversialYear,
    ControversialAll,
}

/// Comparator family of a sort type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortAlgorithm {
    Hot,
    New,
    Active,
    Top,
    Controversial,
}

impl SortType {
    pub const ALL: [SortType; 15] = [
        SortType::Hot,
        SortType::New,
        SortType::Active,
        SortType::TopHour,
        SortType::TopDay,
        SortType::TopWeek,
        SortType::TopMonth,
        SortType::TopYear,
        SortType::TopAll,
        SortType::ControversialHour,
        SortType::ControversialDay,
        SortType::ControversialWeek,
        SortType::ControversialMonth,
        SortType::ControversialYear,
        SortType::ControversialAll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortType::Hot => "hot",
            SortType::New => "new",
            SortType::Active => "active",
            SortType::TopHour => "topHour",
            SortType::TopDay => "topDay",
            SortType::TopWeek => "topWeek",
            SortType::TopMonth => "topMonth",
            SortType::TopYear => "topYear",
            SortType::TopAll => "topAll",
            SortType::ControversialHour => "controversialHour",
            SortType::ControversialDay => "controversialDay",
            SortType::ControversialWeek => "controversialWeek",
            SortType::ControversialMonth => "controversialMonth",
            SortType::ControversialYear => "controversialYear",
            SortType::ControversialAll => "controversialAll",
        }
    }

    pub fn algorithm(&self) -> SortAlgorithm {
        match self {
            SortType::Hot => SortAlgorithm::Hot,
            SortType::New => SortAlgorithm::New,
            SortType::Active => SortAlgorithm::Active,
            SortType::TopHour
            | SortType::TopDay
            | SortType::TopWeek
            | SortType::TopMonth
            | SortType::TopYear
            | SortType::TopAll => SortAlgorithm::Top,
            SortType::ControversialHour
            | SortType::ControversialDay
            | SortType::ControversialWeek
            | SortType::ControversialMonth
            | SortType::ControversialYear
            | SortType::ControversialAll => SortAlgorithm::Controversial,
        }
    }
}

impl fmt::Display for SortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown sort type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownSortType(pub String);

impl fmt::Display for UnknownSortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown sort type: {}", self.0)
    }
}

impl std::error::Error for UnknownSortType {}

impl FromStr for SortType {
    type Err = UnknownSortType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortType::ALL
            .iter()
            .find(|sort_type| sort_type.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownSortType(s.to_string()))
    }
}

/// Hot score: order of magnitude of the net score plus an age bonus.
pub fn hot_score(comment: &Comment) -> f64 {
    let score = comment.score();
    let order = (score.unsigned_abs().max(1) as f64).log10();
    let sign = score.signum() as f64;
    let seconds = comment.timestamp().saturating_sub(HOT_EPOCH) as f64;
    let raw = sign * order + seconds / HOT_DECAY;
    (raw * 1e7).round() / 1e7
}

/// Controversial score: vote magnitude raised to the balance of the split.
pub fn controversial_score(comment: &Comment) -> f64 {
    let upvotes = comment.upvotes();
    let downvotes = comment.downvotes();
    if upvotes == 0 || downvotes == 0 {
        return 0.0;
    }
    let magnitude = upvotes.saturating_add(downvotes) as f64;
    let balance = if upvotes > downvotes {
        downvotes as f64 / upvotes as f64
    } else {
        upvotes as f64 / downvotes as f64
    };
    magnitude.powf(balance)
}

fn active_timestamp(comment: &Comment) -> i64 {
    comment
        .update
        .last_reply_timestamp
        .unwrap_or(0)
        .max(comment.timestamp())
}

/// Descending comparator for a sort type.
pub fn compare(a: &Comment, b: &Comment, sort_type: SortType) -> Ordering {
    match sort_type.algorithm() {
        SortAlgorithm::Hot => hot_score(b).total_cmp(&hot_score(a)),
        SortAlgorithm::New => b.timestamp().cmp(&a.timestamp()),
        SortAlgorithm::Active => active_timestamp(b).cmp(&active_timestamp(a)),
        SortAlgorithm::Top => b.score().cmp(&a.score()),
        SortAlgorithm::Controversial => {
            controversial_score(b).total_cmp(&controversial_score(a))
        }
    }
}

/// Sort comments in place. The sort is stable: ties keep their input order.
pub fn sort_comments<C: Borrow<Comment>>(comments: &mut [C], sort_type: SortType) {
    comments.sort_by(|a, b| compare(a.borrow(), b.borrow(), sort_type));
}
