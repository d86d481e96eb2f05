//! Trigger types for the minimal scheduler
//!
//! Two trigger shapes cover every job: fixed intervals from start, and
//! daily wall-clock times. Each job carries a misfire grace window: a
//! fire missed by no more than the grace is honored once on recovery,
//! anything older is dropped (coalesced).

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use std::time::Duration;

/// When a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fire every `interval` from scheduler start
    Interval { every: Duration },
    /// Fire at wall-clock (hour, minute) each day, local time
    Daily { hour: u32, minute: u32 },
}

impl Trigger {
    pub fn every_minutes(minutes: u64) -> Self {
        Self::Interval { every: Duration::from_secs(minutes * 60) }
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Self::Daily { hour: hour.min(23), minute: minute.min(59) }
    }

    /// Next fire time strictly after `after`
    pub fn next_fire(&self, after: DateTime<Local>) -> DateTime<Local> {
        match self {
            Self::Interval { every } => {
                after + ChronoDuration::from_std(*every).unwrap_or(ChronoDuration::seconds(60))
            },
            Self::Daily { hour, minute } => {
                let target = NaiveTime::from_hms_opt(*hour, *minute, 0).expect("validated time");
                let today = after.date_naive().and_time(target);
                let candidate = Local
                    .from_local_datetime(&today)
                    .earliest()
                    .unwrap_or(after);
                if candidate > after {
                    candidate
                } else {
                    let tomorrow = (after.date_naive() + ChronoDuration::days(1)).and_time(target);
                    Local.from_local_datetime(&tomorrow).earliest().unwrap_or(after)
                }
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Interval { every } => format!("every {} min", every.as_secs() / 60),
            Self::Daily { hour, minute } => format!("daily at {:02}:{:02}", hour, minute),
        }
    }
}

/// What to do with a fire time that has already passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfireDecision {
    /// Not due yet
    NotDue,
    /// Due now (or within the grace window): run it
    Fire,
    /// Missed beyond the grace window: skip and reschedule
    Drop,
}

/// Classify `now` against a scheduled fire time and grace window
pub fn misfire_decision(
    next_fire: DateTime<Local>,
    now: DateTime<Local>,
    grace: Duration,
) -> MisfireDecision {
    if now < next_fire {
        return MisfireDecision::NotDue;
    }
    let late = (now - next_fire).to_std().unwrap_or_default();
    if late <= grace {
        MisfireDecision::Fire
    } else {
        MisfireDecision::Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn local(h: u32, m: u32) -> DateTime<Local> {
        Local::now()
            .date_naive()
            .and_hms_opt(h, m, 0)
            .map(|naive| Local.from_local_datetime(&naive).earliest().unwrap())
            .unwrap()
    }

    #[test]
    fn interval_trigger_advances_by_its_period() {
        let trigger = Trigger::every_minutes(3);
        let now = local(10, 0);
        assert_eq!(trigger.next_fire(now), now + ChronoDuration::minutes(3));
    }

    #[test]
    fn daily_trigger_fires_later_today_or_tomorrow() {
        let trigger = Trigger::daily(8, 0);

        let before = local(6, 30);
        let next = trigger.next_fire(before);
        assert_eq!(next.hour(), 8);
        assert_eq!(next.date_naive(), before.date_naive());

        let after = local(9, 15);
        let next = trigger.next_fire(after);
        assert_eq!(next.hour(), 8);
        assert_eq!(next.date_naive(), after.date_naive() + ChronoDuration::days(1));
    }

    #[test]
    fn daily_trigger_exact_time_rolls_to_tomorrow() {
        let trigger = Trigger::daily(8, 0);
        let at = local(8, 0);
        let next = trigger.next_fire(at);
        assert_eq!(next.date_naive(), at.date_naive() + ChronoDuration::days(1));
    }

    #[test]
    fn misfire_grace_window_is_honored() {
        let fire = local(8, 0);
        let grace = Duration::from_secs(300);

        assert_eq!(misfire_decision(fire, local(7, 59), grace), MisfireDecision::NotDue);
        assert_eq!(misfire_decision(fire, local(8, 0), grace), MisfireDecision::Fire);
        assert_eq!(misfire_decision(fire, local(8, 4), grace), MisfireDecision::Fire);
        assert_eq!(misfire_decision(fire, local(8, 6), grace), MisfireDecision::Drop);
    }
}
