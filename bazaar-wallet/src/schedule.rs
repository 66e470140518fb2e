//! Payout windows.
//!
//! All arithmetic happens on the vendor's local wall clock. A local hour that
//! does not exist (spring-forward gap) resolves to the first valid instant after
//! the gap; an ambiguous hour (fall-back) resolves to the earlier instant. Week
//! steps add calendar days to the local date, never a fixed 168 hours.

use bazaar_core::CoreError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutFrequency {
    Weekly,
    Biweekly,
}

impl PayoutFrequency {
    pub fn cycle_weeks(&self) -> i64 {
        match self {
            PayoutFrequency::Weekly => 1,
            PayoutFrequency::Biweekly => 2,
        }
    }
}

/// A recurring `{weekday, hour}` point on the local calendar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeeklyWindow {
    pub weekday: Weekday,
    pub hour: u32,
}

impl WeeklyWindow {
    pub fn new(weekday: Weekday, hour: u32) -> Result<Self, CoreError> {
        if hour > 23 {
            return Err(CoreError::Invalid(format!(
                "window hour must be 0..=23, got {}",
                hour
            )));
        }
        Ok(Self { weekday, hour })
    }

    fn time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutSchedule {
    pub frequency: PayoutFrequency,
    pub cutoff: WeeklyWindow,
    pub payout: WeeklyWindow,
    #[serde(with = "tz_name")]
    pub timezone: Tz,
}

impl PayoutSchedule {
    pub fn new(
        frequency: PayoutFrequency,
        cutoff: WeeklyWindow,
        payout: WeeklyWindow,
        timezone: &str,
    ) -> Result<Self, CoreError> {
        let timezone = parse_tz(timezone)?;
        Ok(Self {
            frequency,
            cutoff,
            payout,
            timezone,
        })
    }

    /// First cutoff strictly after `at`; the sale belongs to the cycle it closes.
    pub fn next_cutoff_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.next_window(&self.cutoff, at, true)
    }

    pub fn next_payout_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.next_window(&self.payout, at, true)
    }

    pub fn next_payout_at_or_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.next_window(&self.payout, at, false)
    }

    /// When a sale made at `sale_at` becomes eligible: the first payout instant
    /// after its cycle's cutoff plus one more full cycle. Returns the instant
    /// and its local-date key.
    pub fn hold_target(&self, sale_at: DateTime<Utc>) -> (DateTime<Utc>, String) {
        let closing_cutoff = self.next_cutoff_after(sale_at);
        let held_until = self.add_weeks(closing_cutoff, self.frequency.cycle_weeks());
        let target = self.next_payout_at_or_after(held_until);
        (target, self.payout_key(target))
    }

    /// Next payout strictly after the previous one (one cycle on), or strictly
    /// after `now` for a vendor who has never been paid.
    pub fn next_payout_at(&self, last_payout_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        match last_payout_at {
            Some(last) => {
                let base = self.add_weeks(last, self.frequency.cycle_weeks() - 1);
                self.next_payout_after(base)
            }
            None => self.next_payout_after(now),
        }
    }

    pub fn payout_key(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone).format("%Y-%m-%d").to_string()
    }

    fn next_window(&self, window: &WeeklyWindow, at: DateTime<Utc>, strict: bool) -> DateTime<Utc> {
        let local_date = at.with_timezone(&self.timezone).date_naive();
        let ahead = (window.weekday.num_days_from_monday() as i64
            - local_date.weekday().num_days_from_monday() as i64)
            .rem_euclid(7);
        let mut day = local_date + Duration::days(ahead);

        // At most two iterations: this week's slot may already be behind `at`.
        loop {
            let candidate = self.resolve_local(day.and_time(window.time()));
            if candidate > at || (!strict && candidate == at) {
                return candidate;
            }
            day = next_week(day);
        }
    }

    fn add_weeks(&self, at: DateTime<Utc>, weeks: i64) -> DateTime<Utc> {
        if weeks == 0 {
            return at;
        }
        let local = at.with_timezone(&self.timezone).naive_local();
        self.resolve_local(local + Duration::days(7 * weeks))
    }

    fn resolve_local(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        let mut candidate = naive;
        for _ in 0..4 {
            if let Some(resolved) = self.timezone.from_local_datetime(&candidate).earliest() {
                return resolved.with_timezone(&Utc);
            }
            candidate += Duration::hours(1);
        }
        // No zone skips more than a couple of hours; treat as UTC if one ever does.
        Utc.from_utc_datetime(&naive)
    }
}

fn next_week(day: NaiveDate) -> NaiveDate {
    day + Duration::days(7)
}

pub fn parse_tz(name: &str) -> Result<Tz, CoreError> {
    name.parse::<Tz>()
        .map_err(|_| CoreError::Invalid(format!("unknown timezone: {}", name)))
}

mod tz_name {
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Tz, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<Tz>()
            .map_err(|_| serde::de::Error::custom(format!("unknown timezone: {}", raw)))
    }
}
