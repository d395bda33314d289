//! Named time intervals referenced by a route's `mute_time_intervals` /
//! `active_time_intervals` (§3, "Time interval (ADDED)").

use jiff::{civil::Weekday, Timestamp, Zoned};
use serde::{Deserialize, Serialize};

/// One bound of a `HH:MM` range, inclusive of the start, exclusive of the
/// end, same convention as upstream Alertmanager's `mute_time_intervals`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
	pub start_minutes: u16,
	pub end_minutes: u16,
}

impl TimeRange {
	fn contains(&self, minute_of_day: u16) -> bool {
		if self.start_minutes <= self.end_minutes {
			minute_of_day >= self.start_minutes && minute_of_day < self.end_minutes
		} else {
			// Wraps past midnight.
			minute_of_day >= self.start_minutes || minute_of_day < self.end_minutes
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeIntervalSpec {
	#[serde(default)]
	pub weekdays: Vec<Weekday>,
	#[serde(default)]
	pub times: Vec<TimeRange>,
	#[serde(default)]
	pub days_of_month: Vec<i8>,
	#[serde(default)]
	pub months: Vec<u8>,
	#[serde(default)]
	pub years: Vec<i16>,
}

impl TimeIntervalSpec {
	fn contains(&self, now: &Zoned) -> bool {
		if !self.weekdays.is_empty() && !self.weekdays.contains(&now.weekday()) {
			return false;
		}
		if !self.days_of_month.is_empty() && !self.days_of_month.contains(&now.day()) {
			return false;
		}
		if !self.months.is_empty() && !self.months.contains(&(now.month() as u8)) {
			return false;
		}
		if !self.years.is_empty() && !self.years.contains(&(now.year() as i16)) {
			return false;
		}
		if !self.times.is_empty() {
			let minute_of_day = now.hour() as u16 * 60 + now.minute() as u16;
			if !self.times.iter().any(|t| t.contains(minute_of_day)) {
				return false;
			}
		}
		true
	}
}

/// A named time interval: a disjunction of [`TimeIntervalSpec`] ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeInterval {
	pub name: String,
	pub ranges: Vec<TimeIntervalSpec>,
}

impl TimeInterval {
	/// Whether `now` (interpreted in `location`) falls in any constituent
	/// range. An interval with zero ranges never matches.
	pub fn contains(&self, now: Timestamp, location: &jiff::tz::TimeZone) -> bool {
		let zoned = now.to_zoned(location.clone());
		self.ranges.iter().any(|r| r.contains(&zoned))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_interval_never_matches() {
		let interval = TimeInterval {
			name: "never".into(),
			ranges: vec![],
		};
		assert!(!interval.contains(Timestamp::now(), &jiff::tz::TimeZone::UTC));
	}

	#[test]
	fn weekday_filter_excludes_other_days() {
		let saturday = "2026-08-01T12:00:00Z".parse::<Timestamp>().unwrap(); // a Saturday
		let interval = TimeInterval {
			name: "weekends".into(),
			ranges: vec![TimeIntervalSpec {
				weekdays: vec![Weekday::Saturday, Weekday::Sunday],
				..Default::default()
			}],
		};
		assert!(interval.contains(saturday, &jiff::tz::TimeZone::UTC));

		let monday = "2026-08-03T12:00:00Z".parse::<Timestamp>().unwrap();
		assert!(!interval.contains(monday, &jiff::tz::TimeZone::UTC));
	}

	#[test]
	fn time_range_wraps_midnight() {
		let night = TimeRange {
			start_minutes: 22 * 60,
			end_minutes: 6 * 60,
		};
		assert!(night.contains(23 * 60));
		assert!(night.contains(0));
		assert!(night.contains(5 * 60 + 30));
		assert!(!night.contains(12 * 60));
	}
}
