use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Business day used when a barbershop has no schedule configured.
pub const DEFAULT_OPEN: &str = "09:00";
pub const DEFAULT_CLOSE: &str = "18:00";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpeningPeriod {
    pub day: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpeningHours {
    pub slots: Vec<OpeningPeriod>,
}

impl OpeningHours {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let hours: OpeningHours = serde_json::from_str(s)?;
        for period in &hours.slots {
            parse_weekday(&period.day)?;
            let start = parse_time(&period.start)?;
            let end = parse_time(&period.end)?;
            if end <= start {
                anyhow::bail!("period ends before it starts: {}-{}", period.start, period.end);
            }
        }
        Ok(hours)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"slots":[]}"#.to_string())
    }

    /// Open periods for the weekday of `date`. An empty schedule means the
    /// default business day, every day of the week.
    pub fn periods_on(&self, date: NaiveDate) -> Vec<(NaiveTime, NaiveTime)> {
        if self.slots.is_empty() {
            return match (parse_time(DEFAULT_OPEN), parse_time(DEFAULT_CLOSE)) {
                (Ok(open), Ok(close)) => vec![(open, close)],
                _ => vec![],
            };
        }

        let weekday = weekday_key(date.weekday());
        let mut periods: Vec<_> = self
            .slots
            .iter()
            .filter(|p| p.day.to_lowercase() == weekday)
            .filter_map(|p| Some((parse_time(&p.start).ok()?, parse_time(&p.end).ok()?)))
            .collect();
        periods.sort();
        periods
    }

    /// Slot start times on `date`, every `step_minutes`, such that the whole
    /// slot fits inside an open period.
    pub fn time_grid(&self, date: NaiveDate, step_minutes: i64) -> Vec<NaiveTime> {
        let step = chrono::Duration::minutes(step_minutes.max(5));
        let mut grid = vec![];
        for (open, close) in self.periods_on(date) {
            let mut t = open;
            // Guard against wrap-around past midnight.
            while t < close && close.signed_duration_since(t) >= step {
                grid.push(t);
                let (next, wrapped) = t.overflowing_add_signed(step);
                if wrapped != 0 {
                    break;
                }
                t = next;
            }
        }
        grid
    }

    pub fn to_human_readable(&self) -> String {
        if self.slots.is_empty() {
            return format!("Todos os dias: {DEFAULT_OPEN}-{DEFAULT_CLOSE}");
        }

        let day_order = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

        let mut sorted = self.slots.clone();
        sorted.sort_by_key(|p| {
            day_order
                .iter()
                .position(|d| *d == p.day.to_lowercase())
                .unwrap_or(7)
        });

        sorted
            .iter()
            .map(|p| format!("{}: {}-{}", day_label(&p.day), p.start, p.end))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn day_label(day: &str) -> &'static str {
    match day.to_lowercase().as_str() {
        "mon" => "Seg",
        "tue" => "Ter",
        "wed" => "Qua",
        "thu" => "Qui",
        "fri" => "Sex",
        "sat" => "Sáb",
        "sun" => "Dom",
        _ => "?",
    }
}

fn parse_weekday(s: &str) -> anyhow::Result<()> {
    match s.to_lowercase().as_str() {
        "mon" | "tue" | "wed" | "thu" | "fri" | "sat" | "sun" => Ok(()),
        _ => Err(anyhow::anyhow!("invalid weekday: {s}")),
    }
}

fn parse_time(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| anyhow::anyhow!("invalid time format: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn labels(times: &[NaiveTime]) -> Vec<String> {
        times.iter().map(|t| t.format("%H:%M").to_string()).collect()
    }

    #[test]
    fn test_parse_valid_json() {
        let json = r#"{"slots":[{"day":"mon","start":"09:00","end":"17:00"},{"day":"tue","start":"09:00","end":"17:00"}]}"#;
        let hours = OpeningHours::from_json(json).unwrap();
        assert_eq!(hours.slots.len(), 2);
        assert_eq!(hours.slots[0].day, "mon");
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(OpeningHours::from_json("not json").is_err());
    }

    #[test]
    fn test_parse_invalid_day() {
        let json = r#"{"slots":[{"day":"xyz","start":"09:00","end":"17:00"}]}"#;
        assert!(OpeningHours::from_json(json).is_err());
    }

    #[test]
    fn test_parse_inverted_period() {
        let json = r#"{"slots":[{"day":"mon","start":"17:00","end":"09:00"}]}"#;
        assert!(OpeningHours::from_json(json).is_err());
    }

    #[test]
    fn test_grid_follows_weekday_schedule() {
        let hours = OpeningHours::from_json(
            r#"{"slots":[{"day":"mon","start":"09:00","end":"11:00"}]}"#,
        )
        .unwrap();
        // 2025-06-16 is a Monday, 2025-06-17 a Tuesday
        assert_eq!(
            labels(&hours.time_grid(date("2025-06-16"), 30)),
            vec!["09:00", "09:30", "10:00", "10:30"]
        );
        assert!(hours.time_grid(date("2025-06-17"), 30).is_empty());
    }

    #[test]
    fn test_grid_skips_partial_slot_at_close() {
        let hours = OpeningHours::from_json(
            r#"{"slots":[{"day":"mon","start":"09:00","end":"10:45"}]}"#,
        )
        .unwrap();
        assert_eq!(
            labels(&hours.time_grid(date("2025-06-16"), 30)),
            vec!["09:00", "09:30", "10:00"]
        );
    }

    #[test]
    fn test_empty_schedule_uses_default_day() {
        let hours = OpeningHours::default();
        let grid = hours.time_grid(date("2025-06-15"), 60);
        assert_eq!(grid.first().map(|t| t.format("%H:%M").to_string()), Some("09:00".into()));
        assert_eq!(grid.last().map(|t| t.format("%H:%M").to_string()), Some("17:00".into()));
    }

    #[test]
    fn test_to_human_readable() {
        let json = r#"{"slots":[{"day":"fri","start":"10:00","end":"16:00"},{"day":"mon","start":"09:00","end":"17:00"}]}"#;
        let hours = OpeningHours::from_json(json).unwrap();
        assert_eq!(hours.to_human_readable(), "Seg: 09:00-17:00, Sex: 10:00-16:00");
    }
}
