use std::{fmt::Display, str::FromStr};

use chrono::{Datelike, Duration, NaiveDate};
use enum_iterator::Sequence;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::metawin::WeeklyEventActivity;

/// Relative periods a dashboard user can pick, in selector order.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Sequence)]
pub enum TimeWindow {
    Last7Days,
    LastMonth,
    Last3Months,
    LastYear,
    ThisYear,
    AllTime,
}

use TimeWindow::*;

#[derive(Debug, Error, PartialEq)]
pub enum ParseTimeWindowError {
    #[error("failed to parse time window {0}")]
    UnknownTimeWindow(String),
}

impl FromStr for TimeWindow {
    type Err = ParseTimeWindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "d7" | "Last 7 days" => Ok(Last7Days),
            "d30" | "Last month" => Ok(LastMonth),
            "d90" | "Last 3 months" => Ok(Last3Months),
            "d365" | "Last year" => Ok(LastYear),
            "ytd" | "This year" => Ok(ThisYear),
            "all" | "All time" => Ok(AllTime),
            unknown_time_window => Err(ParseTimeWindowError::UnknownTimeWindow(
                unknown_time_window.to_string(),
            )),
        }
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for TimeWindow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.key())
    }
}

impl TimeWindow {
    pub fn key(&self) -> &'static str {
        match self {
            Last7Days => "d7",
            LastMonth => "d30",
            Last3Months => "d90",
            LastYear => "d365",
            ThisYear => "ytd",
            AllTime => "all",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Last7Days => "Last 7 days",
            LastMonth => "Last month",
            Last3Months => "Last 3 months",
            LastYear => "Last year",
            ThisYear => "This year",
            AllTime => "All time",
        }
    }

    /// Exclusive lower bound on row dates. Months and years are fixed day counts, not calendar
    /// lengths. `None` means nothing is cut off.
    pub fn cutoff(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            Last7Days => Some(today - Duration::days(7)),
            LastMonth => Some(today - Duration::days(30)),
            Last3Months => Some(today - Duration::days(90)),
            LastYear => Some(today - Duration::days(365)),
            ThisYear => today.with_ordinal(1),
            AllTime => None,
        }
    }
}

/// Rows dated strictly after the window's cutoff. The input is left untouched.
pub fn filter(
    dataset: &[WeeklyEventActivity],
    window: TimeWindow,
    today: NaiveDate,
) -> Vec<WeeklyEventActivity> {
    match window.cutoff(today) {
        None => dataset.to_vec(),
        Some(cutoff) => dataset
            .iter()
            .filter(|row| row.tx_dt > cutoff)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use enum_iterator::all;

    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn row_on(tx_dt: NaiveDate) -> WeeklyEventActivity {
        WeeklyEventActivity {
            tx_dt,
            contract_address: "0xabc".to_string(),
            event_name: "EntrySold".to_string(),
            tot_txs_count: 1,
            weekly_eth_fee: 0.01,
            avg_gas_eth_gas_fee_paid_by_smart_contract: Some(0.01),
            rolling_avg_gas_eth_gas_fee: None,
        }
    }

    #[test]
    fn time_window_iter_test() {
        let windows = all::<TimeWindow>().collect::<Vec<_>>();
        assert_eq!(
            windows,
            vec![Last7Days, LastMonth, Last3Months, LastYear, ThisYear, AllTime]
        );
    }

    #[test]
    fn parse_test() {
        assert_eq!("d7".parse::<TimeWindow>().unwrap(), Last7Days);
        assert_eq!("Last 3 months".parse::<TimeWindow>().unwrap(), Last3Months);
        assert_eq!("all".parse::<TimeWindow>().unwrap(), AllTime);
        assert_eq!(
            "m5".parse::<TimeWindow>(),
            Err(ParseTimeWindowError::UnknownTimeWindow("m5".to_string()))
        );
    }

    #[test]
    fn key_and_label_round_trip_test() {
        for window in all::<TimeWindow>() {
            assert_eq!(window.key().parse::<TimeWindow>().unwrap(), window);
            assert_eq!(window.to_string().parse::<TimeWindow>().unwrap(), window);
        }
    }

    #[test]
    fn cutoff_test() {
        let today = date(2024, 3, 15);
        assert_eq!(Last7Days.cutoff(today), Some(date(2024, 3, 8)));
        assert_eq!(LastMonth.cutoff(today), Some(date(2024, 2, 14)));
        assert_eq!(Last3Months.cutoff(today), Some(date(2023, 12, 16)));
        assert_eq!(LastYear.cutoff(today), Some(date(2023, 3, 16)));
        assert_eq!(ThisYear.cutoff(today), Some(date(2024, 1, 1)));
        assert_eq!(AllTime.cutoff(today), None);
    }

    #[test]
    fn last_7_days_excludes_cutoff_day_test() {
        let today = date(2024, 3, 15);
        let dataset = vec![
            row_on(today - Duration::days(7)),
            row_on(today - Duration::days(6)),
        ];

        let filtered = filter(&dataset, Last7Days, today);

        assert_eq!(filtered, vec![row_on(today - Duration::days(6))]);
    }

    #[test]
    fn this_year_excludes_january_first_test() {
        let today = date(2024, 3, 15);
        let dataset = vec![
            row_on(date(2023, 12, 31)),
            row_on(date(2024, 1, 1)),
            row_on(date(2024, 1, 2)),
        ];

        let filtered = filter(&dataset, ThisYear, today);

        assert_eq!(filtered, vec![row_on(date(2024, 1, 2))]);
    }

    #[test]
    fn all_time_is_identity_test() {
        let today = date(2024, 3, 15);
        let dataset = vec![
            row_on(date(2020, 1, 1)),
            row_on(date(2024, 3, 20)),
            row_on(date(2022, 6, 1)),
        ];

        assert_eq!(filter(&dataset, AllTime, today), dataset);
    }

    #[test]
    fn filter_keeps_input_order_and_leaves_input_alone_test() {
        let today = date(2024, 3, 15);
        let dataset = vec![
            row_on(date(2024, 3, 14)),
            row_on(date(2023, 1, 1)),
            row_on(date(2024, 3, 10)),
        ];
        let before = dataset.clone();

        let filtered = filter(&dataset, LastMonth, today);

        assert_eq!(
            filtered,
            vec![row_on(date(2024, 3, 14)), row_on(date(2024, 3, 10))]
        );
        assert_eq!(dataset, before);
    }

    #[test]
    fn empty_dataset_test() {
        assert!(filter(&[], LastYear, date(2024, 3, 15)).is_empty());
    }
}
