//! Chart views for the dashboard tabs. A view is computed from the in-memory dataset the first
//! time a (day, time window, tab) selection is asked for and memoized after that.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    str::FromStr,
    sync::{Arc, RwLock},
};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    health::{HealthCheckable, HealthStatus},
    json_codecs::to_date_string,
    metawin::{WeeklyEventActivity, ENTRY_SOLD_EVENT},
    metrics,
    time_windows::{self, TimeWindow},
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tab {
    Transactions,
    Users,
    GasFees,
    Tickets,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseTabError {
    #[error("unknown tab {0}")]
    UnknownTab(String),
}

impl FromStr for Tab {
    type Err = ParseTabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transactions" => Ok(Tab::Transactions),
            "users" => Ok(Tab::Users),
            "gas-fees" => Ok(Tab::GasFees),
            "tickets" => Ok(Tab::Tickets),
            unknown_tab => Err(ParseTabError::UnknownTab(unknown_tab.to_string())),
        }
    }
}

impl Display for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tab::Transactions => write!(f, "transactions"),
            Tab::Users => write!(f, "users"),
            Tab::GasFees => write!(f, "gas-fees"),
            Tab::Tickets => write!(f, "tickets"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ViewError {
    #[error("tab {0} is not implemented")]
    NotImplemented(Tab),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Scatter,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Point {
    #[serde(serialize_with = "to_date_string")]
    pub x: NaiveDate,
    pub y: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Series {
    /// The color group, e.g. an event name or a contract address. `None` for single series
    /// charts.
    pub name: Option<String>,
    pub points: Vec<Point>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub title: String,
    pub kind: ChartKind,
    pub x_label: &'static str,
    pub y_label: &'static str,
    pub series: Vec<Series>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Count(i64),
    Eth(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Stat {
    pub label: &'static str,
    pub value: StatValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabView {
    pub tab: Tab,
    pub time_window: TimeWindow,
    pub time_window_label: &'static str,
    pub stats: Vec<Stat>,
    pub charts: Vec<Chart>,
}

const WEEK_LABEL: &str = "Week";
const TRANSACTIONS_LABEL: &str = "Number of Transactions";
const ETH_LABEL: &str = "ETH";

/// Sums `value` per date, one series per distinct `group` (or a single unnamed series when
/// `group` gives `None`). Series are ordered by name, points by date.
fn series_by<G, V>(rows: &[WeeklyEventActivity], group: G, value: V) -> Vec<Series>
where
    G: Fn(&WeeklyEventActivity) -> Option<&str>,
    V: Fn(&WeeklyEventActivity) -> f64,
{
    let mut grouped: BTreeMap<Option<&str>, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
    for row in rows {
        *grouped
            .entry(group(row))
            .or_default()
            .entry(row.tx_dt)
            .or_insert(0.0) += value(row);
    }

    grouped
        .into_iter()
        .map(|(name, points)| Series {
            name: name.map(str::to_string),
            points: points.into_iter().map(|(x, y)| Point { x, y }).collect(),
        })
        .collect()
}

fn bar_chart(title: &str, window: TimeWindow, y_label: &'static str, series: Vec<Series>) -> Chart {
    Chart {
        title: format!("{title} ({})", window.label()),
        kind: ChartKind::Bar,
        x_label: WEEK_LABEL,
        y_label,
        series,
    }
}

fn transactions_view(rows: &[WeeklyEventActivity], window: TimeWindow) -> TabView {
    let totals = metrics::totals(rows);
    let tx_count = |row: &WeeklyEventActivity| row.tot_txs_count as f64;

    TabView {
        tab: Tab::Transactions,
        time_window: window,
        time_window_label: window.label(),
        stats: vec![Stat {
            label: "Total Number of Transactions",
            value: StatValue::Count(totals.total_transaction_count),
        }],
        charts: vec![
            bar_chart(
                "Weekly Number of Transactions by Event",
                window,
                TRANSACTIONS_LABEL,
                series_by(rows, |row| Some(row.event_name.as_str()), tx_count),
            ),
            bar_chart(
                "Weekly Number of Transactions by Smart Contract",
                window,
                TRANSACTIONS_LABEL,
                series_by(rows, |row| Some(row.contract_address.as_str()), tx_count),
            ),
        ],
    }
}

fn moving_average_chart(rows: &[WeeklyEventActivity], window: TimeWindow) -> Chart {
    // Every row of a date carries the same group mean, one point per date is enough.
    let points = metrics::date_group_means(rows, ENTRY_SOLD_EVENT)
        .into_iter()
        .filter_map(|mean| mean.ma_eth_gas_fee.map(|y| (mean.tx_dt, y)))
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(x, y)| Point { x, y })
        .collect::<Vec<_>>();

    Chart {
        title: format!(
            "Moving Average ETH Gas Fee (only {ENTRY_SOLD_EVENT} event) ({})",
            window.label()
        ),
        kind: ChartKind::Scatter,
        x_label: WEEK_LABEL,
        y_label: ETH_LABEL,
        series: vec![Series { name: None, points }],
    }
}

fn gas_fees_view(rows: &[WeeklyEventActivity], window: TimeWindow) -> TabView {
    let totals = metrics::totals(rows);
    let fee = |row: &WeeklyEventActivity| row.weekly_eth_fee;

    TabView {
        tab: Tab::GasFees,
        time_window: window,
        time_window_label: window.label(),
        stats: vec![Stat {
            label: "Total ETH Gas Fees Generated",
            value: StatValue::Eth(totals.total_eth_gas_fee),
        }],
        charts: vec![
            bar_chart(
                "Weekly Volume of ETH Gas Fee",
                window,
                ETH_LABEL,
                series_by(rows, |_| None, fee),
            ),
            bar_chart(
                "Weekly Volume of ETH Gas Fee by Smart Contract",
                window,
                ETH_LABEL,
                series_by(rows, |row| Some(row.contract_address.as_str()), fee),
            ),
            moving_average_chart(rows, window),
        ],
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct ViewKey {
    today: NaiveDate,
    time_window: TimeWindow,
    tab: Tab,
}

pub struct Dashboard {
    dataset: Vec<WeeklyEventActivity>,
    views: RwLock<HashMap<ViewKey, Arc<TabView>>>,
}

impl Dashboard {
    pub fn new(dataset: Vec<WeeklyEventActivity>) -> Self {
        Self {
            dataset,
            views: RwLock::new(HashMap::new()),
        }
    }

    pub fn dataset(&self) -> &[WeeklyEventActivity] {
        &self.dataset
    }

    pub fn view(
        &self,
        tab: Tab,
        time_window: TimeWindow,
        today: NaiveDate,
    ) -> Result<Arc<TabView>, ViewError> {
        let key = ViewKey {
            today,
            time_window,
            tab,
        };

        if let Some(view) = self.views.read().unwrap().get(&key) {
            return Ok(view.clone());
        }

        let rows = time_windows::filter(&self.dataset, time_window, today);
        let view = Arc::new(match tab {
            Tab::Transactions => transactions_view(&rows, time_window),
            Tab::GasFees => gas_fees_view(&rows, time_window),
            Tab::Users | Tab::Tickets => return Err(ViewError::NotImplemented(tab)),
        });

        debug!(%tab, time_window = time_window.key(), %today, rows = rows.len(), "computed view");

        let mut views = self.views.write().unwrap();
        // Views for earlier days can't be asked for again.
        views.retain(|cached_key, _| cached_key.today == today);
        views.insert(key, view.clone());

        Ok(view)
    }

    pub fn cached_view_count(&self) -> usize {
        self.views.read().unwrap().len()
    }
}

impl HealthCheckable for Dashboard {
    fn health_status(&self) -> HealthStatus {
        if self.views.is_poisoned() {
            HealthStatus::Unhealthy(Some(
                "view cache lock poisoned by a panic while computing a view".to_string(),
            ))
        } else {
            HealthStatus::Healthy
        }
    }
}
