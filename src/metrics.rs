//! Values derived from already filtered weekly rows. Everything here is a pure function and an
//! empty input gives an empty or zero result.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::Serialize;

use crate::{json_codecs::to_date_string, metawin::WeeklyEventActivity};

/// Weekly fee divided by weekly transaction count. Undefined, so `None`, for weeks without
/// transactions.
pub fn average_fee_per_transaction(row: &WeeklyEventActivity) -> Option<f64> {
    if row.tot_txs_count == 0 {
        None
    } else {
        Some(row.weekly_eth_fee / row.tot_txs_count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasFeeGroupMean {
    #[serde(serialize_with = "to_date_string")]
    pub tx_dt: NaiveDate,
    pub contract_address: String,
    pub event_name: String,
    pub weekly_avg_eth_gas_fee_paid_by_smart_contract: Option<f64>,
    /// Charted as the "moving average". It is the mean over rows sharing `tx_dt`, not a
    /// sliding window.
    pub ma_eth_gas_fee: Option<f64>,
}

/// Keeps rows of `event_name`, computes each row's average fee per transaction, and attaches to
/// every row the mean of those averages across rows with the same date. Rows without an
/// average don't count towards the mean.
pub fn date_group_means(rows: &[WeeklyEventActivity], event_name: &str) -> Vec<GasFeeGroupMean> {
    let event_rows: Vec<(&WeeklyEventActivity, Option<f64>)> = rows
        .iter()
        .filter(|row| row.event_name == event_name)
        .map(|row| (row, average_fee_per_transaction(row)))
        .collect();

    let mut sums: HashMap<NaiveDate, (f64, u32)> = HashMap::new();
    for (row, average) in &event_rows {
        let entry = sums.entry(row.tx_dt).or_insert((0.0, 0));
        if let Some(average) = average {
            entry.0 += average;
            entry.1 += 1;
        }
    }

    event_rows
        .into_iter()
        .map(|(row, average)| {
            let ma_eth_gas_fee = sums
                .get(&row.tx_dt)
                .and_then(|(sum, count)| (*count > 0).then(|| sum / f64::from(*count)));

            GasFeeGroupMean {
                tx_dt: row.tx_dt,
                contract_address: row.contract_address.clone(),
                event_name: row.event_name.clone(),
                weekly_avg_eth_gas_fee_paid_by_smart_contract: average,
                ma_eth_gas_fee,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_transaction_count: i64,
    pub total_eth_gas_fee: f64,
}

pub fn totals(rows: &[WeeklyEventActivity]) -> Totals {
    rows.iter().fold(Totals::default(), |acc, row| Totals {
        total_transaction_count: acc.total_transaction_count + row.tot_txs_count,
        total_eth_gas_fee: acc.total_eth_gas_fee + row.weekly_eth_fee,
    })
}

pub fn transactions_by_event(rows: &[WeeklyEventActivity]) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for row in rows {
        *counts.entry(row.event_name.clone()).or_insert(0) += row.tot_txs_count;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(day: u32, contract: &str, event: &str, count: i64, fee: f64) -> WeeklyEventActivity {
        WeeklyEventActivity {
            tx_dt: NaiveDate::from_ymd_opt(2023, 1, day).unwrap(),
            contract_address: contract.to_string(),
            event_name: event.to_string(),
            tot_txs_count: count,
            weekly_eth_fee: fee,
            avg_gas_eth_gas_fee_paid_by_smart_contract: None,
            rolling_avg_gas_eth_gas_fee: None,
        }
    }

    #[test]
    fn average_fee_per_transaction_test() {
        let week = row(2, "0xa", "EntrySold", 20, 100.0);
        assert_eq!(average_fee_per_transaction(&week), Some(5.0));
    }

    #[test]
    fn average_fee_without_transactions_is_none_test() {
        let week = row(2, "0xa", "EntrySold", 0, 1.5);
        assert_eq!(average_fee_per_transaction(&week), None);
    }

    #[test]
    fn date_group_means_test() {
        let rows = vec![
            row(2, "0xa", "EntrySold", 10, 1.0),
            row(2, "0xb", "EntrySold", 10, 3.0),
            row(2, "0xa", "RaffleCreated", 1, 50.0),
            row(9, "0xa", "EntrySold", 4, 2.0),
        ];

        let means = date_group_means(&rows, "EntrySold");

        assert_eq!(means.len(), 3);
        assert_eq!(means[0].weekly_avg_eth_gas_fee_paid_by_smart_contract, Some(0.1));
        assert_eq!(means[1].weekly_avg_eth_gas_fee_paid_by_smart_contract, Some(0.3));
        assert!((means[0].ma_eth_gas_fee.unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(means[0].ma_eth_gas_fee, means[1].ma_eth_gas_fee);
        assert_eq!(means[2].ma_eth_gas_fee, Some(0.5));
    }

    #[test]
    fn date_group_means_skip_undefined_averages_test() {
        let rows = vec![
            row(2, "0xa", "EntrySold", 0, 0.0),
            row(2, "0xb", "EntrySold", 2, 1.0),
            row(9, "0xa", "EntrySold", 0, 0.0),
        ];

        let means = date_group_means(&rows, "EntrySold");

        assert_eq!(means[0].weekly_avg_eth_gas_fee_paid_by_smart_contract, None);
        assert_eq!(means[0].ma_eth_gas_fee, Some(0.5));
        assert_eq!(means[1].ma_eth_gas_fee, Some(0.5));
        assert_eq!(means[2].ma_eth_gas_fee, None);
    }

    #[test]
    fn date_group_means_unknown_event_is_empty_test() {
        let rows = vec![row(2, "0xa", "EntrySold", 10, 1.0)];
        assert!(date_group_means(&rows, "NoSuchEvent").is_empty());
        assert!(date_group_means(&[], "EntrySold").is_empty());
    }

    #[test]
    fn totals_test() {
        let rows = vec![
            row(2, "0xa", "EntrySold", 10, 1.5),
            row(9, "0xb", "RaffleCreated", 3, 0.25),
        ];

        assert_eq!(
            totals(&rows),
            Totals {
                total_transaction_count: 13,
                total_eth_gas_fee: 1.75
            }
        );
        assert_eq!(totals(&[]), Totals::default());
    }

    #[test]
    fn transactions_by_event_test() {
        let rows = vec![
            row(2, "0xa", "EntrySold", 10, 1.5),
            row(9, "0xb", "EntrySold", 5, 0.5),
            row(9, "0xb", "RaffleCreated", 3, 0.25),
        ];

        let counts = transactions_by_event(&rows);

        assert_eq!(counts.get("EntrySold"), Some(&15));
        assert_eq!(counts.get("RaffleCreated"), Some(&3));
    }
}
