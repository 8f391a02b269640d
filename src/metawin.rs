//! The MetaWin raffle query and the weekly rows it produces.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    env::EnvConfig,
    flipside::{FlipsideHttp, Record},
    json_codecs::{date_from_timestamp_string, to_date_string},
    pagination::PaginationOptions,
    snapshot::{self, snapshot_exists, SnapshotRow},
};

pub const ENTRY_SOLD_EVENT: &str = "EntrySold";

/// Address that deploys MetaWin raffle contracts and grants them their roles.
const METAWIN_DEPLOYER: &str = "0x3684a8007dc9df696a86b0c5c89a8032b78b5b0d";

/// Role hashes granted to every raffle contract by the deployer.
const RAFFLE_ROLES: [&str; 2] = [
    "0x523a704056dcd17bcf83bed8b68c59416dac1119be77755efe3bde0a64e46e0c",
    "0xde5ee446972f4e39ab62c03aa34b2096680a875c3fdb3eb2f947cbb93341c058",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetawinQuery {
    pub starting_date: NaiveDate,
}

impl MetawinQuery {
    pub fn new(starting_date: NaiveDate) -> Self {
        Self { starting_date }
    }

    pub fn sql(&self) -> String {
        let starting_date = self.starting_date.format("%Y-%m-%d");
        let roles = RAFFLE_ROLES
            .iter()
            .map(|role| format!("'{role}'"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "
            WITH metawin_contracts AS (
              SELECT DISTINCT contract_address
              FROM ethereum.core.fact_decoded_event_logs
              WHERE decoded_log:\"role\" IN ({roles})
                AND decoded_log:\"sender\" = '{METAWIN_DEPLOYER}'
                AND block_timestamp > '{starting_date}'
            ),
            metawin_txs AS (
              SELECT tx_hash, block_timestamp, contract_address, event_name
              FROM ethereum.core.fact_decoded_event_logs
              WHERE contract_address IN (SELECT contract_address FROM metawin_contracts)
                AND block_timestamp > '{starting_date}'
            ),
            weekly AS (
              SELECT
                date_trunc('week', v1.block_timestamp) AS tx_dt,
                v1.contract_address,
                v1.event_name,
                COUNT(DISTINCT v1.tx_hash) AS tot_txs_count,
                SUM(v2.tx_fee) AS weekly_eth_fee
              FROM metawin_txs v1
              JOIN ethereum.core.fact_transactions v2 ON v1.tx_hash = v2.tx_hash
              WHERE v2.block_timestamp > '{starting_date}'
              GROUP BY 1, 2, 3
            )
            SELECT
              tx_dt,
              contract_address,
              event_name,
              tot_txs_count,
              weekly_eth_fee,
              weekly_eth_fee / NULLIF(tot_txs_count, 0)
                AS avg_gas_eth_gas_fee_paid_by_smart_contract,
              AVG(weekly_eth_fee / NULLIF(tot_txs_count, 0)) OVER (ORDER BY tx_dt)
                AS rolling_avg_gas_eth_gas_fee
            FROM weekly
            ORDER BY tx_dt
            "
        )
    }
}

/// Transactions and fees for one event of one raffle contract in one week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyEventActivity {
    #[serde(
        deserialize_with = "date_from_timestamp_string",
        serialize_with = "to_date_string"
    )]
    pub tx_dt: NaiveDate,
    pub contract_address: String,
    pub event_name: String,
    pub tot_txs_count: i64,
    pub weekly_eth_fee: f64,
    pub avg_gas_eth_gas_fee_paid_by_smart_contract: Option<f64>,
    pub rolling_avg_gas_eth_gas_fee: Option<f64>,
}

impl SnapshotRow for WeeklyEventActivity {
    const COLUMNS: &'static [&'static str] = &[
        "tx_dt",
        "contract_address",
        "event_name",
        "tot_txs_count",
        "weekly_eth_fee",
        "avg_gas_eth_gas_fee_paid_by_smart_contract",
        "rolling_avg_gas_eth_gas_fee",
    ];
}

pub fn decode_records<Row>(records: Vec<Record>) -> serde_json::Result<Vec<Row>>
where
    Row: for<'a> Deserialize<'a>,
{
    records
        .into_iter()
        .map(|record| serde_json::from_value(Value::Object(record)))
        .collect()
}

/// Weekly activity from the cache file, or from Flipside when there is no cache file yet. The
/// API key is only required in the latter case.
pub async fn load_weekly_activity(config: &EnvConfig) -> anyhow::Result<Vec<WeeklyEventActivity>> {
    if snapshot_exists(&config.cache_path)? {
        let rows = snapshot::read_snapshot(&config.cache_path)?;
        debug!(path = %config.cache_path.display(), rows = rows.len(), "read cache file");
        return Ok(rows);
    }

    let client = FlipsideHttp::new_with_url(config.flipside_api_key()?, &config.flipside_api_url)
        .with_timeout_minutes(config.query_timeout_minutes);
    let options = PaginationOptions::new(config.page_size);
    let sql = MetawinQuery::new(config.starting_date).sql();

    snapshot::load_dataset(&client, &config.cache_path, &sql, &options).await
}
