use anyhow::Context;
use metawin_analysis::{load_weekly_activity, log, start_server};

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    let config = log::init_from_env()?;

    let dataset = load_weekly_activity(&config)
        .await
        .context("failed to load metawin dataset")?;

    start_server(&config, dataset).await?;
    Ok(())
}
