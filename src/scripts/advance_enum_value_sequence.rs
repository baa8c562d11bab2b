use anyhow::{Context, Result};
use eav_db_rust::config::AppConfig;
use eav_db_rust::store::PostgresStore;

/// Push the enum value id sequence past fixture rows so that new literals never
/// collide with pre-seeded ids.
///
/// Usage: advance-enum-value-sequence [FLOOR]
/// FLOOR defaults to `eav.enum_value_sequence_floor`.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    let floor = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<i64>()
            .with_context(|| format!("FLOOR must be an integer, got '{}'", arg))?,
        None => config.eav.enum_value_sequence_floor,
    };

    // Connect to database
    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, 1).await?;
    println!("Connected to database. Advancing eav_enumvalue id sequence to at least {}...", floor);

    let last = store
        .advance_enum_value_sequence(floor)
        .await
        .context("advancing the enum value sequence")?;
    println!("Done: next enum value id will be {}", last + 1);

    Ok(())
}
