// Fetches the telemetry of one vehicle once and prints it as a sensor table.
// Useful to check a pair of credentials before creating a config entry.

use std::env;
use std::process;

use abrp_telemetry_backend::abrp::{Credentials, IternioApiHandler};
use abrp_telemetry_backend::config::AbrpConfig;
use abrp_telemetry_backend::sensor::{self, SensorReading};
use chrono::Utc;

/// Probe the ABRP telemetry API.
///
/// The base URL defaults to the public API and can be overridden with
/// `ABRP_BASE_URL`. Set `RUST_LOG=debug` to see the requests being made.
///
/// # Usage
///
/// ```sh
/// cargo run --bin abrp-telemetry-probe <api key> <user token>
/// ```
fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <api key> <user token>", args[0]);
        process::exit(1);
    }

    let mut config = AbrpConfig::default();
    if let Ok(base_url) = env::var("ABRP_BASE_URL") {
        config.base_url = base_url;
    }
    let credentials = Credentials::new(args[1].clone(), args[2].clone());

    let runtime = match rocket::tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(probe(&config, credentials)) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn probe(config: &AbrpConfig, credentials: Credentials) -> anyhow::Result<()> {
    let api = IternioApiHandler::new(config)?;

    let vehicle = api.get_vehicle_name(&credentials.user_token).await?;
    log::info!("Token is valid for vehicle {}", vehicle);

    let snapshot = api.get_telemetry(&credentials).await?;
    let readings = sensor::readings("probe", Some(&snapshot));

    println!("{} ({} fields, fetched {})", vehicle, snapshot.len(), Utc::now().to_rfc3339());
    print_table(&readings);
    Ok(())
}

fn print_table(readings: &[SensorReading]) {
    let name_width = readings.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for reading in readings {
        let display = reading.display.as_deref().unwrap_or("unavailable");
        println!("{:<width$}  {}", reading.name, display, width = name_width);
    }
}
