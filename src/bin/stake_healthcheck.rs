//! Probe Redis and PostgreSQL with the service configuration from the
//! environment; exits non-zero when either is unhealthy.

use std::process::ExitCode;

use stake_cache::StakeServiceBuilder;
use stake_cache::telemetry::init_tracing;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let service = match StakeServiceBuilder::from_env().skip_schema_init().build().await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Failed to build stake service");
            return ExitCode::FAILURE;
        }
    };

    let health = service.health_check().await;
    match serde_json::to_string(&health) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Failed to encode health report"),
    }

    if health.is_healthy() {
        info!("Stake service healthy");
        ExitCode::SUCCESS
    } else {
        error!(
            store_healthy = health.store_healthy,
            cache_healthy = health.cache_healthy,
            "Stake service unhealthy"
        );
        ExitCode::FAILURE
    }
}
