#[macro_use]
extern crate tracing;

mod cache;
mod metrics;
mod playlist;
mod pp;
mod ranking;
mod ratelimiter;
mod scoresaber_api;
mod server;
mod settings;
mod store;

use foundations::{cli::Cli, telemetry, BootstrapResult};

use crate::settings::ServerSettings;

#[tokio::main]
async fn main() -> BootstrapResult<()> {
  let service_info = foundations::service_info!();
  let cli = Cli::<ServerSettings>::new(&service_info, vec![])?;

  let telemetry_server_fut =
    telemetry::init_with_server(&service_info, &cli.settings.telemetry, vec![])?;
  if let Some(telemetry_server_addr) = telemetry_server_fut.server_addr() {
    info!("Telemetry server is listening on http://{}", telemetry_server_addr);
  }
  tokio::spawn(telemetry_server_fut);

  server::start_server(&cli.settings).await
}
