//! Standalone Omnara relay server binary. Configuration comes from the
//! environment; `--host` and `--port` override it for local runs.

use common::config::RelayConfig;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RelayConfig::from_env();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--host" && i + 1 < args.len() {
            config.ws_host = args[i + 1].clone();
            i += 2;
            continue;
        }
        if args[i] == "--port" && i + 1 < args.len() {
            config.ws_port = args[i + 1].parse().unwrap_or(config.ws_port);
            i += 2;
            continue;
        }
        i += 1;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(relay::run_relay_server(config))
}
