//! Omnara wrapper CLI: `omnara claude` behaves like `claude`, with the
//! terminal mirrored through the relay so remote viewers can watch and type.

use clap::Parser;
use common::config::WrapperConfig;

#[derive(Parser, Debug)]
#[command(
    name = "omnara",
    about = "Run a CLI agent under a PTY and mirror its terminal through the Omnara relay"
)]
struct Cli {
    /// Agent CLI to launch (e.g. `claude`, `amp`).
    agent: String,

    /// Arguments passed through to the agent untouched.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    agent_args: Vec<String>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let config = WrapperConfig::from_env();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("omnara: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match rt.block_on(wrapper::session::run_agent(&cli.agent, &cli.agent_args, config)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("omnara: {err:#}");
            std::process::exit(1);
        }
    }
}

/// The wrapper shares its tty with the child, so logs go to a file under
/// `~/.omnara/logs`; stderr is only a fallback when that fails.
fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let log_file = dirs::home_dir()
        .map(|home| home.join(".omnara").join("logs"))
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("wrapper.log"))
                .ok()
        });

    match log_file {
        Some(file) => env_logger::Builder::from_env(env)
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init(),
        None => env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("warn"),
        )
        .init(),
    }
}
