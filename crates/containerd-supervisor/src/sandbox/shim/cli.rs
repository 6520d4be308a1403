use std::io::Write as _;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use log::LevelFilter;

use super::process::run;

/// Launches a container process through an OCI runtime and waits for it to exit.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Id of the container the process belongs to
    pub id: String,
    /// Bundle directory of the container
    pub bundle: PathBuf,
    /// Runtime binary used to launch the process
    pub runtime: String,
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,
}

/// Entry point of the shim binary. Logs go to stderr as JSON lines, which the supervisor
/// redirects to `shim-log.json`.
pub fn shim_main() {
    let args = Args::parse();
    init_logger(args.log_level);

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            log::error!("failed to start the runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = rt.block_on(run(args)) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn init_logger(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            let line = serde_json::json!({
                "level": record.level().as_str().to_lowercase(),
                "msg": record.args().to_string(),
                "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            });
            writeln!(buf, "{line}")
        })
        .init();
}
