use clap::Parser;
use taskpixel::cli::commands::Cli;
use taskpixel::cli::handlers;
use taskpixel::io::config_io;
use tracing_subscriber::EnvFilter;

/// Env var overriding the configured log filter
const LOG_ENV: &str = "TASKPIXEL_LOG";

fn main() {
    let cli = Cli::parse();
    init_logging(cli.data_dir.as_deref());

    if let Err(e) = handlers::dispatch(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Logs go to stderr so `--json` output stays clean. The filter comes from
/// `TASKPIXEL_LOG`, else `[log] level` in the data directory's config.
fn init_logging(data_dir: Option<&str>) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        let level = config_io::read_config(&handlers::data_dir(data_dir))
            .map(|c| c.log.level)
            .unwrap_or_else(|_| "warn".to_string());
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
