//! This is the primary binary for the config-manager agent.

#![deny(rust_2018_idioms)]

#[macro_use]
extern crate log;

use nix::sys::stat::{umask, Mode};
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use snafu::ResultExt;
use std::env;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use config_manager::registry::{self, RegistryMap};
use config_manager::server;
use config_manager::settings::GlobalConfig;

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("{}", source))]
        Settings { source: config_manager::settings::Error },

        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        ReadConfigs { path: PathBuf, source: std::io::Error },

        #[snafu(display("{}", source))]
        Registry { source: config_manager::Error },

        #[snafu(display("{}", source))]
        Server { source: config_manager::Error },

        #[snafu(display("Cannot create directory '{}': {}", path.display(), source))]
        CreateDir { path: PathBuf, source: std::io::Error },

        #[snafu(display("Cannot open logfile '{}': {}", path.display(), source))]
        Logfile { path: PathBuf, source: std::io::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Cannot locate the binary's directory"))]
        BinaryDir,
    }
}

/// Stores user-supplied arguments.
struct Args {
    config_dir: Option<PathBuf>,
    listen: Option<String>,
    log_level: LevelFilter,
    color: ColorChoice,
}

/// Informs the user about proper usage of the program and exits.
fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    eprintln!(
        r"Usage: {}
            [ --config-dir PATH ]
            [ --listen HOST:PORT ]
            [ --no-color ]
            [ --log-level trace|debug|info|warn|error ]

    Config dir defaults to the binary's own directory; it must contain
    global.json and configs.json.",
        program_name
    );
    process::exit(2);
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

/// Parses user arguments into an Args structure.
fn parse_args(args: env::Args) -> Args {
    let mut config_dir = None;
    let mut listen = None;
    let mut log_level = None;
    let mut color = ColorChoice::Auto;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--config-dir" => {
                config_dir = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --config-dir")),
                ))
            }

            "--listen" => {
                listen = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --listen")),
                )
            }

            "--log-level" => {
                let log_level_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(LevelFilter::from_str(&log_level_str).unwrap_or_else(|_| {
                    usage_msg(format!("Invalid log level '{}'", log_level_str))
                }));
            }

            "--no-color" => color = ColorChoice::Never,

            _ => usage(),
        }
    }

    Args {
        config_dir,
        listen,
        log_level: log_level.unwrap_or(LevelFilter::Info),
        color,
    }
}

fn init_logger(args: &Args, global: &GlobalConfig) -> Result<()> {
    match &global.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(error::LogfileSnafu { path })?;
            WriteLogger::init(args.log_level, LogConfig::default(), file)
                .context(error::LoggerSnafu)
        }
        None => TermLogger::init(
            args.log_level,
            LogConfig::default(),
            TerminalMode::Mixed,
            args.color,
        )
        .context(error::LoggerSnafu),
    }
}

fn ensure_dir(path: &PathBuf) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
        .context(error::CreateDirSnafu { path })
}

async fn run() -> Result<()> {
    let args = parse_args(env::args());

    let config_dir = match &args.config_dir {
        Some(dir) => dir.clone(),
        None => env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
            .ok_or(error::Error::BinaryDir)?,
    };

    let mut global = GlobalConfig::load(&config_dir).context(error::SettingsSnafu)?;
    if let Some(ref listen) = args.listen {
        global.listen = listen.clone();
    }

    init_logger(&args, &global)?;

    // Everything this process creates stays group-readable at most.
    umask(Mode::from_bits_truncate(0o007));

    if global.ssl_enable {
        // Termination is a fronting proxy's job; the flag is accepted for config
        // compatibility.
        warn!("ssl_enable is set but TLS termination is delegated; serving plain HTTP");
    }

    if global.auto_create_backups {
        ensure_dir(&global.backup_dir)?;
        ensure_dir(&global.tmp_dir)?;
    }

    let configs_path = config_dir.join("configs.json");
    let initial: RegistryMap = if configs_path.exists() {
        let bytes = fs::read(&configs_path).context(error::ReadConfigsSnafu {
            path: &configs_path,
        })?;
        registry::load_from_bytes(&bytes).context(error::RegistrySnafu)?
    } else {
        warn!("{} not found, starting with an empty registry", configs_path.display());
        RegistryMap::new()
    };

    info!(
        "config-manager starting: listen={} entries={} path_guard={} roots={}",
        global.listen,
        initial.len(),
        global.path_guard.as_str(),
        global.allowed_roots.len(),
    );

    server::serve(global, initial, configs_path)
        .await
        .context(error::ServerSnafu)
}

// Returning a Result from main makes it print a Debug representation of the error, but with
// Snafu we have nice Display representations of the error, so we wrap "main" (run) and print
// any error.
#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
