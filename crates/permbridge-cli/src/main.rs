//! permcheck: ask a WebAssembly guest whether a user holds a permission.
//!
//! Loads the guest module and the JSON lookup table, runs one `hasPerm`
//! query and prints `user <id> has <perm>` or `user <id> has not <perm>`.

mod config;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use clap::error::ErrorKind;
use color_eyre::eyre::{Result, WrapErr};
use permbridge_host::{
    Encoding, LookupTable, PermissionChecker, PermissionEvaluator, PermissionQuery,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{FileConfig, Settings};

/// Ask a WebAssembly policy module whether a user has a permission.
///
/// The module must export `memory`, `malloc` and `hasPerm`, and may import
/// `app.getData` to look keys up in the JSON database.
#[derive(Parser)]
#[command(name = "permcheck", version, about, long_about = None)]
struct Cli {
    /// Numeric user id.
    #[arg(allow_negative_numbers = true)]
    user_id: i32,

    /// Numeric meeting id.
    #[arg(allow_negative_numbers = true)]
    meeting_id: i32,

    /// Permission name handed to the guest (may start with `-`).
    #[arg(allow_hyphen_values = true)]
    perm: String,

    /// Further positionals are accepted and ignored.
    #[arg(hide = true)]
    extra: Vec<String>,

    /// Guest module (`.wasm`, or `.wat` text). Default: `module.wasm`.
    #[arg(long, value_name = "PATH")]
    module: Option<PathBuf>,

    /// JSON lookup table served to `getData`. Default: `db.json`.
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// String encoding shared with the guest: `latin1` or `utf8`.
    #[arg(long, value_name = "ENCODING")]
    encoding: Option<Encoding>,

    /// Config file (TOML). Default: `permcheck.toml`, then the user config dir.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the verdict as JSON.
    #[arg(long)]
    json: bool,

    /// Enable verbose logging (repeat for more detail: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON (for machine consumption).
    #[arg(long)]
    json_logs: bool,
}

/// Machine-readable verdict for `--json`.
#[derive(Serialize)]
struct Verdict<'a> {
    #[serde(flatten)]
    query: &'a PermissionQuery,
    granted: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            // Usage errors exit 1, not clap's default 2.
            let _ = err.print();
            process::exit(1);
        }
    };

    init_tracing(cli.verbose, cli.json_logs);
    if !cli.extra.is_empty() {
        debug!(ignored = ?cli.extra, "ignoring extra positional arguments");
    }

    let flags = FileConfig {
        module: cli.module,
        database: cli.database,
        encoding: cli.encoding,
    };
    let settings = Settings::resolve(cli.config.as_deref(), flags)?;
    info!(
        module = %settings.module.display(),
        database = %settings.database.display(),
        encoding = %settings.encoding,
        "resolved settings"
    );

    let table = LookupTable::from_file(&settings.database)
        .wrap_err("failed to load the lookup database")?;
    let checker = PermissionChecker::from_file(&settings.module, table, settings.encoding)
        .wrap_err("failed to load the guest module")?;

    let query = PermissionQuery::new(cli.user_id, cli.meeting_id, cli.perm);
    let granted = checker
        .evaluate(&query)
        .wrap_err("permission check failed")?;

    if cli.json {
        let verdict = Verdict {
            query: &query,
            granted,
        };
        println!("{}", serde_json::to_string(&verdict)?);
    } else {
        println!("{}", render_verdict(&query, granted));
    }

    Ok(())
}

fn init_tracing(verbose: u8, json_logs: bool) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn render_verdict(query: &PermissionQuery, granted: bool) -> String {
    let attr = if granted { "has" } else { "has not" };
    format!("user {} {attr} {}", query.user_id, query.permission)
}
