//! List Wayland toplevels and mirror them as X11 placeholder windows.

mod output;

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use toplevelev::{Mode, ProtocolChoice, Tracker, TrackerOptions};

#[derive(Parser, Debug)]
#[command(name = "lswx", version, about = "List Wayland toplevels, mirrored into X11")]
struct Cli {
    /// Output the list as JSON.
    #[arg(short = 'j', long = "json", conflicts_with = "custom")]
    json: bool,

    /// Output the listed fields, comma separated, one line per toplevel.
    #[arg(short = 'c', long = "custom", value_name = "FIELDS")]
    custom: Option<String>,

    /// Keep running and report toplevel events as they happen.
    #[arg(short = 'w', long = "watch", conflicts_with = "verbose_watch")]
    watch: bool,

    /// Like --watch, with per-flag state change lines.
    #[arg(short = 'W', long = "verbose-watch")]
    verbose_watch: bool,

    /// Require a specific listing protocol instead of auto-selecting.
    #[arg(long = "force-protocol", value_name = "PROTOCOL")]
    force_protocol: Option<ForcedProtocol>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ForcedProtocol {
    /// zwlr_foreign_toplevel_manager_v1
    Wlr,
    /// ext_foreign_toplevel_list_v1
    Ext,
}

fn run(cli: Cli) -> Result<bool> {
    let mode = if cli.verbose_watch {
        Mode::VerboseWatch
    } else if cli.watch {
        Mode::Watch
    } else {
        Mode::List
    };
    if !matches!(mode, Mode::List) && (cli.json || cli.custom.is_some()) {
        bail!("Alternative output formats are not supported in watch mode");
    }
    let custom = cli
        .custom
        .as_deref()
        .map(output::CustomFormat::parse)
        .transpose()?;

    let options = TrackerOptions {
        mode,
        protocol: match cli.force_protocol {
            None => ProtocolChoice::Auto,
            Some(ForcedProtocol::Wlr) => ProtocolChoice::Zwlr,
            Some(ForcedProtocol::Ext) => ProtocolChoice::Ext,
        },
    };

    let tracker = Tracker::build(options).context("startup failed")?;
    let stop = tracker.stop_handle();
    ctrlc::set_handler(move || stop.stop()).context("failed to install signal handler")?;

    let outcome = tracker.run()?;

    if matches!(mode, Mode::List) {
        // An interrupted snapshot is an incomplete snapshot.
        if outcome.interrupted {
            bail!("interrupted before the toplevel snapshot completed");
        }
        let rendered = if cli.json {
            output::json(&outcome.records)
        } else if let Some(format) = &custom {
            format.render(&outcome.records, outcome.capabilities)
        } else {
            output::normal(&outcome.records)
        };
        print!("{rendered}");
    }
    Ok(outcome.interrupted)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run(Cli::parse()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}
