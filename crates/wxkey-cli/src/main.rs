//! Command-line front-end: pick a target process, build the validator and
//! print whatever keys the extractor recovers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wxkey::{
    extract, locate_processes, CancelToken, ClientVersion, KeyPair, Platform, ProcessInfo,
    Validator, V3_IMAGE_NAME, V4_IMAGE_NAME,
};

#[derive(Parser)]
#[command(
    name = "wxkey",
    about = "Recover WeChat database and image keys from a running client",
    version
)]
struct Cli {
    /// PID of the WeChat process; discovered by image name when omitted
    #[arg(long)]
    pid: Option<u32>,

    /// WeChat data directory holding the encrypted databases
    /// (e.g. C:\Users\<name>\Documents\xwechat_files\<account>)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Client generation to scan (3 or 4)
    #[arg(long, default_value_t = 4)]
    client_version: u8,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let version = match cli.client_version {
        3 => ClientVersion::V3,
        4 => ClientVersion::V4,
        other => bail!("unsupported client version {other}; expected 3 or 4"),
    };

    let validator = Validator::new(Platform::Windows, version, &cli.data_dir).with_context(|| {
        format!(
            "cannot read the reference database under {}; pass the account's data directory via --data-dir",
            cli.data_dir.display()
        )
    })?;

    let candidates = match cli.pid {
        Some(pid) => vec![ProcessInfo::from_pid(pid)],
        None => {
            let found = locate_processes(&[V3_IMAGE_NAME, V4_IMAGE_NAME]);
            if found.is_empty() {
                bail!("WeChat is not running; start the client or pass --pid");
            }
            found
        }
    };

    let cancel = CancelToken::new();
    if let Some(secs) = cli.timeout {
        let token = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            token.cancel();
        });
    }

    let mut last_err = None;
    for process in &candidates {
        info!(pid = process.pid, "scanning process");
        match extract(&cancel, process, &validator) {
            Ok(keys) => {
                report(&keys);
                return Ok(());
            }
            Err(err) => {
                warn!(pid = process.pid, %err, "extraction failed");
                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(err) => Err(err.into()),
        None => bail!("no candidate process was scanned"),
    }
}

fn report(keys: &KeyPair) {
    if let Some(data) = &keys.data {
        println!("DataKey: {data}");
    }
    if let Some(image) = &keys.image {
        println!("ImageKey: {image}");
    }
}
