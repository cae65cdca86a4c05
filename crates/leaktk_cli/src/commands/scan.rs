//! The one-shot `scan` command.

use std::fs;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context as _, bail};
use clap::Args;
use leaktk_core::scanner::default_local;
use leaktk_core::{Config, Opts, Request, RequestKind, Scanner, id};

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Request ID; generated when omitted.
    #[arg(long)]
    id: Option<String>,

    /// Request kind (GitRepo, Files, ContainerImage, URL, JSONData, Text).
    #[arg(long, default_value = "GitRepo")]
    kind: String,

    /// Request options as a JSON object.
    #[arg(long, default_value = "{}")]
    options: String,

    /// Exit code to use when the scan finds results.
    #[arg(long, default_value_t = 1)]
    leak_exit_code: u8,

    /// The resource to scan. `@path` reads the resource from a file.
    resource: String,
}

pub fn run(config: &Config, args: ScanArgs) -> anyhow::Result<ExitCode> {
    let kind: RequestKind = args.kind.parse()?;

    let resource = resolve_resource(args.resource)?;

    let mut opts: Opts = if args.options.is_empty() {
        Opts::default()
    } else {
        serde_json::from_str(&args.options).context("could not parse options")?
    };

    // A GitRepo resource that exists on disk is scanned in place.
    if default_local(kind, &resource, &opts) {
        opts.local = true;
    }

    let request = Request {
        id: args.id.unwrap_or_else(id::random),
        kind,
        resource,
        opts,
    };

    let scanner = Scanner::new(config)?;
    scanner.send(request);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        scanner.recv(|response| {
            let _ = tx.send(response);
        });
    });

    let response = rx.recv().context("scanner stopped without a response")?;
    println!("{}", serde_json::to_string(&response)?);

    if let Some(err) = &response.error {
        bail!("response contains error: {err}");
    }

    if response.results.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(args.leak_exit_code))
    }
}

fn resolve_resource(resource: String) -> anyhow::Result<String> {
    let Some(path) = resource.strip_prefix('@') else {
        return Ok(resource);
    };

    fs::read_to_string(path).with_context(|| format!("could not read resource: path={path:?}"))
}
