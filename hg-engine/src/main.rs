//! hg-init - bring an RPC transport engine up and print its address
//!
//! Initializes the engine on the requested transport, starts the progress
//! loop, prints the self address and shuts everything down again.

use anyhow::Result;
use hg_engine::{init_tracing, InitOptions, OutputSink, RunConfig};
use std::time::Duration;
use tracing::error;

fn print_help() {
    println!("hg-init - RPC transport engine bootstrap v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  hg-init [OPTIONS] SPEC");
    println!();
    println!("  SPEC is a transport spec such as 'sock+tcp', 'na+sm' or 'mock+loopback'");
    println!();
    println!("OPTIONS:");
    println!("  -a               Enable auto_sm mode");
    println!("  -n               Init with listen=false (default: listen)");
    println!("  -s SUBNET        Preferred IP subnet (default: none)");
    println!("  -c FILE          Read init options from a JSON file");
    println!("  -q MS            Progress timeout in milliseconds (default: 100)");
    println!("  -h, --help       Print this help message");
    println!("  -V, --version    Print version information");
}

fn usage_error(msg: &str) -> ! {
    eprintln!("error: {msg}");
    eprintln!("Run 'hg-init --help' for usage information.");
    std::process::exit(1);
}

fn parse_args(args: &[String]) -> Result<Option<RunConfig>> {
    let mut auto_sm = false;
    let mut listen = true;
    let mut subnet = None;
    let mut options_file = None;
    let mut timeout = None;
    let mut spec = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("hg-init {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-a" => auto_sm = true,
            "-n" => listen = false,
            "-s" => match iter.next() {
                Some(value) => subnet = Some(value.clone()),
                None => usage_error("-s needs a subnet"),
            },
            "-c" => match iter.next() {
                Some(value) => options_file = Some(value.clone()),
                None => usage_error("-c needs a file"),
            },
            "-q" => match iter.next().map(|v| v.parse::<u64>()) {
                Some(Ok(ms)) => timeout = Some(Duration::from_millis(ms)),
                _ => usage_error("-q needs a number of milliseconds"),
            },
            flag if flag.starts_with('-') => {
                usage_error(&format!("unrecognized argument '{flag}'"))
            }
            value if spec.is_none() => spec = Some(value.to_string()),
            extra => usage_error(&format!("unexpected argument '{extra}'")),
        }
    }

    let Some(spec) = spec else {
        usage_error("missing transport spec");
    };

    let mut options = match options_file {
        Some(path) => InitOptions::from_json_file(path)?,
        None => InitOptions::default(),
    };
    if auto_sm {
        options.auto_sm = true;
    }
    if let Some(subnet) = subnet {
        options.na.ip_subnet = Some(subnet);
    }

    let mut config = RunConfig::new(spec);
    config.listen = listen;
    config.options = options;
    if let Some(timeout) = timeout {
        config.progress_timeout = timeout;
    }
    Ok(Some(config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    init_tracing();

    let config = match parse_args(&args) {
        Ok(Some(config)) => config,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let sink = OutputSink::stdout();
    if let Err(e) = hg_engine::run(&config, &sink).await {
        sink.line(format_args!("{e}"));
        error!(kind = ?e.kind(), "{}", e);
        std::process::exit(1);
    }
    Ok(())
}
