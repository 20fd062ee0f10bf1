//! pget: parallel HTTP(S) file fetcher

mod pidfile;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pget_client::ClientOptions;
use pget_download::{
    BufferMode, ConsistentHashing, Consumer, DownloadOptions, FileWriter, Getter, Manifest,
    NullWriter, Strategy,
};
use pget_extract::{TarExtractor, ZipExtractor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "pget",
    about = "Fetch large files over HTTP(S) with parallel range requests",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// URL to download
    #[arg(required_unless_present = "command")]
    url: Option<String>,

    /// Destination path
    #[arg(required_unless_present = "command")]
    dest: Option<PathBuf>,

    /// Extract the stream as a tar archive into DEST
    #[arg(short = 'x', long, env = "PGET_EXTRACT", global = true)]
    extract: bool,

    /// Extract the stream as a zip archive into DEST
    #[arg(long, env = "PGET_UNZIP", global = true)]
    unzip: bool,

    #[command(flatten)]
    global: GlobalOpts,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download every entry of a manifest file
    Multifile {
        /// Manifest path (`URL DEST` per line), `-` for stdin
        manifest: String,

        /// Concurrent file cap (0 = unlimited)
        #[arg(long, env = "PGET_MAX_CONCURRENT_FILES")]
        max_concurrent_files: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Maximum simultaneous range requests
    #[arg(long, env = "PGET_CONCURRENCY", global = true)]
    concurrency: Option<usize>,

    /// Bytes per range request, with optional K/M/G suffix
    #[arg(long, env = "PGET_CHUNK_SIZE", value_parser = parse_size, global = true)]
    chunk_size: Option<u64>,

    /// Slice size for consistent hashing, with optional K/M/G suffix
    #[arg(long, env = "PGET_SLICE_SIZE", value_parser = parse_size, global = true)]
    slice_size: Option<u64>,

    /// Connection timeout in seconds
    #[arg(long, env = "PGET_CONNECT_TIMEOUT", global = true)]
    connect_timeout: Option<u64>,

    /// Overwrite existing destinations
    #[arg(short, long, env = "PGET_FORCE", global = true)]
    force: bool,

    /// Retries per request
    #[arg(long, env = "PGET_RETRIES", global = true)]
    retries: Option<u32>,

    /// Resolve override `host:port:ip`, repeatable
    #[arg(long = "resolve", env = "PGET_RESOLVE", value_delimiter = ',', global = true)]
    resolve: Vec<String>,

    /// What to do with the downloaded bytes
    #[arg(long, value_enum, env = "PGET_OUTPUT", default_value = "file", global = true)]
    output: OutputKind,

    /// Logging level
    #[arg(long, value_enum, env = "PGET_LOG_LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Shorthand for --log-level debug
    #[arg(short, long, env = "PGET_VERBOSE", global = true)]
    verbose: bool,

    /// Force HTTP/2 with prior knowledge
    #[arg(long, env = "PGET_FORCE_HTTP2", global = true)]
    force_http2: bool,

    /// Cap on pooled connections per host
    #[arg(long, env = "PGET_MAX_CONNS_PER_HOST", global = true)]
    max_conns_per_host: Option<usize>,

    /// Cache fleet nodes, comma-separated and position-significant;
    /// empty slots mark unavailable nodes
    #[arg(long, env = "PGET_CACHE_HOSTS", hide = true, global = true)]
    cache_hosts: Option<String>,

    /// URL prefixes eligible for the cache fleet, comma-separated
    #[arg(long, env = "PGET_CACHE_URI_PREFIXES", hide = true, global = true)]
    cache_uri_prefixes: Option<String>,

    /// Route cache requests as `http://cache/<origin-host>/<path>`
    #[arg(long, env = "PGET_CACHE_USE_PATH_PROXY", hide = true, global = true)]
    cache_use_path_proxy: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputKind {
    /// Write the raw bytes to DEST
    File,
    /// Extract DEST from a tar stream
    TarExtractor,
    /// Extract DEST from a zip archive
    ZipExtractor,
    /// Drain and verify, writing nothing
    Null,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.global);

    if let Err(err) = run(cli).await {
        eprintln!("pget: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(global: &GlobalOpts) {
    let default = if global.verbose {
        "debug"
    } else {
        global.log_level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let _lock = tokio::task::spawn_blocking(pidfile::acquire)
        .await
        .context("pid lock task failed")?
        .context("failed to acquire pid lockfile")?;

    let options = Arc::new(build_options(&cli)?);
    options.validate()?;

    let strategy: Arc<dyn Strategy> = if options.cache_hosts.len() >= 2 {
        Arc::new(ConsistentHashing::new(options.clone())?)
    } else {
        Arc::new(BufferMode::new(options.clone())?)
    };

    match cli.command {
        Some(Commands::Multifile { manifest, .. }) => {
            if cli.extract || cli.unzip {
                bail!("--extract/--unzip are not supported in multifile mode");
            }
            if cli.global.output != OutputKind::File && cli.global.output != OutputKind::Null {
                bail!("archive outputs are not supported in multifile mode");
            }
            let text = read_manifest(&manifest)?;
            let manifest = Manifest::parse(&text)?;
            if manifest.is_empty() {
                info!("manifest is empty, nothing to do");
                return Ok(());
            }
            let consumer = build_consumer(cli.global.output, cli.global.force);
            let getter = Getter::new(strategy, consumer, options);
            let summary = getter.download_files(&manifest).await?;
            info!(
                files = summary.files,
                bytes = summary.bytes,
                throughput_bps = summary.throughput() as u64,
                "done"
            );
        }
        None => {
            let url = cli.url.context("URL is required")?;
            let dest = cli.dest.context("destination is required")?;
            let kind = if cli.extract {
                OutputKind::TarExtractor
            } else if cli.unzip {
                OutputKind::ZipExtractor
            } else {
                cli.global.output
            };
            let consumer = build_consumer(kind, cli.global.force);
            let getter = Getter::new(strategy, consumer, options);
            let summary = getter
                .download_file(&url, &dest, CancellationToken::new())
                .await?;
            info!(
                bytes = summary.bytes,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "done"
            );
        }
    }
    Ok(())
}

fn read_manifest(path: &str) -> Result<String> {
    if path == "-" {
        use std::io::Read;
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading manifest from stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading manifest {path}"))
    }
}

fn build_consumer(kind: OutputKind, force: bool) -> Arc<dyn Consumer> {
    let mut consumer: Box<dyn Consumer> = match kind {
        OutputKind::File => Box::new(FileWriter::default()),
        OutputKind::TarExtractor => Box::new(TarExtractor::default()),
        OutputKind::ZipExtractor => Box::new(ZipExtractor::default()),
        OutputKind::Null => Box::new(NullWriter),
    };
    if force {
        consumer.enable_overwrite();
    }
    Arc::from(consumer)
}

fn build_options(cli: &Cli) -> Result<DownloadOptions> {
    let global = &cli.global;
    let mut options = DownloadOptions::default();

    if let Some(concurrency) = global.concurrency {
        options.max_concurrency = concurrency;
    }
    if let Some(chunk_size) = global.chunk_size {
        options.chunk_size = chunk_size;
    }
    if let Some(slice_size) = global.slice_size {
        options.slice_size = slice_size;
    }
    options.force = global.force;
    options.cache_use_path_proxy = global.cache_use_path_proxy;

    if let Some(raw) = &global.cache_hosts {
        // Positions are bucket indices; empty slots stay in the list so
        // hashing still sees the full fleet.
        options.cache_hosts = raw.split(',').map(str::trim).map(String::from).collect();
    }
    if let Some(raw) = &global.cache_uri_prefixes {
        options.cacheable_uri_prefixes = parse_cache_prefixes(raw)?;
    }
    if let Some(Commands::Multifile {
        max_concurrent_files: Some(max),
        ..
    }) = &cli.command
    {
        options.max_concurrent_files = *max;
    }

    let mut client = ClientOptions::default();
    if let Some(retries) = global.retries {
        client.max_retries = retries;
    }
    if let Some(secs) = global.connect_timeout {
        client.connect_timeout = Duration::from_secs(secs);
    }
    client.force_http2 = global.force_http2;
    if let Some(max) = global.max_conns_per_host {
        client.max_conns_per_host = max;
    }
    for entry in &global.resolve {
        let (host, addr) = ClientOptions::parse_resolve_override(entry)?;
        client.resolve_overrides.insert(host, addr);
    }
    if let Ok(auth) = std::env::var("PGET_AUTH_HEADER") {
        if !auth.is_empty() {
            client.auth_header = Some(auth);
        }
    }
    options.client = client;

    Ok(options)
}

/// Parse `https://host/path` prefixes into the host -> path-prefix map
/// the strategies consult
fn parse_cache_prefixes(raw: &str) -> Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for entry in raw.split([',', ' ']).filter(|s| !s.is_empty()) {
        let url =
            Url::parse(entry).with_context(|| format!("invalid cacheable prefix {entry:?}"))?;
        let host = url
            .host_str()
            .with_context(|| format!("cacheable prefix {entry:?} has no host"))?;
        let prefixes = map.entry(host.to_string()).or_default();
        if url.path() != "/" {
            prefixes.push(url.path().to_string());
        }
    }
    Ok(map)
}

/// Parse a byte size with an optional K/M/G suffix (binary multiples)
fn parse_size(raw: &str) -> std::result::Result<u64, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.char_indices().last() {
        Some((idx, 'K' | 'k')) => (&raw[..idx], 1024),
        Some((idx, 'M' | 'm')) => (&raw[..idx], 1024 * 1024),
        Some((idx, 'G' | 'g')) => (&raw[..idx], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {raw:?}"))?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn single_file_invocation_parses() {
        let cli = Cli::try_parse_from([
            "pget",
            "https://example.com/weights.bin",
            "weights.bin",
            "--concurrency",
            "16",
            "--chunk-size",
            "64M",
        ])
        .expect("parse");
        assert_eq!(cli.url.as_deref(), Some("https://example.com/weights.bin"));
        assert_eq!(cli.global.concurrency, Some(16));
        assert_eq!(cli.global.chunk_size, Some(64 * 1024 * 1024));
    }

    #[test]
    fn multifile_invocation_parses() {
        let cli = Cli::try_parse_from(["pget", "multifile", "-", "--max-concurrent-files", "5"])
            .expect("parse");
        match cli.command {
            Some(Commands::Multifile {
                manifest,
                max_concurrent_files,
            }) => {
                assert_eq!(manifest, "-");
                assert_eq!(max_concurrent_files, Some(5));
            }
            other => panic!("expected multifile, got {other:?}"),
        }
    }

    #[test]
    fn global_flags_apply_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "pget",
            "multifile",
            "manifest.txt",
            "--force",
            "--concurrency",
            "4",
        ])
        .expect("parse");
        assert!(cli.global.force);
        assert_eq!(cli.global.concurrency, Some(4));
        assert!(matches!(cli.command, Some(Commands::Multifile { .. })));
    }

    #[test]
    fn url_and_dest_are_required_without_subcommand() {
        assert!(Cli::try_parse_from(["pget"]).is_err());
        assert!(Cli::try_parse_from(["pget", "https://example.com/f"]).is_err());
    }

    #[test]
    fn size_suffixes_parse() {
        assert_eq!(parse_size("125").expect("plain"), 125);
        assert_eq!(parse_size("4K").expect("kibi"), 4096);
        assert_eq!(parse_size("125M").expect("mebi"), 125 * 1024 * 1024);
        assert_eq!(parse_size("2G").expect("gibi"), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn cache_prefixes_group_by_host() {
        let map = parse_cache_prefixes(
            "https://weights.example.com/models/,https://weights.example.com/datasets/,https://other.example.com",
        )
        .expect("parse");
        assert_eq!(
            map["weights.example.com"],
            vec!["/models/".to_string(), "/datasets/".to_string()]
        );
        assert!(map["other.example.com"].is_empty());
    }

    #[test]
    fn cache_hosts_preserve_empty_slots() {
        let cli = Cli::try_parse_from([
            "pget",
            "--cache-hosts",
            "cache-0.internal,,cache-2.internal",
            "https://example.com/f",
            "out",
        ])
        .expect("parse");
        let options = build_options(&cli).expect("options");
        assert_eq!(
            options.cache_hosts,
            vec![
                "cache-0.internal".to_string(),
                String::new(),
                "cache-2.internal".to_string()
            ]
        );
    }
}
