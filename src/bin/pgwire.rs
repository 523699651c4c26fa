//! pgwire: PostgreSQL wire protocol toolbox
//!
//! Decode values and frames by hand, replay a SCRAM exchange, or ask a
//! server through the socket pool whether it speaks TLS.
//!
//! # Usage
//!
//! ```bash
//! # Decode a binary numeric
//! pgwire numeric 0002000000000004000104d2
//!
//! # Stream-parse backend frames
//! pgwire frames 5a0000000549
//!
//! # Open 4 jittered sockets and ask each for TLS
//! pgwire tls-check localhost 5432 --count 4 --format json
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use pgwire_core::config::WireConfig;
use pgwire_core::driver::{
    ConnectOptions, Pool, SocketContext, SocketErrorClass, SocketHandlers, SocketId,
    SocketPoolManager, TcpSocketFactory, TelemetrySnapshot, TransportOptions, Verdict,
};
use pgwire_core::protocol::auth::SCRAM_SHA_256;
use pgwire_core::protocol::{BackendMessage, FrontendMessage, MessageParser, SaslSession};
use pgwire_core::types::{
    ArrayEntry, NumericValue, TypeError, decode_bytea_text, encode_bytea_hex, parse_array,
    parse_interval, parse_text_array, parse_text_range, parse_timestamp,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgwire")]
#[command(version)]
#[command(about = "PostgreSQL wire protocol toolbox", long_about = None)]
#[command(after_help = "EXAMPLES:
    pgwire numeric 0002000000000004000104d2
    pgwire array '{1,{2,NULL}}' --int
    pgwire timestamp '2023-01-01 00:00:00Z'
    pgwire interval '1 year 2 mons 03:04:05.5'
    pgwire range '[1,10)'
    pgwire scram --nonce rOprNGfwEbeRWgbNEkqO --password pencil --server-first 'r=...,s=...,i=4096'")]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Config file (defaults to <config dir>/pgwire/config.toml)
    #[arg(short, long, env = "PGWIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a binary numeric given as hex
    Numeric { hex: String },
    /// Parse a text array literal
    Array {
        literal: String,
        /// Parse elements as integers
        #[arg(long)]
        int: bool,
    },
    /// Parse a text timestamp
    Timestamp { text: String },
    /// Decode a text bytea value (hex or escape form)
    Bytea { text: String },
    /// Parse a text interval and show it in every output style
    Interval { text: String },
    /// Parse a text range literal
    Range { literal: String },
    /// Stream-parse backend frames given as hex
    Frames {
        hex: String,
        /// Feed the parser this many bytes at a time
        #[arg(long, default_value_t = 0)]
        chunk: usize,
    },
    /// Compute the SCRAM-SHA-256 client-final-message
    Scram {
        #[arg(long)]
        nonce: String,
        #[arg(long, env = "PGPASSWORD")]
        password: String,
        #[arg(long)]
        server_first: String,
    },
    /// Open sockets through the pool and send SSLRequest on each
    TlsCheck {
        host: String,
        port: u16,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 10_000)]
        deadline_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = WireConfig::load(cli.config.as_deref())?;
    let format = cli.format;

    match &cli.command {
        Commands::Numeric { hex } => numeric(hex, format),
        Commands::Array { literal, int } => array(literal, *int, format),
        Commands::Timestamp { text } => timestamp(text, format),
        Commands::Bytea { text } => bytea(text, format),
        Commands::Interval { text } => interval(text, format),
        Commands::Range { literal } => range(literal, format),
        Commands::Frames { hex, chunk } => frames(hex, *chunk, &config, format),
        Commands::Scram {
            nonce,
            password,
            server_first,
        } => scram(nonce, password, server_first, format),
        Commands::TlsCheck {
            host,
            port,
            count,
            deadline_ms,
        } => tls_check(host, *port, *count, Duration::from_millis(*deadline_ms), &config, format).await,
        Commands::Config => show_config(&config, format),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn numeric(hex: &str, format: OutputFormat) -> Result<()> {
    let bytes = decode_hex(hex)?;
    let value = NumericValue::decode_binary(&bytes)?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "text": value.to_string(),
            "sign": format!("{:?}", value.sign()),
            "weight": value.weight(),
            "dscale": value.dscale(),
            "digits": value.digits(),
        })),
        OutputFormat::Table => {
            println!("{}", value.to_string().green().bold());
            println!("  {} {:?}", "sign:  ".dimmed(), value.sign());
            println!("  {} {}", "weight:".dimmed(), value.weight());
            println!("  {} {}", "dscale:".dimmed(), value.dscale());
            println!("  {} {:?}", "digits:".dimmed(), value.digits());
            Ok(())
        }
    }
}

fn array(literal: &str, int: bool, format: OutputFormat) -> Result<()> {
    if int {
        let entries = parse_array(literal, |leaf| {
            leaf.parse::<i64>()
                .map_err(|_| TypeError::InvalidData(format!("not an integer: {leaf:?}")))
        })?;
        render_array(&entries, format)
    } else {
        render_array(&parse_text_array(literal)?, format)
    }
}

fn render_array<T: Serialize + std::fmt::Debug>(
    entries: &[ArrayEntry<T>],
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Table => {
            print_entries(entries, 0);
            Ok(())
        }
    }
}

fn print_entries<T: std::fmt::Debug>(entries: &[ArrayEntry<T>], depth: usize) {
    let indent = "  ".repeat(depth);
    for (i, entry) in entries.iter().enumerate() {
        match entry {
            ArrayEntry::Null => println!("{indent}[{i}] {}", "NULL".dimmed()),
            ArrayEntry::Value(v) => println!("{indent}[{i}] {}", format!("{v:?}").yellow()),
            ArrayEntry::Nested(inner) => {
                println!("{indent}[{i}] {}", "{".cyan());
                print_entries(inner, depth + 1);
                println!("{indent}    {}", "}".cyan());
            }
        }
    }
}

fn timestamp(text: &str, format: OutputFormat) -> Result<()> {
    let Some(ts) = parse_timestamp(text) else {
        bail!("not a timestamp: {text:?}");
    };
    match format {
        OutputFormat::Json => print_json(&ts),
        OutputFormat::Table => {
            println!("{}", ts.to_string().green().bold());
            println!("  {} {}", "micros since 2000-01-01:".dimmed(), ts.to_pg_micros());
            Ok(())
        }
    }
}

fn bytea(text: &str, format: OutputFormat) -> Result<()> {
    let bytes = decode_bytea_text(text.as_bytes())?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "length": bytes.len(),
            "hex": encode_bytea_hex(&bytes),
            "utf8": std::str::from_utf8(&bytes).ok(),
        })),
        OutputFormat::Table => {
            println!("{} bytes", bytes.len().to_string().bold());
            println!("  {}", encode_bytea_hex(&bytes).yellow());
            if let Ok(s) = std::str::from_utf8(&bytes) {
                println!("  {:?}", s);
            }
            Ok(())
        }
    }
}

fn interval(text: &str, format: OutputFormat) -> Result<()> {
    let iv = parse_interval(text)?;
    let styles = [
        ("postgres", iv.to_postgres()),
        ("iso_8601", iv.to_iso_string()),
        ("iso_8601_short", iv.to_iso_string_short()),
    ];
    match format {
        OutputFormat::Json => print_json(&styles.into_iter().collect::<BTreeMap<_, _>>()),
        OutputFormat::Table => {
            for (style, rendered) in styles {
                println!("{:<15} {}", style.dimmed(), rendered.green());
            }
            Ok(())
        }
    }
}

fn range(literal: &str, format: OutputFormat) -> Result<()> {
    let range = parse_text_range(literal)?;
    match format {
        OutputFormat::Json => print_json(&range),
        OutputFormat::Table => {
            println!("{}", range.to_string().green().bold());
            if !range.is_empty() {
                println!("  {} {:?}", "lower:".dimmed(), range.lower());
                println!("  {} {:?}", "upper:".dimmed(), range.upper());
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct FrameRow {
    tag: String,
    length: usize,
    message: String,
}

fn frames(hex: &str, chunk: usize, config: &WireConfig, format: OutputFormat) -> Result<()> {
    let bytes = decode_hex(hex)?;
    let mut parser = MessageParser::with_max_message_size(config.parser.max_message_size);
    let chunk = if chunk == 0 { bytes.len().max(1) } else { chunk };

    let mut rows = Vec::new();
    for piece in bytes.chunks(chunk) {
        for raw in parser.parse(piece)? {
            let message = match BackendMessage::decode(&raw) {
                Ok(m) => format!("{m:?}"),
                Err(e) => format!("undecodable: {e}"),
            };
            rows.push(FrameRow {
                tag: (raw.tag as char).to_string(),
                length: raw.body.len() + 4,
                message,
            });
        }
    }
    let tail = parser.finish();

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Table => {
            for row in &rows {
                println!("{} {:>6}  {}", row.tag.cyan().bold(), row.length, row.message);
            }
            println!("{} frame(s)", rows.len().to_string().bold());
        }
    }
    tail.context("input is not a clean frame sequence")?;
    Ok(())
}

fn scram(nonce: &str, password: &str, server_first: &str, format: OutputFormat) -> Result<()> {
    let mut session = SaslSession::with_nonce(&[SCRAM_SHA_256], nonce)?;
    let client_first = session.client_first_message()?;
    let client_final = session.continue_session(password, server_first.as_bytes())?;
    let signature = session
        .expected_server_signature()
        .context("no server signature after client-final")?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "client_first": client_first,
            "client_final": client_final,
            "server_final": format!("v={signature}"),
        })),
        OutputFormat::Table => {
            println!("{} {}", "client-first:".dimmed(), client_first);
            println!("{} {}", "client-final:".dimmed(), client_final.green());
            println!("{} v={}", "expect:      ".dimmed(), signature.yellow());
            Ok(())
        }
    }
}

type Answers = Arc<Mutex<BTreeMap<SocketId, String>>>;

/// Sends SSLRequest once connected and records the one-byte answer.
struct SslRequestHandler {
    request: Bytes,
    answers: Answers,
}

impl SslRequestHandler {
    fn record(&self, socket: SocketId, answer: String) {
        if let Ok(mut answers) = self.answers.lock() {
            answers.entry(socket).or_insert(answer);
        }
    }
}

impl SocketHandlers for SslRequestHandler {
    fn on_connect(&mut self, ctx: &mut SocketContext<'_>) -> Verdict {
        ctx.send(self.request.clone());
        Verdict::Promote
    }

    fn on_data(&mut self, ctx: &mut SocketContext<'_>, data: &[u8]) -> Verdict {
        let answer = match data.first() {
            Some(b'S') => "S (TLS available)".to_string(),
            Some(b'N') => "N (no TLS)".to_string(),
            Some(b'E') => "E (error response)".to_string(),
            Some(other) => format!("unexpected byte 0x{other:02x}"),
            None => "empty".to_string(),
        };
        self.record(ctx.socket(), answer);
        Verdict::Close
    }

    fn on_error(&mut self, ctx: &mut SocketContext<'_>, error: &SocketErrorClass) -> Verdict {
        self.record(ctx.socket(), format!("error: {error:?}"));
        Verdict::Close
    }

    fn on_close(&mut self, ctx: &mut SocketContext<'_>, _had_error: bool) {
        self.record(ctx.socket(), "closed without answer".to_string());
    }
}

#[derive(Serialize)]
struct TlsCheckReport {
    answers: BTreeMap<String, String>,
    telemetry: TelemetrySnapshot,
}

async fn tls_check(
    host: &str,
    port: u16,
    count: usize,
    deadline: Duration,
    config: &WireConfig,
    format: OutputFormat,
) -> Result<()> {
    let factory = TcpSocketFactory::new(TransportOptions::new(ConnectOptions::tcp(host, port)));
    let mut manager = SocketPoolManager::builder()
        .factory(Arc::new(factory))
        .config(config.manager_config())
        .build()?;

    let request = FrontendMessage::SslRequest.to_bytes()?;
    let answers: Answers = Arc::default();
    for _ in 0..count {
        manager.create_socket_for_pool(
            Pool::Visiting,
            SslRequestHandler {
                request: request.clone(),
                answers: answers.clone(),
            },
        )?;
    }

    let deadline = tokio::time::Instant::now() + deadline;
    while !manager.is_empty() {
        match tokio::time::timeout_at(deadline, manager.run_once()).await {
            Ok(Some(report)) => {
                if let Some(fault) = report.fault {
                    tracing::error!(%fault, "pool bookkeeping fault");
                }
            }
            Ok(None) => break,
            Err(_) => {
                eprintln!(
                    "{} {} socket(s) still open at deadline",
                    "Warning:".yellow().bold(),
                    manager.len()
                );
                break;
            }
        }
    }

    let answers = answers
        .lock()
        .map(|a| a.iter().map(|(id, v)| (id.to_string(), v.clone())).collect())
        .unwrap_or_default();
    let report = TlsCheckReport {
        answers,
        telemetry: manager.telemetry(),
    };

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            for (id, answer) in &report.answers {
                println!("{} {}", id.cyan(), answer);
            }
            let events = report.telemetry.events;
            println!();
            println!(
                "{} error={} idle={} end={} close={}",
                "events:".dimmed(),
                events.error,
                events.idle,
                events.end,
                events.close
            );
            println!(
                "{} read={} written={}",
                "bytes: ".dimmed(),
                report.telemetry.bytes_read,
                report.telemetry.bytes_written
            );
            for (activity, histogram) in &report.telemetry.activities {
                println!(
                    "{} {:<10} {} sample(s) {:?}",
                    "activity:".dimmed(),
                    activity.as_str(),
                    histogram.samples,
                    histogram.buckets
                );
            }
            Ok(())
        }
    }
}

fn show_config(config: &WireConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(config),
        OutputFormat::Table => {
            if let Some(path) = WireConfig::default_path() {
                println!("{} {}", "# default path:".dimmed(), path.display());
            }
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Accepts plain hex, optionally prefixed with `0x` or `\x`, whitespace ignored.
fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = compact
        .strip_prefix("0x")
        .or_else(|| compact.strip_prefix("\\x"))
        .unwrap_or(&compact);
    if !digits.is_ascii() {
        bail!("hex input must be ASCII");
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex at offset {i}"))
        })
        .collect()
}
