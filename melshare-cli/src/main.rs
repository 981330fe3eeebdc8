//! MelShare CLI - inspect and drive named maps and UDP links from a shell
//!
//!   - write/read/size/unlink: named shared memory maps
//!   - send/recv: point-to-point datagram link

use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use melshare::{
    DatagramLink, LinkConfig, MapConfig, NamedMap, NetError, OpenMode, Payload, PayloadKind,
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "melshare")]
#[command(about = "Read and write MelShare named maps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write values to a named map, creating it if needed
    Write {
        /// Map name
        name: String,

        /// How the values are encoded
        #[arg(short, long, value_enum, default_value = "doubles")]
        kind: KindArg,

        /// Map capacity in bytes, used only when the map is created
        #[arg(short, long, default_value = "256")]
        capacity: usize,

        /// Lock timeout in milliseconds
        #[arg(long, default_value = "50")]
        timeout_ms: u64,

        /// Keep the map open until Enter is pressed; without another holder
        /// the map is removed as soon as this command exits
        #[arg(long)]
        hold: bool,

        /// Values to write (text is joined with spaces)
        values: Vec<String>,
    },

    /// Read the current payload of an existing map
    Read {
        /// Map name
        name: String,

        /// How the payload is interpreted
        #[arg(short, long, value_enum, default_value = "doubles")]
        kind: KindArg,

        /// Lock timeout in milliseconds
        #[arg(long, default_value = "50")]
        timeout_ms: u64,
    },

    /// Print the payload size in bytes of an existing map
    Size {
        /// Map name
        name: String,
    },

    /// Remove a map's OS objects left behind by crashed holders
    Unlink {
        /// Map name
        name: String,
    },

    /// Send doubles or text to a UDP peer
    Send {
        /// Local port to bind
        #[arg(long, default_value = "0")]
        local_port: u16,

        /// Remote address, e.g. 127.0.0.1:55001
        remote: SocketAddr,

        #[arg(short, long, value_enum, default_value = "doubles")]
        kind: KindArg,

        values: Vec<String>,
    },

    /// Receive one datagram from a UDP peer
    Recv {
        /// Local port to bind
        local_port: u16,

        /// Remote address sends would go to
        #[arg(long, default_value = "127.0.0.1:0")]
        remote: SocketAddr,

        #[arg(short, long, value_enum, default_value = "doubles")]
        kind: KindArg,

        /// Receive timeout in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum KindArg {
    Bytes,
    Ints,
    Floats,
    Doubles,
    Text,
}

impl From<KindArg> for PayloadKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Bytes => PayloadKind::Bytes,
            KindArg::Ints => PayloadKind::Ints,
            KindArg::Floats => PayloadKind::Floats,
            KindArg::Doubles => PayloadKind::Doubles,
            KindArg::Text => PayloadKind::Text,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("melshare=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{} {}", style("error:").red().bold(), message);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), String> {
    match command {
        Commands::Write { name, kind, capacity, timeout_ms, hold, values } => {
            let payload = parse_payload(kind.into(), &values)?;
            let config = MapConfig {
                capacity,
                lock_timeout: Duration::from_millis(timeout_ms),
                mode: OpenMode::OpenOrCreate,
            };
            let map = NamedMap::try_open(&name, config).map_err(|e| e.to_string())?;
            map.write(&payload).map_err(|e| e.to_string())?;
            println!(
                "{} wrote {} {} to '{}'",
                style("✓").green(),
                payload.len(),
                payload.kind(),
                name
            );
            if hold {
                println!("   holding '{}', press Enter to release", name);
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map_err(|e| e.to_string())?;
            }
            Ok(())
        }
        Commands::Read { name, kind, timeout_ms } => {
            let map = open_existing(&name, timeout_ms)?;
            let payload = map.read(kind.into()).map_err(|e| e.to_string())?;
            println!("{}", format_payload(&payload));
            Ok(())
        }
        Commands::Size { name } => {
            let map = open_existing(&name, 50)?;
            println!("{}", map.size().map_err(|e| e.to_string())?);
            Ok(())
        }
        Commands::Unlink { name } => {
            let removed = NamedMap::unlink(&name).map_err(|e| e.to_string())?;
            if removed {
                println!("{} removed '{}'", style("✓").green(), name);
            } else {
                println!("'{}' does not exist", name);
            }
            Ok(())
        }
        Commands::Send { local_port, remote, kind, values } => {
            let link = DatagramLink::bind(&LinkConfig::new(local_port, remote))
                .map_err(|e| e.to_string())?;
            let sent = match kind {
                KindArg::Text => link.send_text(&values.join(" ")),
                KindArg::Doubles => link.send_doubles(&parse_values::<f64>(&values)?),
                other => return Err(format!("UDP links carry doubles or text, not {:?}", other)),
            };
            sent.map_err(|e| e.to_string())?;
            println!("{} sent to {}", style("✓").green(), remote);
            Ok(())
        }
        Commands::Recv { local_port, remote, kind, timeout_ms } => {
            let mut config = LinkConfig::new(local_port, remote);
            config.recv_timeout = Duration::from_millis(timeout_ms);
            let mut link = DatagramLink::bind(&config).map_err(|e| e.to_string())?;
            let received = match kind {
                KindArg::Text => link.recv_text().map(Payload::Text),
                KindArg::Doubles => link.recv_doubles().map(Payload::Doubles),
                other => return Err(format!("UDP links carry doubles or text, not {:?}", other)),
            };
            match received {
                Ok(payload) => {
                    println!("{}", format_payload(&payload));
                    Ok(())
                }
                Err(NetError::Timeout) => Err(format!("nothing received within {} ms", timeout_ms)),
                Err(e) => Err(e.to_string()),
            }
        }
    }
}

fn open_existing(name: &str, timeout_ms: u64) -> Result<NamedMap, String> {
    let config = MapConfig {
        lock_timeout: Duration::from_millis(timeout_ms),
        mode: OpenMode::OpenOnly,
        ..MapConfig::default()
    };
    NamedMap::try_open(name, config).map_err(|e| e.to_string())
}

fn parse_values<T: std::str::FromStr>(values: &[String]) -> Result<Vec<T>, String> {
    values
        .iter()
        .map(|v| v.parse::<T>().map_err(|_| format!("cannot parse '{}'", v)))
        .collect()
}

fn parse_payload(kind: PayloadKind, values: &[String]) -> Result<Payload, String> {
    Ok(match kind {
        PayloadKind::Bytes => Payload::Bytes(parse_values(values)?),
        PayloadKind::Ints => Payload::Ints(parse_values(values)?),
        PayloadKind::Floats => Payload::Floats(parse_values(values)?),
        PayloadKind::Doubles => Payload::Doubles(parse_values(values)?),
        PayloadKind::Text => Payload::Text(values.join(" ")),
    })
}

fn format_payload(payload: &Payload) -> String {
    match payload {
        Payload::Bytes(v) => format!("{:?}", v),
        Payload::Ints(v) => format!("{:?}", v),
        Payload::Floats(v) => format!("{:?}", v),
        Payload::Doubles(v) => format!("{:?}", v),
        Payload::Text(s) => s.clone(),
    }
}
