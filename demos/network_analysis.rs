use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use netprobe::config::ProbeConfig;
use netprobe::connection::{Connection, ConnectionExt};
use netprobe::datagram::{DatagramConnection, DatagramListener};
use netprobe::measurement::{echo_test, packet_transfer_test, throughput_test};
use netprobe::server::{serve_datagram, serve_stream};
use netprobe::stream::StreamConnection;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

const KILOBYTE: usize = 1024;
const MEGABYTE: usize = 1024*1024;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// serve both transports on the configured port
    Server {
        /// number of sessions per transport before the server exits, forever if omitted
        #[clap(long)]
        sessions: Option<usize>,
    },
    /// run the measurement suites against a server, writing the results as CSV tables
    Client {
        host: String,
        results_file: String,

        #[clap(long, default_value_t = 100)]
        latency_cases: usize,

        #[clap(long, default_value_t = 50)]
        throughput_cases: usize,

        #[clap(long, default_value_t = 50)]
        packet_transfer_cases: usize,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = Arc::new(ProbeConfig::default());
    config.validate()?;

    match args.command {
        Command::Server { sessions } => run_server(config, sessions).await,
        Command::Client { host, results_file, latency_cases, throughput_cases, packet_transfer_cases } => {
            let cases = SuiteCases {
                latency: latency_cases,
                throughput: throughput_cases,
                packet_transfer: packet_transfer_cases,
            };
            run_client(config, &host, &results_file, cases).await
        }
    }
}

async fn run_server(config: Arc<ProbeConfig>, sessions: Option<usize>) -> anyhow::Result<()> {
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, config.port).into();

    let datagram_listener = DatagramListener::bind(config.clone(), addr).await?;
    let stream_listener = TcpListener::bind(addr).await?;
    info!("server running on port {}", config.port);

    tokio::try_join!(
        serve_datagram(config.clone(), datagram_listener, sessions),
        serve_stream(config.clone(), stream_listener, sessions),
    )?;
    Ok(())
}

struct SuiteCases {
    latency: usize,
    throughput: usize,
    packet_transfer: usize,
}

async fn run_client(config: Arc<ProbeConfig>, host: &str, results_file: &str, cases: SuiteCases) -> anyhow::Result<()> {
    let addr = tokio::net::lookup_host((host, config.port)).await?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", host))?;

    let mut out = BufWriter::new(File::create(results_file)?);
    let mut rng = StdRng::from_os_rng();

    writeln!(out, "NETWORK ANALYSIS TEST RESULTS")?;
    writeln!(out, "START TIMESTAMP: {}", timestamp())?;
    writeln!(out, "REMOTE HOST: {}", host)?;
    writeln!(out, "REMOTE ADDRESS: {}", addr.ip())?;
    writeln!(out, "PORT: {}", config.port)?;
    writeln!(out)?;

    let start = std::time::Instant::now();

    match DatagramConnection::connect(config.clone(), addr).await {
        Ok(mut conn) => {
            writeln!(out, "Running UDP Tests With Timeout Value: {:?}", config.next_packet_timeout)?;
            let result = run_common_suites(&mut conn, &config, "UDP", &cases, &mut rng, &mut out).await;
            report_failure(result, "UDP", &mut out)?;
            if let Err(e) = conn.disconnect().await {
                error!("error disconnecting UDP: {}", e);
            }
        }
        Err(e) => report_failure(Err(e), "UDP", &mut out)?,
    }

    match StreamConnection::connect(addr).await {
        Ok(mut conn) => {
            let mut result = run_common_suites(&mut conn, &config, "TCP", &cases, &mut rng, &mut out).await;
            if result.is_ok() {
                result = run_packet_transfer_suite(&mut conn, &config, cases.packet_transfer, &mut rng, &mut out).await;
            }
            report_failure(result, "TCP", &mut out)?;
            if let Err(e) = conn.disconnect().await {
                error!("error disconnecting TCP: {}", e);
            }
        }
        Err(e) => report_failure(Err(e), "TCP", &mut out)?,
    }

    writeln!(out)?;
    writeln!(out, "END TIMESTAMP: {}", timestamp())?;
    out.flush()?;

    info!("test finished in {:?}", start.elapsed());
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string()
}

fn report_failure(result: anyhow::Result<()>, protocol: &str, out: &mut impl Write) -> anyhow::Result<()> {
    if let Err(e) = result {
        error!("{} tests failed to complete: {}", protocol, e);
        writeln!(out, "An Error Occurred: {} Tests Failed to Complete", protocol)?;
    }
    Ok(())
}

async fn run_common_suites<C: Connection>(conn: &mut C, config: &ProbeConfig, protocol: &str, cases: &SuiteCases, rng: &mut StdRng, out: &mut impl Write) -> anyhow::Result<()> {
    run_latency_suite(conn, protocol, cases.latency, rng, out).await?;
    run_throughput_suite(conn, config, protocol, cases.throughput, rng, out).await
}

fn nanos(d: Duration) -> u128 {
    d.as_nanos()
}

async fn run_latency_suite<C: Connection>(conn: &mut C, protocol: &str, num_cases: usize, rng: &mut StdRng, out: &mut impl Write) -> anyhow::Result<()> {
    let sizes = [1, 32, KILOBYTE];
    info!("running {} round trip latency suite", protocol);

    writeln!(out, "{} Round Trip Latency Test", protocol)?;
    writeln!(out, "Test Case,{}", join(sizes.iter()))?;
    for i in 0..num_cases {
        let mut row = Vec::new();
        for size in sizes {
            row.push(nanos(echo_test(conn, size, rng).await?));
        }
        writeln!(out, "{},{}", i + 1, join(row.iter()))?;
    }
    writeln!(out)?;
    Ok(())
}

async fn run_throughput_suite<C: Connection>(conn: &mut C, config: &ProbeConfig, protocol: &str, num_cases: usize, rng: &mut StdRng, out: &mut impl Write) -> anyhow::Result<()> {
    let sizes = [KILOBYTE, 16*KILOBYTE, 64*KILOBYTE, 256*KILOBYTE, MEGABYTE];
    info!("running {} throughput suite", protocol);

    writeln!(out, "{} Throughput Test", protocol)?;
    writeln!(out, ",{}", join(sizes.iter().flat_map(|s| [s, s])))?;
    writeln!(out, "Test Case,{}", join(sizes.iter().map(|_| "Client to Server,Server to Client")))?;
    for i in 0..num_cases {
        let mut row = Vec::new();
        for size in sizes {
            let sample = throughput_test(conn, config, size, rng).await?;
            row.push(nanos(sample.client_to_server));
            row.push(nanos(sample.server_to_client));
        }
        writeln!(out, "{},{}", i + 1, join(row.iter()))?;
    }
    writeln!(out)?;
    Ok(())
}

async fn run_packet_transfer_suite(conn: &mut StreamConnection, config: &ProbeConfig, num_cases: usize, rng: &mut StdRng, out: &mut impl Write) -> anyhow::Result<()> {
    let chunk_sizes = [4*KILOBYTE, 2*KILOBYTE, KILOBYTE, 512];
    info!("running TCP packet transfer suite");

    writeln!(out, "TCP Packet Transfer Test ({} bytes)", MEGABYTE)?;
    writeln!(out, ",{}", join(chunk_sizes.iter()))?;
    for i in 0..num_cases {
        let mut row = Vec::new();
        for chunk_size in chunk_sizes {
            row.push(nanos(packet_transfer_test(conn, config, MEGABYTE, chunk_size, rng).await?));
        }
        writeln!(out, "{},{}", i + 1, join(row.iter()))?;
    }
    writeln!(out)?;
    Ok(())
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
