use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng, rngs::StdRng};
use shm_keyset::repl::{Commands, USAGE, format_rejection, format_response};
use shm_keyset::{
    ChannelError, ConcurrentSet, Latencies, Operation, SEGMENT_NAME, ServerConfig, connect,
    mono_time_ns, resolve_bucket_count, serve,
};
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[command(name = "shm-keyset", about = "Key set served over POSIX shared memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the segment and serve requests until SIGINT/SIGTERM.
    Server {
        /// Number of hash buckets; absent or non-positive uses the default (32).
        #[arg(allow_negative_numbers = true)]
        buckets: Option<i64>,

        /// Shared memory segment name.
        #[arg(long, default_value = SEGMENT_NAME)]
        name: String,
    },
    /// Read `OP KEY` commands from stdin and print each response.
    Client {
        /// Shared memory segment name.
        #[arg(long, default_value = SEGMENT_NAME)]
        name: String,
    },
    /// Check the set against a reference under random inserts and removes.
    Stress {
        #[arg(long, default_value_t = 1)]
        threads: u32,

        #[arg(long, default_value_t = 1_000_000)]
        iterations: u64,

        /// Keys are drawn from 0..=max_value (per thread).
        #[arg(long, default_value_t = 16)]
        max_value: u32,

        #[arg(long, default_value_t = 4)]
        buckets: usize,
    },
    /// Measure request round-trip latency against a running server.
    Bench {
        #[arg(long, default_value = SEGMENT_NAME)]
        name: String,

        #[arg(long, default_value_t = 100_000)]
        requests: usize,
    },
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn install_stop_handler() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = request_stop as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Server { buckets, name } => run_server(buckets, name),
        Command::Client { name } => run_client(&name),
        Command::Stress {
            threads,
            iterations,
            max_value,
            buckets,
        } => run_stress(threads, iterations, max_value, buckets),
        Command::Bench { name, requests } => run_bench(&name, requests),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

type AnyResult = Result<(), Box<dyn std::error::Error>>;

fn run_server(buckets: Option<i64>, name: String) -> AnyResult {
    let bucket_count = resolve_bucket_count(buckets);
    if buckets.is_none_or(|n| n <= 0) {
        tracing::info!("using default bucket count {}", bucket_count);
    }

    let config = ServerConfig {
        segment_name: name,
        bucket_count,
        ..ServerConfig::default()
    };

    install_stop_handler()?;
    // dropping the server unlinks the segment, on error too
    let mut server = serve(&config)?;
    server.run_until(&STOP, config.poll_interval)?;
    Ok(())
}

fn run_client(name: &str) -> AnyResult {
    let client = connect(name)?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", USAGE)?;

    for command in Commands::new(io::stdin().lock()) {
        let command = command?;
        let (operation, key) = match command.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                writeln!(stdout, "{}", format_rejection(&err))?;
                continue;
            }
        };

        match client.request(operation, key) {
            Ok(result) => writeln!(stdout, "{}", format_response(&command.key, result))?,
            Err(ChannelError::Request(err)) => writeln!(stdout, "{}", format_rejection(&err))?,
            // overrun or a failed primitive: the ring can no longer be trusted
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn run_stress(threads: u32, iterations: u64, max_value: u32, buckets: usize) -> AnyResult {
    if buckets == 0 {
        return Err("bucket count must be positive".into());
    }
    let set = ConcurrentSet::new(buckets);
    tracing::info!(threads, iterations, max_value, buckets, "stress start");

    let failures: Vec<String> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let set = &set;
                s.spawn(move || stress_worker(set, t, iterations, max_value))
            })
            .collect();
        workers
            .into_iter()
            .filter_map(|w| match w.join() {
                Ok(outcome) => outcome.err(),
                Err(_) => Some("stress worker panicked".to_owned()),
            })
            .collect()
    });

    if let Some(first) = failures.into_iter().next() {
        return Err(first.into());
    }
    tracing::info!(len = set.len(), "stress finished");
    Ok(())
}

/// Random inserts and removes over a key range of its own, checking every key
/// of the range against a reference set after each operation.
fn stress_worker(
    set: &ConcurrentSet<u64>,
    thread: u32,
    iterations: u64,
    max_value: u32,
) -> Result<(), String> {
    let width = max_value as u64 + 1;
    let base = thread as u64 * width;
    let mut rng = StdRng::from_entropy();
    let mut reference = BTreeSet::new();

    for i in 0..iterations {
        let value = base + rng.gen_range(0..width);
        if rng.gen_bool(0.5) {
            set.remove(&value);
            reference.remove(&value);
        } else {
            set.insert(value);
            reference.insert(value);
        }

        for k in base..base + width {
            if set.contains(&k) != reference.contains(&k) {
                return Err(format!(
                    "thread {}: membership of {} diverged after {} operations",
                    thread,
                    k,
                    i + 1
                ));
            }
        }
    }
    Ok(())
}

fn run_bench(name: &str, requests: usize) -> AnyResult {
    let client = connect(name)?;
    let key = format!("bench-{}", std::process::id());
    let mut latencies = Latencies::with_capacity(requests);

    client.insert(key.as_bytes())?;
    for _ in 0..requests {
        let t0 = mono_time_ns();
        client.request(Operation::Query, key.as_bytes())?;
        latencies.record(mono_time_ns() - t0);
    }
    client.remove(key.as_bytes())?;

    match latencies.summary() {
        Some(summary) => println!("{}", summary),
        None => println!("no requests issued"),
    }
    Ok(())
}
