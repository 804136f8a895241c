//! catpipe - small local chat over a named endpoint.
//!
//! The binary only parses CLI arguments, wires stdin/stdout to the library
//! and delegates to the `server` or `client` side of the session.

use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use clap::{Parser, Subcommand};

use catpipe::logging::{self, init_logging};
use catpipe::{
    Aggregator, CancellationScope, ClientConfig, ClientEndpoint, EndpointAddress, InboundMessage,
    IpcError, MessageQueue, PeerId, ServerConfig,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when CATPIPE_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Log format (text or json) used when CATPIPE_LOG_FORMAT is unset
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept peers and aggregate their messages.
    Server {
        /// Endpoint name or socket path
        #[arg(long, default_value = catpipe::DEFAULT_ADDRESS)]
        address: EndpointAddress,
        /// Print inbound messages as JSON lines
        #[arg(long)]
        json: bool,
        /// Number of recent lines pushed to each new peer
        #[arg(long, default_value_t = 20)]
        history: usize,
    },
    /// Connect to a running server.
    Client {
        /// Endpoint name or socket path
        #[arg(long, default_value = catpipe::DEFAULT_ADDRESS)]
        address: EndpointAddress,
        /// Peer id announced in the handshake (default: own pid)
        #[arg(long)]
        peer_id: Option<PeerId>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !logging::is_valid_format(&cli.log_format) {
        eprintln!("unknown log format {:?} (expected text or json)", cli.log_format);
        return ExitCode::from(2);
    }
    init_logging(&cli.log_level, &cli.log_format);

    let result = match cli.command {
        Commands::Server {
            address,
            json,
            history,
        } => run_server(address, json, history),
        Commands::Client { address, peer_id } => run_client(address, peer_id),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

type History = Arc<Mutex<VecDeque<String>>>;

fn remember(history: &History, limit: usize, line: String) {
    if limit == 0 {
        return;
    }
    let mut lines = history.lock().unwrap_or_else(PoisonError::into_inner);
    if lines.len() == limit {
        lines.pop_front();
    }
    lines.push_back(line);
}

fn print_message(msg: &InboundMessage, json: bool) {
    if json {
        match serde_json::to_string(msg) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode message"),
        }
    } else {
        let time = chrono::Local::now().format("%H:%M");
        println!("[{time}] {}: {}", msg.peer_id, msg.text);
    }
}

fn run_server(address: EndpointAddress, json: bool, history_len: usize) -> Result<(), IpcError> {
    let history: History = Arc::new(Mutex::new(VecDeque::with_capacity(history_len)));
    let snapshot = history.clone();
    let mut aggregator = Aggregator::builder(ServerConfig::new(address))
        .on_connect(move |conn| {
            let lines: Vec<String> = snapshot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect();
            for line in lines {
                if let Err(e) = conn.send(&line) {
                    tracing::warn!(peer_id = conn.peer_id(), error = %e, "snapshot push failed");
                    break;
                }
            }
        })
        .build();
    aggregator.start()?;
    println!("Server running on {}", aggregator.address());
    let aggregator = Arc::new(aggregator);

    let printer = {
        let aggregator = aggregator.clone();
        let history = history.clone();
        thread::spawn(move || loop {
            match aggregator.read_message() {
                Ok(msg) => {
                    print_message(&msg, json);
                    remember(&history, history_len, format!("{}: {}", msg.peer_id, msg.text));
                }
                Err(IpcError::QueueClosed) => break,
                Err(e) => {
                    tracing::error!(error = %e, "read failed");
                    break;
                }
            }
        })
    };

    for line in io::stdin().lock().lines() {
        let line = line?;
        let delivered = aggregator.write(&line);
        tracing::debug!(delivered, "line broadcast");
        remember(&history, history_len, format!("server: {line}"));
    }

    aggregator.dispose();
    let _ = printer.join();
    println!("catpipe closed, server shut down.");
    Ok(())
}

fn run_client(address: EndpointAddress, peer_id: Option<PeerId>) -> Result<(), IpcError> {
    let peer_id = peer_id.unwrap_or_else(|| PeerId::from(std::process::id()));
    let config = ClientConfig::new(address, peer_id);
    let endpoint = ClientEndpoint::new(config, CancellationScope::new());
    let session = endpoint.connect()?;
    println!("Connected as peer {}", session.peer_id());

    let outbound = Arc::new(MessageQueue::<String>::new());
    {
        let outbound = outbound.clone();
        // stays blocked on stdin after the server leaves; exits with the process
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if outbound.push(line).is_err() {
                    return;
                }
            }
            // writer drains what is left, then closes the connection
            outbound.complete();
        });
    }

    session.run(&outbound, |line| println!("{line}"))?;
    println!("catpipe session ended");
    Ok(())
}
