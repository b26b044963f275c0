//! A plain echo server exercising the public surface end to end (§8 "Echo
//! server" scenario): listen, accept, echo back whatever a client sends,
//! log the hangup when it disconnects.
//!
//! Built the way the teacher's `main.rs` is built: `clap` for CLI
//! arguments, `tracing-subscriber` to make the output legible. Neither
//! crate is a dependency of the library itself — only of this demo binary.

use clap::Parser;
use loopwire::{ConnId, ListenOptions, Loop, LoopOptions};
use std::collections::VecDeque;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(about = "Minimal TCP echo server built on loopwire", long_about = None)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut loop_ = Loop::new(LoopOptions::default())?;

    loop_.listen(
        ListenOptions::tcp(args.port),
        Some(Box::new(|lp: &mut Loop, id: ConnId| {
            info!(?id, "client connected");

            let pending: VecDeque<Vec<u8>> = VecDeque::new();
            let pending = std::rc::Rc::new(std::cell::RefCell::new(pending));

            let read_pending = pending.clone();
            lp.read_cb(
                id,
                Box::new(move |lp: &mut Loop, id: ConnId, data: &[u8]| {
                    read_pending.borrow_mut().push_back(data.to_vec());
                    lp.writing(id);
                }),
            );

            let write_pending = pending;
            lp.write_cb(
                id,
                Box::new(move |_lp, _id| write_pending.borrow_mut().pop_front()),
            );

            lp.hup_cb(
                id,
                Box::new(|_lp, id| {
                    info!(?id, "client disconnected");
                }),
            );
        })),
    )?;

    info!(port = args.port, "echo server listening");
    loop_.start()?;
    Ok(())
}
