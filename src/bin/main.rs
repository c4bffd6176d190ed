use std::path::PathBuf;

use clap::Parser;

use rsvpd::config::Config;
use rsvpd::daemon::{LogNotifier, TimeServiceProber, run_daemon};
use rsvpd::telemetry;

#[derive(Parser, Debug)]
#[command(name = "rsvpd", version, about = "host reservation daemon")]
struct Args {
    /// Path of the durable state snapshot.
    #[arg(long, default_value = "hosts.state")]
    statefile: PathBuf,

    /// TCP port to listen on.
    #[arg(long, default_value_t = rsvpd::config::DEFAULT_PORT)]
    port: u16,

    /// Seconds between liveness passes.
    #[arg(long, default_value_t = rsvpd::config::DEFAULT_PING_DELAY)]
    pingdelay: u64,

    /// Seconds of probe silence before an idle host is marked dead.
    #[arg(long, default_value_t = rsvpd::config::DEFAULT_DEAD_TIME)]
    deadtime: u64,

    /// Seconds between repeat notifications for one expired reservation.
    #[arg(long, default_value_t = rsvpd::config::DEFAULT_NOTIFY_INTERVAL)]
    notify_interval: u64,

    /// Notify owners of expired reservations.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    notify_expired: bool,

    /// tracing filter directive (RSVPD_LOG overrides).
    #[arg(long)]
    log: Option<String>,
}

fn main() {
    let args = Args::parse();
    telemetry::init(args.log.as_deref());

    let config = Config {
        port: args.port,
        state_file: args.statefile,
        ping_delay: args.pingdelay,
        dead_time: args.deadtime,
        notify_expired: args.notify_expired,
        notify_interval: args.notify_interval,
        log_filter: args.log,
    };

    if let Err(e) = run_daemon(config, Box::new(LogNotifier), Box::new(TimeServiceProber::new())) {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}
