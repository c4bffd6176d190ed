//! The reservation daemon: dispatcher, engine, wire protocol, server.

pub mod core;
mod dispatch;
mod dumper;
pub mod notify;
mod ops;
pub mod probe;
pub mod server;
pub mod state;
pub mod wire;

pub use self::core::{Daemon, local_time_string, now_epoch};
pub use dispatch::{DispatchOutcome, dispatch};
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use ops::OpError;
pub use probe::{ProbeOp, ProbeOutcome, Prober, TimeServiceProber, run_probe_loop};
pub use server::{RequestMessage, Server, run_daemon};
pub use state::StateError;
pub use wire::{ConnState, Params, RawRequest, Response, ResponseKind, WireError, encode_response};
