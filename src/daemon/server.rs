//! The connection server.
//!
//! Three kinds of thread: an acceptor, one handler per client connection,
//! and the state thread that owns the `Daemon`. The state thread is THE
//! serialization point — all mutations and background passes run there, so
//! the model needs no locks. The probe worker only reports results back.

use std::io::Read;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};

use super::core::{Daemon, now_epoch};
use super::dispatch::dispatch;
use super::notify::Notifier;
use super::probe::{ProbeOp, ProbeOutcome, Prober, run_probe_loop};
use super::state;
use super::wire::{ConnState, RawRequest, Response, WireError, encode_response};
use crate::config::Config;
use crate::core::Registry;

/// Bound on how long a response write may stall before the connection is
/// dropped.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Cadence of the expiry-notification scan.
const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Message from a connection handler to the state thread.
pub struct RequestMessage {
    pub request: RawRequest,
    pub respond: Sender<Response>,
}

enum StateMsg {
    Request(RequestMessage),
    Shutdown,
}

/// A running daemon: listener, state thread, probe worker.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    req_tx: Sender<StateMsg>,
    accept_handle: JoinHandle<()>,
    state_handle: JoinHandle<()>,
    probe_handle: JoinHandle<()>,
}

impl Server {
    /// Load state, bind the port, and spawn the worker threads.
    pub fn start(
        config: Config,
        notifier: Box<dyn Notifier>,
        prober: Box<dyn Prober>,
    ) -> crate::Result<Self> {
        let registry = state::load(&config.state_file)?.unwrap_or_else(Registry::default);
        let state_path = config.state_file.clone();
        let daemon = Daemon::with_registry(registry, config.clone(), notifier);
        // Initialization may have created the default classes; the snapshot
        // must reflect them before the first request.
        state::save(&state_path, daemon.registry())?;

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (req_tx, req_rx) = crossbeam::channel::unbounded::<StateMsg>();
        let (probe_tx, probe_rx) = crossbeam::channel::unbounded::<ProbeOp>();
        let (probe_result_tx, probe_result_rx) = crossbeam::channel::unbounded::<ProbeOutcome>();

        let state_handle = std::thread::spawn(move || {
            run_state_loop(daemon, state_path, req_rx, probe_tx, probe_result_rx);
        });
        let probe_handle = std::thread::spawn(move || {
            run_probe_loop(prober, probe_rx, probe_result_tx);
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_handle = {
            let req_tx = req_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || run_accept_loop(listener, req_tx, shutdown))
        };

        tracing::info!(addr = %local_addr, "listening");
        Ok(Server {
            local_addr,
            shutdown,
            req_tx,
            accept_handle,
            state_handle,
            probe_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain the state thread, join the workers.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.req_tx.send(StateMsg::Shutdown);
        let _ = self.accept_handle.join();
        let _ = self.state_handle.join();
        let _ = self.probe_handle.join();
        tracing::info!("server stopped");
    }
}

/// Run until a SIGTERM/SIGINT arrives, then shut down cleanly.
pub fn run_daemon(
    config: Config,
    notifier: Box<dyn Notifier>,
    prober: Box<dyn Prober>,
) -> crate::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    let server = Server::start(config, notifier, prober)?;
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    server.shutdown();
    Ok(())
}

fn run_accept_loop(listener: TcpListener, req_tx: Sender<StateMsg>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "client connected");
                let req_tx = req_tx.clone();
                std::thread::spawn(move || handle_client(stream, req_tx));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }
}

/// Handle one client connection.
///
/// Reads chunks into the codec, forwards each complete request to the
/// state thread, and writes the reply in the connection's current mode.
/// Responses on one connection stay in arrival order because this thread
/// is sequential.
fn handle_client(stream: TcpStream, req_tx: Sender<StateMsg>) {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_write_timeout(Some(WRITE_DEADLINE));
    let mut stream = stream;
    let mut conn = ConnState::new();
    let mut chunk = [0u8; 4096];

    'connection: loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        conn.feed(&chunk[..n]);

        while let Some(parsed) = conn.next_request() {
            match parsed {
                Ok(request) => {
                    let cmd = request.cmd.clone();
                    let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
                    let msg = StateMsg::Request(RequestMessage {
                        request,
                        respond: respond_tx,
                    });
                    if req_tx.send(msg).is_err() {
                        break 'connection; // state thread gone
                    }
                    let response = match respond_rx.recv() {
                        Ok(r) => r,
                        Err(_) => break 'connection,
                    };
                    let bytes = encode_response(&cmd, &response, conn.json_mode());
                    if stream.write_all(&bytes).is_err() {
                        tracing::debug!(?peer, "client write failed, dropping connection");
                        break 'connection;
                    }
                }
                Err(WireError::Dumper(reason)) => {
                    // Legacy frames outside the whitelist get no response.
                    tracing::warn!(?peer, %reason, "dropping undecodable legacy request");
                }
                Err(e @ WireError::BadJson(_)) => {
                    let resp = Response::failure(e.to_string());
                    let bytes = encode_response("error", &resp, conn.json_mode());
                    if stream.write_all(&bytes).is_err() {
                        break 'connection;
                    }
                }
                Err(WireError::TooLarge) => {
                    tracing::warn!(?peer, "oversized request, closing connection");
                    break 'connection;
                }
            }
        }
    }
    tracing::debug!(?peer, "client disconnected");
}

/// The state thread: owns the daemon, serializes every mutation, paces the
/// liveness and expiry passes off deadline ticks.
fn run_state_loop(
    mut daemon: Daemon,
    state_path: impl AsRef<Path>,
    req_rx: Receiver<StateMsg>,
    probe_tx: Sender<ProbeOp>,
    probe_result_rx: Receiver<ProbeOutcome>,
) {
    let state_path = state_path.as_ref();
    let ping_delay = Duration::from_secs(daemon.config().ping_delay.max(1));
    let notify_expired = daemon.config().notify_expired;
    let mut next_ping = Instant::now() + ping_delay;
    let mut next_expiry = Instant::now() + EXPIRY_SCAN_INTERVAL;

    loop {
        let deadline = if notify_expired {
            next_ping.min(next_expiry)
        } else {
            next_ping
        };
        let tick = crossbeam::channel::after(deadline.saturating_duration_since(Instant::now()));

        crossbeam::select! {
            recv(req_rx) -> msg => {
                match msg {
                    Ok(StateMsg::Request(RequestMessage { request, respond })) => {
                        let outcome = dispatch(&mut daemon, &request.cmd, &request.params);
                        if outcome.mutated {
                            persist_or_die(state_path, &daemon);
                        }
                        // A closed reply channel just means the client left.
                        let _ = respond.send(outcome.response);
                    }
                    Ok(StateMsg::Shutdown) | Err(_) => {
                        let _ = probe_tx.send(ProbeOp::Shutdown);
                        return;
                    }
                }
            },

            recv(probe_result_rx) -> msg => {
                if let Ok(outcome) = msg {
                    let now = now_epoch();
                    if daemon.apply_probe_outcome(&outcome.reachable, outcome.started, now) {
                        persist_or_die(state_path, &daemon);
                    }
                }
            },

            recv(tick) -> _ => {}
        }

        // Fire whatever came due, no matter what woke us.
        let woke = Instant::now();
        if notify_expired && woke >= next_expiry {
            if daemon.expiry_pass(now_epoch()) {
                persist_or_die(state_path, &daemon);
            }
            next_expiry = woke + EXPIRY_SCAN_INTERVAL;
        }
        if woke >= next_ping {
            let names = daemon.ping_candidates();
            if !names.is_empty() {
                let _ = probe_tx.send(ProbeOp::Cycle {
                    names,
                    started: now_epoch(),
                });
            }
            next_ping = woke + ping_delay;
        }
    }
}

/// Persistence failure is fatal: better to die and be restarted than to
/// acknowledge writes that are not durable.
fn persist_or_die(path: &Path, daemon: &Daemon) {
    if let Err(e) = state::save(path, daemon.registry()) {
        tracing::error!(error = %e, path = %path.display(), "state persistence failed, aborting");
        std::process::exit(1);
    }
}
