//! Liveness probing.
//!
//! Probing happens on a dedicated worker thread so DNS stalls and the
//! collection window never block request handling; only the state thread
//! applies the results.

use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};

/// Probes target the TCP `time` service.
pub const TIME_SERVICE_PORT: u16 = 37;

/// How long one probe cycle collects acknowledgments.
const PROBE_WINDOW: Duration = Duration::from_secs(5);

pub trait Prober: Send {
    /// Whether the name resolves at all.
    fn resolve(&self, name: &str) -> bool;

    /// Probe the named hosts; returns the subset that acknowledged within
    /// the collection window.
    fn probe(&self, names: &[String]) -> BTreeSet<String>;
}

/// Production prober: a concurrent connect per host, reaped until the
/// window closes.
pub struct TimeServiceProber {
    window: Duration,
}

impl TimeServiceProber {
    pub fn new() -> Self {
        Self {
            window: PROBE_WINDOW,
        }
    }
}

impl Default for TimeServiceProber {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober for TimeServiceProber {
    fn resolve(&self, name: &str) -> bool {
        (name, TIME_SERVICE_PORT)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    }

    fn probe(&self, names: &[String]) -> BTreeSet<String> {
        let (tx, rx) = crossbeam::channel::bounded(names.len().max(1));
        let deadline = Instant::now() + self.window;

        let mut launched = 0usize;
        for name in names {
            let addr = (name.as_str(), TIME_SERVICE_PORT)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next());
            let Some(addr) = addr else {
                tracing::debug!(host = %name, "lost address between resolve and probe");
                continue;
            };
            launched += 1;
            let tx = tx.clone();
            let name = name.clone();
            let window = self.window;
            std::thread::spawn(move || {
                if TcpStream::connect_timeout(&addr, window).is_ok() {
                    let _ = tx.send(name);
                }
            });
        }
        drop(tx);

        let mut reachable = BTreeSet::new();
        while reachable.len() < launched {
            match rx.recv_deadline(deadline) {
                Ok(name) => {
                    reachable.insert(name);
                }
                Err(_) => break,
            }
        }
        reachable
    }
}

/// One probe cycle requested by the state thread.
pub enum ProbeOp {
    Cycle { names: Vec<String>, started: u64 },
    Shutdown,
}

/// Result of a probe cycle, applied by the state thread.
pub struct ProbeOutcome {
    pub reachable: BTreeSet<String>,
    pub started: u64,
}

/// Worker loop: resolve, probe, report.
pub fn run_probe_loop(
    prober: Box<dyn Prober>,
    ops: Receiver<ProbeOp>,
    results: Sender<ProbeOutcome>,
) {
    for op in ops {
        match op {
            ProbeOp::Cycle { names, started } => {
                let resolved: Vec<String> = names
                    .into_iter()
                    .filter(|name| {
                        let ok = prober.resolve(name);
                        if !ok {
                            tracing::debug!(host = %name, "name resolution failed, skipping probe");
                        }
                        ok
                    })
                    .collect();
                let reachable = prober.probe(&resolved);
                tracing::debug!(
                    probed = resolved.len(),
                    reachable = reachable.len(),
                    "probe cycle complete"
                );
                if results.send(ProbeOutcome { reachable, started }).is_err() {
                    return;
                }
            }
            ProbeOp::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Prober with a fixed answer set; used across the test suite.
    pub struct StaticProber {
        pub up: BTreeSet<String>,
    }

    impl Prober for StaticProber {
        fn resolve(&self, _name: &str) -> bool {
            true
        }

        fn probe(&self, names: &[String]) -> BTreeSet<String> {
            names
                .iter()
                .filter(|n| self.up.contains(*n))
                .cloned()
                .collect()
        }
    }

    #[test]
    fn worker_reports_cycle_results() {
        let (op_tx, op_rx) = crossbeam::channel::unbounded();
        let (result_tx, result_rx) = crossbeam::channel::unbounded();
        let prober = StaticProber {
            up: [String::from("h2")].into(),
        };
        let handle = std::thread::spawn(move || run_probe_loop(Box::new(prober), op_rx, result_tx));

        op_tx
            .send(ProbeOp::Cycle {
                names: vec!["h1".into(), "h2".into()],
                started: 42,
            })
            .unwrap();
        let outcome = result_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("outcome");
        assert_eq!(outcome.started, 42);
        assert_eq!(outcome.reachable, [String::from("h2")].into());

        op_tx.send(ProbeOp::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn probe_of_unresolvable_names_is_empty() {
        let prober = TimeServiceProber::new();
        let names = vec![String::from("no.such.host.invalid")];
        assert!(prober.probe(&names).is_empty());
    }
}
