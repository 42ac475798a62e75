//! Reachability probing for rdeck.
//!
//! A probe resolves a machine name and tries a TCP connection to the remote
//! desktop port. Probes block, so they run on Tokio's blocking pool; the
//! [`StatusPoller`] keeps a runtime on a background thread and hands results
//! back over a channel for the owner of the desk to apply.

use std::collections::HashSet;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, trace, warn};

use rd_core::{CoreError, CoreResult, ProbeOutcome, ProbeReport, Prober, RefreshTick};

/// Standard remote desktop port.
pub const DEFAULT_PORT: u16 = 3389;
/// Default connect timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes a TCP port with a bounded connect timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpProber {
    port: u16,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, DEFAULT_TIMEOUT)
    }
}

impl Prober for TcpProber {
    fn probe(&self, machine: &str) -> ProbeOutcome {
        let addrs: Vec<SocketAddr> = match (machine, self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                debug!(machine, error = %err, "name resolution failed");
                return ProbeOutcome::unreachable();
            }
        };
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(_) => {
                    return ProbeOutcome {
                        reachable: true,
                        address: Some(addr.ip()),
                    }
                }
                Err(err) => trace!(machine, %addr, error = %err, "connect failed"),
            }
        }
        ProbeOutcome {
            reachable: false,
            address: addrs.first().map(SocketAddr::ip),
        }
    }
}

/// Probe every machine of a refresh concurrently and collect the reports.
pub async fn run_probes(prober: Arc<dyn Prober>, refresh: RefreshTick) -> Vec<ProbeReport> {
    let mut handles = Vec::new();
    for machine in refresh.machines {
        let prober = Arc::clone(&prober);
        let name = machine.clone();
        handles.push((
            machine,
            tokio::task::spawn_blocking(move || prober.probe(&name)),
        ));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (machine, handle) in handles {
        let outcome = handle.await.unwrap_or_else(|err| {
            warn!(machine = %machine, error = %err, "probe task failed");
            ProbeOutcome::unreachable()
        });
        reports.push(ProbeReport {
            machine,
            tick: refresh.tick,
            outcome,
        });
    }
    reports
}

/// Background status refresher.
///
/// Each submitted [`RefreshTick`] probes its machines concurrently. A machine
/// whose previous probe is still running is skipped for that tick. Reports
/// arrive one by one as probes finish.
pub struct StatusPoller {
    requests: async_mpsc::UnboundedSender<RefreshTick>,
    reports: mpsc::Receiver<ProbeReport>,
    worker: Option<thread::JoinHandle<()>>,
}

impl StatusPoller {
    /// Start the background runtime.
    pub fn spawn(prober: Arc<dyn Prober>) -> CoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| CoreError::Worker(format!("failed to build probe runtime: {err}")))?;
        let (request_tx, mut request_rx) = async_mpsc::unbounded_channel::<RefreshTick>();
        let (report_tx, report_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("rdeck-probe".into())
            .spawn(move || {
                let in_flight: Arc<Mutex<HashSet<String>>> = Arc::default();
                runtime.block_on(async move {
                    while let Some(refresh) = request_rx.recv().await {
                        debug!(tick = refresh.tick, machines = refresh.machines.len(), "refresh started");
                        for machine in refresh.machines {
                            let started = in_flight
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(machine.clone());
                            if !started {
                                trace!(machine = %machine, "probe still running, skipping");
                                continue;
                            }
                            let prober = Arc::clone(&prober);
                            let in_flight = Arc::clone(&in_flight);
                            let report_tx = report_tx.clone();
                            let tick = refresh.tick;
                            tokio::task::spawn_blocking(move || {
                                let outcome = prober.probe(&machine);
                                in_flight
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .remove(&machine);
                                let _ = report_tx.send(ProbeReport {
                                    machine,
                                    tick,
                                    outcome,
                                });
                            });
                        }
                    }
                });
                runtime.shutdown_background();
            })
            .map_err(|err| CoreError::Worker(format!("failed to spawn probe thread: {err}")))?;

        Ok(Self {
            requests: request_tx,
            reports: report_rx,
            worker: Some(worker),
        })
    }

    /// Queue a refresh. Returns false once the worker has stopped.
    pub fn submit(&self, refresh: RefreshTick) -> bool {
        self.requests.send(refresh).is_ok()
    }

    /// Next finished report, if any.
    pub fn try_recv(&self) -> Option<ProbeReport> {
        self.reports.try_recv().ok()
    }

    /// Wait up to `timeout` for the next report.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProbeReport> {
        self.reports.recv_timeout(timeout).ok()
    }

    /// Every report that has finished so far.
    pub fn drain(&self) -> Vec<ProbeReport> {
        self.reports.try_iter().collect()
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        let (closed, _) = async_mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.requests, closed));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
