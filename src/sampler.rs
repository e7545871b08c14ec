//! Background sampling loop.
//!
//! The sampler thread owns the device session for its whole life: it opens
//! the session, polls every device once per interval, hands the ordered
//! snapshot list to a sink and closes the session exactly once on exit.

use crate::data::DeviceSnapshot;
use crate::memory::MemoryReconciler;
use crate::monitor::{read_device, DeviceSession, MonitorError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cooperative stop request shared between the sampler and its owner.
///
/// Stopping also wakes a sampler that is sleeping between cycles.
#[derive(Clone, Debug)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl StopToken {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `timeout`. Returns true if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(_) => self.is_stopped(),
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerPhase {
    Idle,
    Sampling,
    Sleeping,
    Stopped,
}

impl SamplerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SamplerPhase::Idle,
            1 => SamplerPhase::Sampling,
            2 => SamplerPhase::Sleeping,
            _ => SamplerPhase::Stopped,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    fn set(&self, phase: SamplerPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }

    fn get(&self) -> SamplerPhase {
        SamplerPhase::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Receives one ordered snapshot list per cycle.
pub trait SnapshotSink {
    /// Fails only when nobody is listening any more.
    fn publish(&mut self, snapshots: Vec<DeviceSnapshot>) -> Result<(), MonitorError>;
}

impl SnapshotSink for Sender<Vec<DeviceSnapshot>> {
    fn publish(&mut self, snapshots: Vec<DeviceSnapshot>) -> Result<(), MonitorError> {
        self.send(snapshots).map_err(|_| MonitorError::SinkClosed)
    }
}

/// Polls every enumerated device once, in index order.
///
/// A device whose handle cannot be obtained still gets a snapshot with only
/// its index filled in, so the list always has one entry per device.
pub fn sample_cycle<S: DeviceSession>(
    session: &S,
    reconciler: &MemoryReconciler,
) -> Result<Vec<DeviceSnapshot>, MonitorError> {
    let count = session.device_count()?;
    if count == 0 {
        return Ok(Vec::new());
    }

    let memory = reconciler.begin_cycle();
    let snapshots = (0..count)
        .map(|index| {
            let snapshot = match session.device(index) {
                Ok(device) => read_device(index, device.as_ref()),
                Err(e) => {
                    log::debug!("GPU {index}: handle unavailable: {e}");
                    DeviceSnapshot {
                        index,
                        ..Default::default()
                    }
                }
            };
            memory.apply(snapshot)
        })
        .collect();
    Ok(snapshots)
}

// Shuts the session down when dropped, including while unwinding.
struct SessionGuard<S: DeviceSession>(Option<S>);

impl<S: DeviceSession> SessionGuard<S> {
    fn session(&self) -> Option<&S> {
        self.0.as_ref()
    }
}

impl<S: DeviceSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            session.shutdown();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn run_loop<S, K>(
    session: S,
    reconciler: MemoryReconciler,
    mut sink: K,
    stop: StopToken,
    phase: PhaseCell,
    interval: Duration,
) where
    S: DeviceSession,
    K: SnapshotSink,
{
    let guard = SessionGuard(Some(session));

    while !stop.is_stopped() {
        phase.set(SamplerPhase::Sampling);
        let cycle = match guard.session() {
            Some(session) => panic::catch_unwind(AssertUnwindSafe(|| {
                sample_cycle(session, &reconciler)
            }))
            .unwrap_or_else(|payload| {
                Err(MonitorError::CyclePanicked(panic_message(payload.as_ref())))
            }),
            None => break,
        };

        let snapshots = match cycle {
            Ok(snapshots) => snapshots,
            Err(e) => {
                log::error!("Sampling stopped after a failed cycle: {e}");
                break;
            }
        };

        log::debug!("Sampled {} device(s)", snapshots.len());
        if log::log_enabled!(log::Level::Trace) {
            if let Ok(json) = serde_json::to_string(&snapshots) {
                log::trace!("{json}");
            }
        }

        if sink.publish(snapshots).is_err() {
            log::info!("Snapshot receiver closed, stopping sampler");
            break;
        }

        if stop.is_stopped() {
            break;
        }
        phase.set(SamplerPhase::Sleeping);
        if stop.wait(interval) {
            break;
        }
    }

    drop(guard);
    phase.set(SamplerPhase::Stopped);
}

/// Owner's handle on a running sampler thread.
///
/// Dropping the handle stops the sampler and waits for the thread.
pub struct SamplerHandle {
    stop: StopToken,
    phase: PhaseCell,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Starts the sampler thread. `init` opens the device session on that
    /// thread; if it fails the error is returned here and no loop runs.
    pub fn spawn<S, F, K>(
        init: F,
        reconciler: MemoryReconciler,
        sink: K,
        interval: Duration,
    ) -> Result<Self, MonitorError>
    where
        S: DeviceSession + 'static,
        F: FnOnce() -> Result<S, MonitorError> + Send + 'static,
        K: SnapshotSink + Send + 'static,
    {
        let stop = StopToken::new();
        let phase = PhaseCell::default();
        let (ready_tx, ready_rx) = bounded::<Result<(), MonitorError>>(1);

        let thread = {
            let stop = stop.clone();
            let phase = phase.clone();
            thread::Builder::new()
                .name("gpu-sampler".to_string())
                .spawn(move || {
                    let session = match init() {
                        Ok(session) => session,
                        Err(e) => {
                            phase.set(SamplerPhase::Stopped);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    run_loop(session, reconciler, sink, stop, phase, interval);
                })?
        };

        let ready = ready_rx.recv().unwrap_or(Err(MonitorError::InitAborted));
        match ready {
            Ok(()) => Ok(Self {
                stop,
                phase,
                thread: Some(thread),
            }),
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    pub fn phase(&self) -> SamplerPhase {
        self.phase.get()
    }

    /// Asks the loop to finish. A sleeping loop wakes up right away.
    pub fn stop(&self) {
        self.stop.stop();
    }

    fn stop_and_wait(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Sampler thread panicked");
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop_and_wait();
    }
}
