use crate::bridge::{RateCell, RtBridge};
use crate::config::SessionConfig;
use crate::dispatch::DispatchQueue;
use crate::driver::{DriverPort, load_driver};
use crate::error::BridgeError;
use crate::invoker::{HostWorker, UserCallback};
use crate::negotiate::{self, ChannelDescriptor, NegotiatedCapability};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Only one session may drive a hardware driver per process. The guard is
/// the sole piece of process wide state this crate keeps.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Out-of-band notifications delivered on the session's error channel.
/// Block failures are reported here instead of tearing the stream down.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SampleRateChanged(f64),
    FormatMismatch {
        channel: u32,
        expected: usize,
        got: usize,
    },
    UserCallbackFailure {
        slot: usize,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loaded,
    Initialized,
    BuffersCreated,
    Started,
    Stopped,
    Disposed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loaded => "loaded",
            SessionState::Initialized => "initialized",
            SessionState::BuffersCreated => "buffers-created",
            SessionState::Started => "started",
            SessionState::Stopped => "stopped",
            SessionState::Disposed => "disposed",
        }
    }
}

/// A driver session: owns the driver port, the negotiated capability and
/// the two execution contexts for the life of the stream.
///
/// Lifecycle: `Unloaded → Loaded → Initialized → BuffersCreated → Started →
/// Stopped → Disposed`. Invalid transitions fail with
/// [`BridgeError::InvalidState`] and change nothing.
pub struct DriverSession {
    state: SessionState,
    config: SessionConfig,
    port: Option<Box<dyn DriverPort>>,
    capability: Option<NegotiatedCapability>,
    inputs: Vec<ChannelDescriptor>,
    outputs: Vec<ChannelDescriptor>,
    queue: Option<Arc<DispatchQueue>>,
    host: Option<JoinHandle<()>>,
    rate: Arc<RateCell>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    guard_held: bool,
}

impl DriverSession {
    /// Create a session that will load its driver from the registry.
    pub fn new(config: SessionConfig) -> Result<Self, BridgeError> {
        Self::build(config, None)
    }

    /// Create a session around a caller supplied driver port, bypassing the
    /// registry. The lifecycle is identical.
    pub fn with_port(config: SessionConfig, port: Box<dyn DriverPort>) -> Result<Self, BridgeError> {
        Self::build(config, Some(port))
    }

    fn build(config: SessionConfig, port: Option<Box<dyn DriverPort>>) -> Result<Self, BridgeError> {
        config.validate()?;
        if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::InvalidState {
                expected: "no active session",
                found: "another session is active",
            });
        }
        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            state: SessionState::Unloaded,
            config,
            port,
            capability: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            queue: None,
            host: None,
            rate: Arc::new(RateCell::new(0.0)),
            events_tx,
            events_rx,
            guard_held: true,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Capability snapshot; `None` until buffers are created.
    pub fn capability(&self) -> Option<&NegotiatedCapability> {
        self.capability.as_ref()
    }

    /// Active input channels, in request order. Empty until buffers exist.
    pub fn inputs(&self) -> &[ChannelDescriptor] {
        &self.inputs
    }

    /// Active output channels, in request order. Empty until buffers exist.
    pub fn outputs(&self) -> &[ChannelDescriptor] {
        &self.outputs
    }

    /// Current sample rate, tracking driver reported changes after start.
    pub fn sample_rate(&self) -> f64 {
        self.rate.get()
    }

    /// Count of hardware slots the driver reused before the host released
    /// them. Grows when the user callback is persistently slower than the
    /// block period.
    pub fn overruns(&self) -> u64 {
        self.queue.as_ref().map(|q| q.overruns()).unwrap_or(0)
    }

    /// A receiver for the session's error channel.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    fn expect_state(&self, op: &str, wanted: &'static str, ok: bool) -> Result<(), BridgeError> {
        if ok {
            Ok(())
        } else {
            warn!("{} refused in state {}", op, self.state.name());
            Err(BridgeError::InvalidState {
                expected: wanted,
                found: self.state.name(),
            })
        }
    }

    /// Load the driver, initialize it and negotiate buffers:
    /// `Unloaded → BuffersCreated`. Each stage fails with its own error and
    /// leaves the session in the last state it actually reached.
    pub fn init(&mut self) -> Result<(), BridgeError> {
        self.expect_state("init", "unloaded", self.state == SessionState::Unloaded)?;

        let mut port = match self.port.take() {
            Some(port) => port,
            None => load_driver(&self.config.driver_name)?,
        };
        info!("driver '{}' loaded", port.name());
        self.state = SessionState::Loaded;

        match port.init() {
            Ok(banner) => info!("driver initialized: {}", banner),
            Err(fault) => {
                self.port = Some(port);
                return Err(BridgeError::DriverInit(fault.0));
            }
        }
        self.state = SessionState::Initialized;

        let negotiated = match negotiate::negotiate(port.as_mut(), &self.config) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                // Negotiation is all or nothing; the session stays
                // initialized so the failure stage is observable.
                self.port = Some(port);
                return Err(e);
            }
        };
        self.rate.set(negotiated.capability.sample_rate);
        self.capability = Some(negotiated.capability);
        self.inputs = negotiated.inputs;
        self.outputs = negotiated.outputs;
        self.port = Some(port);
        self.state = SessionState::BuffersCreated;
        Ok(())
    }

    /// Status code form of [`init`](Self::init) for integer consuming
    /// hosts: 0 on success, a negative stage code otherwise.
    pub fn init_status(&mut self) -> i32 {
        match self.init() {
            Ok(()) => 0,
            Err(e) => {
                warn!("init failed: {}", e);
                e.status_code()
            }
        }
    }

    /// Register the user callback and start the stream:
    /// `BuffersCreated → Started`.
    ///
    /// One callback per session; there is no fan-out. The four realtime
    /// hooks are handed to the driver here and the host thread starts
    /// draining completions.
    pub fn start(&mut self, callback: UserCallback) -> Result<(), BridgeError> {
        self.expect_state(
            "start",
            "buffers-created",
            self.state == SessionState::BuffersCreated,
        )?;
        let port = self.port.as_mut().expect("port present in buffers-created");
        let capability = self
            .capability
            .as_ref()
            .expect("capability present in buffers-created");
        let block_size = capability.block_size as usize;

        let (queue, rx) = DispatchQueue::new();
        let worker = HostWorker::new(
            rx,
            queue.clone(),
            self.inputs.clone(),
            self.outputs.clone(),
            block_size,
            callback,
            self.events_tx.clone(),
        );
        let host = worker.spawn();

        let bridge = Arc::new(RtBridge::new(
            queue.clone(),
            port.output_ready(),
            block_size as u64,
            self.rate.clone(),
            self.events_tx.clone(),
        ));

        port.control_panel();
        if let Err(fault) = port.start(bridge) {
            queue.quiesce();
            let _ = host.join();
            return Err(BridgeError::DriverInit(format!(
                "driver start failed: {fault}"
            )));
        }

        self.queue = Some(queue);
        self.host = Some(host);
        self.state = SessionState::Started;
        info!("stream started at {} samples per block", block_size);
        Ok(())
    }

    /// Stop the stream: `Started → Stopped`. When this returns, no further
    /// user callback invocation occurs; blocks still in flight are
    /// discarded, not delivered.
    pub fn stop(&mut self) -> Result<(), BridgeError> {
        self.expect_state("stop", "started", self.state == SessionState::Started)?;
        let port = self.port.as_mut().expect("port present in started");
        if let Err(fault) = port.stop() {
            warn!("driver stop reported: {}", fault);
        }
        // The driver no longer invokes the hooks; fence the queue so
        // anything already enqueued is drained or discarded before we
        // return.
        if let Some(queue) = &self.queue {
            queue.quiesce();
        }
        if let Some(host) = self.host.take() {
            let _ = host.join();
        }
        self.state = SessionState::Stopped;
        info!("stream stopped, {} overruns", self.overruns());
        Ok(())
    }

    /// Release buffers and the driver: `{Stopped, BuffersCreated} →
    /// Disposed`. Terminal.
    pub fn de_init(&mut self) -> Result<(), BridgeError> {
        self.expect_state(
            "de_init",
            "stopped or buffers-created",
            matches!(
                self.state,
                SessionState::Stopped | SessionState::BuffersCreated
            ),
        )?;
        if let Some(mut port) = self.port.take() {
            if let Err(fault) = port.dispose_buffers() {
                warn!("buffer disposal reported: {}", fault);
            }
            port.deinit();
        }
        self.inputs.clear();
        self.outputs.clear();
        self.capability = None;
        self.state = SessionState::Disposed;
        self.release_guard();
        Ok(())
    }

    fn release_guard(&mut self) {
        if self.guard_held {
            self.guard_held = false;
            SESSION_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        if self.state == SessionState::Started {
            let _ = self.stop();
        }
        if let Some(mut port) = self.port.take() {
            let _ = port.dispose_buffers();
            port.deinit();
        }
        self.release_guard();
    }
}
