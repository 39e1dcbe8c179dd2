use crate::dispatch::{DispatchQueue, WorkItem};
use crate::driver::{DriverMessage, DriverTime, OutputReady, RtHandler};
use crate::session::SessionEvent;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Session sample rate shared between the realtime side and the host side.
#[derive(Debug)]
pub(crate) struct RateCell(AtomicU64);

impl RateCell {
    pub(crate) fn new(rate: f64) -> Self {
        Self(AtomicU64::new(rate.to_bits()))
    }

    pub(crate) fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }
}

/// The realtime side of the bridge: invoked synchronously by the driver on
/// its own thread, once per audio block, under a deadline of one block
/// period. It captures timing, enqueues the ready slot for the host context
/// and returns. No user code, no blocking, ever, on this thread.
pub(crate) struct RtBridge {
    queue: Arc<DispatchQueue>,
    output_ready: Option<Arc<dyn OutputReady>>,
    block_size: u64,
    rate: Arc<RateCell>,
    events: Sender<SessionEvent>,
    /// Running position for drivers that only deliver the timeless callback.
    fallback_position: AtomicU64,
    epoch: Instant,
}

impl RtBridge {
    pub(crate) fn new(
        queue: Arc<DispatchQueue>,
        output_ready: Option<Arc<dyn OutputReady>>,
        block_size: u64,
        rate: Arc<RateCell>,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            queue,
            output_ready,
            block_size,
            rate,
            events,
            fallback_position: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }
}

impl RtHandler for RtBridge {
    fn block_ready(&self, slot: usize) {
        // Back door for drivers without the timed callback: synthesize the
        // timing pair and take the timed path.
        let time = DriverTime {
            system_time_nanos: Some(self.epoch.elapsed().as_nanos() as u64),
            sample_position: Some(self.fallback_position.load(Ordering::Relaxed)),
            timecode_samples: None,
        };
        self.block_ready_with_time(time, slot);
    }

    fn block_ready_with_time(&self, time: DriverTime, slot: usize) {
        // Zero sentinels stand in for fields the driver did not validate.
        let item = WorkItem {
            slot: slot & 1,
            system_time_nanos: time.system_time_nanos.unwrap_or(0),
            sample_position: time.sample_position.unwrap_or(0),
            timecode_samples: time.timecode_samples.unwrap_or(0),
        };
        match time.sample_position {
            Some(position) => self
                .fallback_position
                .store(position + self.block_size, Ordering::Relaxed),
            None => {
                self.fallback_position
                    .fetch_add(self.block_size, Ordering::Relaxed);
            }
        }

        self.queue.submit(item);

        // Signal right after submission: the driver may start moving the
        // previous block's output while the host still works on this one,
        // hiding one block of latency.
        if let Some(ready) = &self.output_ready {
            ready.signal_output_ready();
        }
    }

    fn sample_rate_changed(&self, rate: f64) {
        info!("driver reported sample rate change to {}", rate);
        self.rate.set(rate);
        let _ = self.events.send(SessionEvent::SampleRateChanged(rate));
    }

    fn message(&self, selector: DriverMessage, value: i32) -> i32 {
        match selector {
            DriverMessage::SupportsTimeInfo => 1,
            DriverMessage::EngineVersion => 2,
            DriverMessage::SelectorSupported => match DriverMessage::from_raw_selector(value) {
                DriverMessage::Other(_) => 0,
                _ => 1,
            },
            DriverMessage::ResetRequest => {
                warn!("driver requested a reset; session keeps running");
                0
            }
            DriverMessage::Other(_) => 0,
        }
    }
}
