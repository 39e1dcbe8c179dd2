//! Software loopback driver.
//!
//! Fabricates a duplex device whose inputs replay what the host wrote to
//! the outputs one block earlier. Registered as `"loopback"`; it gives
//! hosts without hardware a fully working session and drives the realtime
//! hooks from a plain thread paced at the block period.

use crate::driver::{
    BlockSizeRange, ChannelRequest, DriverPort, DriverTime, HwBufferPair, HwChannelInfo,
    OutputReady, RtHandler,
};
use crate::error::DriverFault;
use crate::format::SampleEncoding;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RT_PRIORITY_PUMP: i32 = 18;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub input_channels: u32,
    pub output_channels: u32,
    pub block_size_range: BlockSizeRange,
    pub sample_rate: f64,
    pub encoding: SampleEncoding,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_channels: 2,
            output_channels: 2,
            block_size_range: BlockSizeRange {
                min: 32,
                max: 4096,
                preferred: 512,
                granularity: -1,
            },
            sample_rate: 48_000.0,
            encoding: SampleEncoding::Int32Lsb,
        }
    }
}

#[derive(Debug, Clone)]
struct Lane {
    request: ChannelRequest,
    pair: HwBufferPair,
}

#[derive(Debug, Default)]
struct LoopbackOutputReady {
    signals: AtomicU64,
}

impl OutputReady for LoopbackOutputReady {
    fn signal_output_ready(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
    }
}

struct Pump {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct LoopbackDriver {
    opts: LoopbackOptions,
    rate: f64,
    lanes: Vec<Lane>,
    block_size: u32,
    output_ready: Arc<LoopbackOutputReady>,
    pump: Option<Pump>,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackDriver {
    pub fn new(opts: LoopbackOptions) -> Self {
        let rate = opts.sample_rate;
        Self {
            opts,
            rate,
            lanes: Vec::new(),
            block_size: 0,
            output_ready: Arc::new(LoopbackOutputReady::default()),
            pump: None,
        }
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop.store(true, Ordering::Release);
            let _ = pump.handle.join();
        }
    }
}

impl DriverPort for LoopbackDriver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn init(&mut self) -> Result<String, DriverFault> {
        Ok(format!(
            "loopback duplex device, {} in / {} out, {:?}",
            self.opts.input_channels, self.opts.output_channels, self.opts.encoding
        ))
    }

    fn channel_counts(&self) -> Result<(u32, u32), DriverFault> {
        Ok((self.opts.input_channels, self.opts.output_channels))
    }

    fn block_size_range(&self) -> Result<BlockSizeRange, DriverFault> {
        Ok(self.opts.block_size_range)
    }

    fn sample_rate(&self) -> Result<f64, DriverFault> {
        Ok(self.rate)
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<(), DriverFault> {
        if rate <= 0.0 {
            return Err(DriverFault::new(format!("cannot set sample rate {rate}")));
        }
        self.rate = rate;
        Ok(())
    }

    fn output_ready(&self) -> Option<Arc<dyn OutputReady>> {
        Some(self.output_ready.clone())
    }

    fn create_buffers(
        &mut self,
        requests: &[ChannelRequest],
        block_size: u32,
    ) -> Result<Vec<HwBufferPair>, DriverFault> {
        let slot_bytes = self.opts.encoding.block_bytes(block_size as usize);
        let mut lanes = Vec::with_capacity(requests.len());
        for request in requests {
            let count = if request.input {
                self.opts.input_channels
            } else {
                self.opts.output_channels
            };
            if request.index >= count {
                return Err(DriverFault::new(format!(
                    "no {} channel {}",
                    if request.input { "input" } else { "output" },
                    request.index
                )));
            }
            lanes.push(Lane {
                request: *request,
                pair: HwBufferPair::new(slot_bytes),
            });
        }
        self.block_size = block_size;
        let pairs = lanes.iter().map(|lane| lane.pair.clone()).collect();
        self.lanes = lanes;
        Ok(pairs)
    }

    fn channel_info(&self, index: u32, input: bool) -> Result<HwChannelInfo, DriverFault> {
        let (count, direction) = if input {
            (self.opts.input_channels, "In")
        } else {
            (self.opts.output_channels, "Out")
        };
        if index >= count {
            return Err(DriverFault::new(format!("no {direction} channel {index}")));
        }
        Ok(HwChannelInfo {
            name: format!("Loopback {direction} {index}"),
            encoding: self.opts.encoding,
            clock_group: 0,
        })
    }

    fn latencies(&self) -> Result<(u32, u32), DriverFault> {
        if self.block_size == 0 {
            return Err(DriverFault::new("latencies queried before buffers exist"));
        }
        // Input is one block old when the host sees it; output takes the
        // double buffer plus one transfer to reach the far end.
        Ok((self.block_size, self.block_size * 2))
    }

    fn start(&mut self, handler: Arc<dyn RtHandler>) -> Result<(), DriverFault> {
        if self.block_size == 0 {
            return Err(DriverFault::new("start requested before buffers exist"));
        }
        if self.pump.is_some() {
            return Err(DriverFault::new("stream already running"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let lanes = self.lanes.clone();
        let block_size = self.block_size;
        let encoding = self.opts.encoding;
        let period = Duration::from_secs_f64(block_size as f64 / self.rate);
        let pump_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("loopback-rt".to_string())
            .spawn(move || {
                if let Err(e) = configure_rt_thread("loopback-rt", RT_PRIORITY_PUMP) {
                    warn!("loopback pump realtime priority not enabled: {}", e);
                }
                pump(handler, lanes, block_size, encoding, period, pump_stop);
            })
            .map_err(|e| DriverFault::new(format!("failed to spawn pump thread: {e}")))?;

        self.pump = Some(Pump { stop, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverFault> {
        // Joining the pump is the no-invocations-after-return guarantee.
        self.stop_pump();
        Ok(())
    }

    fn dispose_buffers(&mut self) -> Result<(), DriverFault> {
        self.stop_pump();
        self.lanes.clear();
        self.block_size = 0;
        Ok(())
    }

    fn control_panel(&mut self) {
        debug!("loopback driver has no control panel");
    }

    fn deinit(&mut self) {
        self.stop_pump();
        self.lanes.clear();
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// The simulated realtime thread: alternates slots at the block period,
/// feeding each input lane from the paired output lane's previous slot.
fn pump(
    handler: Arc<dyn RtHandler>,
    lanes: Vec<Lane>,
    block_size: u32,
    encoding: SampleEncoding,
    period: Duration,
    stop: Arc<AtomicBool>,
) {
    let inputs: Vec<&Lane> = lanes.iter().filter(|l| l.request.input).collect();
    let outputs: Vec<&Lane> = lanes.iter().filter(|l| !l.request.input).collect();
    let block_bytes = encoding.block_bytes(block_size as usize);
    let epoch = Instant::now();
    let mut position: u64 = 0;
    let mut slot = 0_usize;

    while !stop.load(Ordering::Acquire) {
        if !outputs.is_empty() {
            for (i, input) in inputs.iter().enumerate() {
                let source = outputs[i % outputs.len()];
                let src = &source.pair.slots[1 - slot].bytes()[..block_bytes];
                input.pair.slots[slot].bytes()[..block_bytes].copy_from_slice(src);
            }
        }

        let time = DriverTime {
            system_time_nanos: Some(epoch.elapsed().as_nanos() as u64),
            sample_position: Some(position),
            timecode_samples: None,
        };
        handler.block_ready_with_time(time, slot);

        position += block_size as u64;
        slot = 1 - slot;
        std::thread::sleep(period);
    }
}

#[cfg(unix)]
fn configure_rt_thread(name: &str, priority: i32) -> Result<(), String> {
    use nix::libc;

    let thread = unsafe { libc::pthread_self() };
    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        let c_name = std::ffi::CString::new(name).map_err(|e| e.to_string())?;
        #[cfg(target_os = "linux")]
        unsafe {
            let _ = libc::pthread_setname_np(thread, c_name.as_ptr());
        }
        #[cfg(target_os = "freebsd")]
        unsafe {
            let _ = libc::pthread_set_name_np(thread, c_name.as_ptr());
        }
    }

    let param = unsafe {
        let mut p = std::mem::zeroed::<libc::sched_param>();
        p.sched_priority = priority;
        p
    };
    let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(format!(
            "pthread_setschedparam({}, prio {}) failed with errno {}",
            name, priority, rc
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn configure_rt_thread(name: &str, priority: i32) -> Result<(), String> {
    let _ = (name, priority);
    Err("realtime thread priority is not supported on this platform".to_string())
}
