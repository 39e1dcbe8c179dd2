use crate::config::SessionConfig;
use crate::driver::{ChannelRequest, DriverPort, HwBufferPair, SlotCell};
use crate::error::BridgeError;
use crate::format::SampleEncoding;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_INPUT_CHANNELS: usize = 32;
pub const MAX_OUTPUT_CHANNELS: usize = 32;

/// Rates above this are treated as a driver that does not store its own
/// rate, triggering an explicit set and re-read.
pub const MAX_SAMPLE_RATE: f64 = 96_000.0;

/// Capability snapshot produced by negotiation. Read only afterwards.
#[derive(Debug, Clone)]
pub struct NegotiatedCapability {
    pub min_block_size: u32,
    pub max_block_size: u32,
    /// The accepted block size: the caller's request, validated against the
    /// driver's range. The driver's preferred size is advisory only.
    pub block_size: u32,
    pub granularity: i32,
    pub hw_input_channels: u32,
    pub hw_output_channels: u32,
    /// Active (clamped) channel counts actually backed by buffers.
    pub input_channels: u32,
    pub output_channels: u32,
    pub sample_rate: f64,
    /// Whether the driver supports the output-ready optimization.
    pub post_output: bool,
    pub input_latency: u32,
    pub output_latency: u32,
}

/// One activated channel after buffer creation. Immutable for the life of
/// the buffers; invalidated on disposal.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub input: bool,
    pub hw_index: u32,
    pub name: String,
    pub encoding: SampleEncoding,
    pub clock_group: i32,
    pub slots: [Arc<SlotCell>; 2],
}

#[derive(Debug)]
pub struct Negotiated {
    pub capability: NegotiatedCapability,
    pub inputs: Vec<ChannelDescriptor>,
    pub outputs: Vec<ChannelDescriptor>,
}

fn clamp_channels(requested: &[u32], hw_count: u32, cap: usize, direction: &str) -> Vec<u32> {
    let keep = requested.len().min(hw_count as usize).min(cap);
    if keep < requested.len() {
        warn!(
            "{} channel list clamped from {} to {} (hardware {}, cap {})",
            direction,
            requested.len(),
            keep,
            hw_count,
            cap
        );
    }
    requested[..keep].to_vec()
}

fn block_size_valid(size: u32, min: u32, max: u32, granularity: i32) -> bool {
    if size < min || size > max {
        return false;
    }
    if granularity < 0 {
        return size.is_power_of_two();
    }
    if granularity > 0 && size != min {
        return (size - min) % granularity as u32 == 0;
    }
    true
}

/// Reconcile the requested configuration against what the driver reports,
/// then allocate hardware buffers for the clamped channel lists.
///
/// All or nothing: a failure in any step (including per-channel info after
/// buffers exist) unwinds buffer creation and fails the whole negotiation
/// with the stage's error.
pub fn negotiate(port: &mut dyn DriverPort, config: &SessionConfig) -> Result<Negotiated, BridgeError> {
    let (hw_in, hw_out) = port
        .channel_counts()
        .map_err(|e| BridgeError::ChannelQuery(e.to_string()))?;
    info!(
        "hardware channels: {} in, {} out; requested {} in, {} out",
        hw_in,
        hw_out,
        config.input_channels.len(),
        config.output_channels.len()
    );

    let inputs = clamp_channels(&config.input_channels, hw_in, MAX_INPUT_CHANNELS, "input");
    let outputs = clamp_channels(&config.output_channels, hw_out, MAX_OUTPUT_CHANNELS, "output");

    let range = port
        .block_size_range()
        .map_err(|e| BridgeError::BufferSizeQuery(e.to_string()))?;
    info!(
        "block sizes: min {}, max {}, preferred {}, granularity {}",
        range.min, range.max, range.preferred, range.granularity
    );

    // The caller's realtime budget governs, not the driver's suggestion;
    // but the request still has to fit the driver's range.
    let block_size = config.samples_per_block;
    if !block_size_valid(block_size, range.min, range.max, range.granularity) {
        return Err(BridgeError::BufferSizeQuery(format!(
            "requested block size {} outside driver range [{}, {}] (granularity {})",
            block_size, range.min, range.max, range.granularity
        )));
    }

    let current_rate = port
        .sample_rate()
        .map_err(|e| BridgeError::SampleRate(e.to_string()))?;
    let requested_rate = config.sample_rate as f64;
    let sample_rate = if current_rate <= 0.0 || current_rate > MAX_SAMPLE_RATE {
        // The driver does not store a usable rate; set ours and read it
        // back to confirm it took.
        port.set_sample_rate(requested_rate)
            .map_err(|e| BridgeError::SampleRate(e.to_string()))?;
        let confirmed = port
            .sample_rate()
            .map_err(|e| BridgeError::SampleRate(e.to_string()))?;
        info!("sample rate set to {} (driver reported {})", confirmed, current_rate);
        confirmed
    } else {
        if (current_rate - requested_rate).abs() > f64::EPSILON {
            info!(
                "driver rate {} differs from requested {}, using requested",
                current_rate, requested_rate
            );
        }
        requested_rate
    };

    let post_output = port.output_ready().is_some();
    info!(
        "output-ready optimization: {}",
        if post_output { "supported" } else { "not supported" }
    );

    // Inputs first, then outputs; buffer and channel info arrays share this
    // indexing.
    let requests: Vec<ChannelRequest> = inputs
        .iter()
        .map(|&index| ChannelRequest { input: true, index })
        .chain(outputs.iter().map(|&index| ChannelRequest { input: false, index }))
        .collect();

    let pairs = port
        .create_buffers(&requests, block_size)
        .map_err(|e| BridgeError::BufferCreation(e.to_string()))?;
    if pairs.len() != requests.len() {
        let _ = port.dispose_buffers();
        return Err(BridgeError::BufferCreation(format!(
            "driver returned {} buffer pairs for {} channels",
            pairs.len(),
            requests.len()
        )));
    }

    let mut input_descs = Vec::with_capacity(inputs.len());
    let mut output_descs = Vec::with_capacity(outputs.len());
    for (request, pair) in requests.iter().zip(pairs) {
        let info = match port.channel_info(request.index, request.input) {
            Ok(info) => info,
            Err(e) => {
                let _ = port.dispose_buffers();
                return Err(BridgeError::BufferCreation(format!(
                    "channel info for {} {} failed: {}",
                    if request.input { "input" } else { "output" },
                    request.index,
                    e
                )));
            }
        };
        let desc = ChannelDescriptor {
            input: request.input,
            hw_index: request.index,
            name: info.name,
            encoding: info.encoding,
            clock_group: info.clock_group,
            slots: pair.slots,
        };
        if request.input {
            input_descs.push(desc);
        } else {
            output_descs.push(desc);
        }
    }

    if let Some(first) = input_descs.first().or(output_descs.first()) {
        info!(
            "hardware encoding {:?} ({} bits per sample); requested {} bits, {} endian",
            first.encoding,
            first.encoding.bytes_per_sample() * 8,
            config.bits_per_sample,
            config.endianness
        );
    }

    // Latencies are only meaningful once buffers exist.
    let (input_latency, output_latency) = match port.latencies() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = port.dispose_buffers();
            return Err(BridgeError::BufferCreation(format!(
                "latency query failed: {e}"
            )));
        }
    };
    info!("latencies: input {}, output {}", input_latency, output_latency);

    Ok(Negotiated {
        capability: NegotiatedCapability {
            min_block_size: range.min,
            max_block_size: range.max,
            block_size,
            granularity: range.granularity,
            hw_input_channels: hw_in,
            hw_output_channels: hw_out,
            input_channels: input_descs.len() as u32,
            output_channels: output_descs.len() as u32,
            sample_rate,
            post_output,
            input_latency,
            output_latency,
        },
        inputs: input_descs,
        outputs: output_descs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BlockSizeRange, HwChannelInfo, OutputReady, RtHandler};
    use crate::error::DriverFault;

    struct ProbePort {
        hw_in: u32,
        hw_out: u32,
        range: BlockSizeRange,
        rate: f64,
        accept_set_rate: bool,
        fail_rate_reread: bool,
        fail_channel_info_at: Option<u32>,
        set_rate_calls: usize,
        disposed: bool,
    }

    impl ProbePort {
        fn new() -> Self {
            Self {
                hw_in: 64,
                hw_out: 64,
                range: BlockSizeRange {
                    min: 32,
                    max: 4096,
                    preferred: 512,
                    granularity: -1,
                },
                rate: 48_000.0,
                accept_set_rate: true,
                fail_rate_reread: false,
                fail_channel_info_at: None,
                set_rate_calls: 0,
                disposed: false,
            }
        }
    }

    impl DriverPort for ProbePort {
        fn name(&self) -> &str {
            "probe"
        }
        fn init(&mut self) -> Result<String, DriverFault> {
            Ok("probe".to_string())
        }
        fn channel_counts(&self) -> Result<(u32, u32), DriverFault> {
            Ok((self.hw_in, self.hw_out))
        }
        fn block_size_range(&self) -> Result<BlockSizeRange, DriverFault> {
            Ok(self.range)
        }
        fn sample_rate(&self) -> Result<f64, DriverFault> {
            if self.fail_rate_reread && self.set_rate_calls > 0 {
                return Err(DriverFault::new("rate read failed"));
            }
            Ok(self.rate)
        }
        fn set_sample_rate(&mut self, rate: f64) -> Result<(), DriverFault> {
            self.set_rate_calls += 1;
            if !self.accept_set_rate {
                return Err(DriverFault::new("rate rejected"));
            }
            self.rate = rate;
            Ok(())
        }
        fn output_ready(&self) -> Option<std::sync::Arc<dyn OutputReady>> {
            None
        }
        fn create_buffers(
            &mut self,
            requests: &[ChannelRequest],
            block_size: u32,
        ) -> Result<Vec<HwBufferPair>, DriverFault> {
            Ok(requests
                .iter()
                .map(|_| HwBufferPair::new(block_size as usize * 4))
                .collect())
        }
        fn channel_info(&self, index: u32, input: bool) -> Result<HwChannelInfo, DriverFault> {
            if self.fail_channel_info_at == Some(index) && !input {
                return Err(DriverFault::new("channel gone"));
            }
            Ok(HwChannelInfo {
                name: format!("ch {index}"),
                encoding: SampleEncoding::Int32Lsb,
                clock_group: 0,
            })
        }
        fn latencies(&self) -> Result<(u32, u32), DriverFault> {
            Ok((128, 256))
        }
        fn start(&mut self, _handler: std::sync::Arc<dyn RtHandler>) -> Result<(), DriverFault> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), DriverFault> {
            Ok(())
        }
        fn dispose_buffers(&mut self) -> Result<(), DriverFault> {
            self.disposed = true;
            Ok(())
        }
        fn deinit(&mut self) {}
    }

    fn config(inputs: Vec<u32>, outputs: Vec<u32>) -> SessionConfig {
        SessionConfig {
            driver_name: "probe".to_string(),
            sample_rate: 48_000,
            bits_per_sample: 32,
            samples_per_block: 256,
            endianness: "little".to_string(),
            input_channels: inputs,
            output_channels: outputs,
        }
    }

    #[test]
    fn oversized_channel_lists_clamp_to_cap() {
        let mut port = ProbePort::new();
        let cfg = config((0..40).collect(), (0..40).collect());
        let negotiated = negotiate(&mut port, &cfg).expect("negotiation must succeed");
        assert_eq!(negotiated.inputs.len(), MAX_INPUT_CHANNELS);
        assert_eq!(negotiated.outputs.len(), MAX_OUTPUT_CHANNELS);
        // The kept prefix preserves the requested order.
        assert_eq!(negotiated.inputs[31].hw_index, 31);
    }

    #[test]
    fn channel_lists_clamp_to_hardware_count() {
        let mut port = ProbePort::new();
        port.hw_in = 2;
        let cfg = config(vec![0, 1, 2, 3], vec![0]);
        let negotiated = negotiate(&mut port, &cfg).unwrap();
        assert_eq!(negotiated.inputs.len(), 2);
    }

    #[test]
    fn out_of_range_block_size_is_rejected() {
        let mut port = ProbePort::new();
        let mut cfg = config(vec![0], vec![0]);
        cfg.samples_per_block = 8192;
        match negotiate(&mut port, &cfg) {
            Err(BridgeError::BufferSizeQuery(_)) => {}
            other => panic!("expected BufferSizeQuery, got {other:?}"),
        }

        // Power-of-two granularity rejects odd sizes inside the range too.
        cfg.samples_per_block = 300;
        assert!(matches!(
            negotiate(&mut port, &cfg),
            Err(BridgeError::BufferSizeQuery(_))
        ));
    }

    #[test]
    fn in_range_rate_skips_explicit_set() {
        let mut port = ProbePort::new();
        let cfg = config(vec![0], vec![0]);
        let negotiated = negotiate(&mut port, &cfg).unwrap();
        assert_eq!(port.set_rate_calls, 0);
        assert_eq!(negotiated.capability.sample_rate, 48_000.0);
    }

    #[test]
    fn bogus_rate_is_set_and_reread() {
        let mut port = ProbePort::new();
        port.rate = 0.0;
        let cfg = config(vec![0], vec![0]);
        let negotiated = negotiate(&mut port, &cfg).unwrap();
        assert_eq!(port.set_rate_calls, 1);
        assert_eq!(negotiated.capability.sample_rate, 48_000.0);
    }

    #[test]
    fn failed_rate_reread_is_a_sample_rate_error() {
        let mut port = ProbePort::new();
        port.rate = 192_000.0;
        port.fail_rate_reread = true;
        let cfg = config(vec![0], vec![0]);
        match negotiate(&mut port, &cfg) {
            Err(BridgeError::SampleRate(_)) => {}
            other => panic!("expected SampleRate, got {other:?}"),
        }
    }

    #[test]
    fn rejected_rate_set_is_a_sample_rate_error() {
        let mut port = ProbePort::new();
        port.rate = -1.0;
        port.accept_set_rate = false;
        let cfg = config(vec![0], vec![0]);
        assert!(matches!(
            negotiate(&mut port, &cfg),
            Err(BridgeError::SampleRate(_))
        ));
    }

    #[test]
    fn partial_channel_info_failure_unwinds_buffers() {
        let mut port = ProbePort::new();
        port.fail_channel_info_at = Some(1);
        let cfg = config(vec![0, 1], vec![0, 1]);
        match negotiate(&mut port, &cfg) {
            Err(BridgeError::BufferCreation(_)) => {}
            other => panic!("expected BufferCreation, got {other:?}"),
        }
        assert!(port.disposed, "buffers must be disposed on partial failure");
    }
}
