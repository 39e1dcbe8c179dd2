use crate::dispatch::{DispatchQueue, QueueMessage, WorkItem};
use crate::error::BridgeError;
use crate::format;
use crate::negotiate::ChannelDescriptor;
use crate::session::SessionEvent;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// The per-block processing function a host registers. It receives one byte
/// buffer per negotiated input channel, each `block_size * bytes_per_sample`
/// long, and must return one buffer of the same length per negotiated
/// output channel, in channel order.
pub type UserCallback = Box<dyn FnMut(&[Vec<u8>]) -> Result<Vec<Vec<u8>>, String> + Send + 'static>;

/// Host side of the bridge: a single thread draining the dispatch queue in
/// submission order. All user visible code runs here, never on the
/// driver's realtime thread.
pub(crate) struct HostWorker {
    rx: Receiver<QueueMessage>,
    queue: Arc<DispatchQueue>,
    inputs: Vec<ChannelDescriptor>,
    outputs: Vec<ChannelDescriptor>,
    block_size: usize,
    callback: UserCallback,
    events: Sender<SessionEvent>,
}

impl HostWorker {
    pub(crate) fn new(
        rx: Receiver<QueueMessage>,
        queue: Arc<DispatchQueue>,
        inputs: Vec<ChannelDescriptor>,
        outputs: Vec<ChannelDescriptor>,
        block_size: usize,
        callback: UserCallback,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            rx,
            queue,
            inputs,
            outputs,
            block_size,
            callback,
            events,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("bridge-host".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn bridge-host thread")
    }

    fn run(mut self) {
        let mut host_inputs: Vec<Vec<u8>> = self
            .inputs
            .iter()
            .map(|desc| vec![0_u8; desc.encoding.block_bytes(self.block_size)])
            .collect();
        loop {
            match self.rx.recv() {
                Ok(QueueMessage::Block(item)) => self.process(item, &mut host_inputs),
                Ok(QueueMessage::Quiesce(ack)) => {
                    let _ = ack.send(());
                    return;
                }
                Err(_) => return,
            }
        }
    }

    fn process(&mut self, item: WorkItem, host_inputs: &mut [Vec<u8>]) {
        let slot = item.slot & 1;
        if !self.queue.accepting() {
            // Stopped while this block was in flight; it must not reach the
            // user callback anymore.
            debug!("discarding block at position {}", item.sample_position);
            self.queue.complete(slot);
            return;
        }

        for (desc, host) in self.inputs.iter().zip(host_inputs.iter_mut()) {
            format::slot_to_host(
                desc.encoding,
                self.block_size,
                desc.slots[slot].bytes(),
                host,
            );
        }

        let result = {
            let callback = &mut self.callback;
            let inputs: &[Vec<u8>] = host_inputs;
            catch_unwind(AssertUnwindSafe(move || callback(inputs)))
        };

        match result {
            Ok(Ok(returned)) => self.write_outputs(slot, &returned),
            Ok(Err(detail)) => self.fail_block(slot, detail),
            Err(payload) => self.fail_block(slot, panic_detail(payload)),
        }

        self.queue.complete(slot);
    }

    /// Copy returned buffers into the hardware slot. A buffer whose length
    /// does not match the channel's block is reported and its slot left
    /// untouched; the rest of the block still goes out.
    fn write_outputs(&self, slot: usize, returned: &[Vec<u8>]) {
        for (channel, desc) in self.outputs.iter().enumerate() {
            let expected = desc.encoding.block_bytes(self.block_size);
            match returned.get(channel) {
                Some(bytes) if bytes.len() == expected => {
                    format::host_to_slot(
                        desc.encoding,
                        self.block_size,
                        bytes,
                        desc.slots[slot].bytes(),
                    );
                }
                Some(bytes) => {
                    let err = BridgeError::FormatMismatch {
                        channel: desc.hw_index,
                        expected,
                        got: bytes.len(),
                    };
                    error!("{}", err);
                    let _ = self.events.send(SessionEvent::FormatMismatch {
                        channel: desc.hw_index,
                        expected,
                        got: bytes.len(),
                    });
                }
                None => {
                    error!(
                        "user callback returned {} output buffers, expected {}",
                        returned.len(),
                        self.outputs.len()
                    );
                    let _ = self.events.send(SessionEvent::FormatMismatch {
                        channel: desc.hw_index,
                        expected,
                        got: 0,
                    });
                }
            }
        }
    }

    /// A failed user callback silences the block instead of tearing the
    /// session down; one bad block must not break the realtime contract.
    fn fail_block(&self, slot: usize, detail: String) {
        error!("user callback failed, emitting silence: {}", detail);
        for desc in &self.outputs {
            format::silence_slot(desc.encoding, self.block_size, desc.slots[slot].bytes());
        }
        let _ = self
            .events
            .send(SessionEvent::UserCallbackFailure { slot, detail });
    }
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "user callback panicked".to_string()
    }
}
