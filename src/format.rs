use byteorder::{ByteOrder, LittleEndian};

/// Hardware sample encodings this bridge understands.
///
/// The raw codes are the driver ABI's sample type identifiers. 24 bit
/// covers 20 bit converters as well; the driver reports them as 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Int16Lsb,
    Int24Lsb,
    Int32Lsb,
}

impl SampleEncoding {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            16 => Some(SampleEncoding::Int16Lsb),
            17 => Some(SampleEncoding::Int24Lsb),
            18 => Some(SampleEncoding::Int32Lsb),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            SampleEncoding::Int16Lsb => 16,
            SampleEncoding::Int24Lsb => 17,
            SampleEncoding::Int32Lsb => 18,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Int16Lsb => 2,
            SampleEncoding::Int24Lsb => 3,
            SampleEncoding::Int32Lsb => 4,
        }
    }

    /// Byte length of one audio block in this encoding.
    pub fn block_bytes(self, block_size: usize) -> usize {
        block_size * self.bytes_per_sample()
    }
}

/// Decode one sample to its sign extended integer value.
pub fn decode_sample(encoding: SampleEncoding, bytes: &[u8]) -> i32 {
    match encoding {
        SampleEncoding::Int16Lsb => LittleEndian::read_i16(bytes) as i32,
        SampleEncoding::Int24Lsb => LittleEndian::read_i24(bytes),
        SampleEncoding::Int32Lsb => LittleEndian::read_i32(bytes),
    }
}

/// Encode one sample; values outside the encoding's range are truncated to
/// its low bytes, matching what the hardware would latch.
pub fn encode_sample(encoding: SampleEncoding, value: i32, out: &mut [u8]) {
    match encoding {
        SampleEncoding::Int16Lsb => LittleEndian::write_i16(out, value as i16),
        SampleEncoding::Int24Lsb => LittleEndian::write_i24(out, (value << 8) >> 8),
        SampleEncoding::Int32Lsb => LittleEndian::write_i32(out, value),
    }
}

/// Copy one block from a hardware slot into a host visible byte buffer.
///
/// `host` must be exactly `encoding.block_bytes(block_size)` long; the slot
/// may be larger than one block.
pub fn slot_to_host(encoding: SampleEncoding, block_size: usize, slot: &[u8], host: &mut [u8]) {
    let len = encoding.block_bytes(block_size);
    host[..len].copy_from_slice(&slot[..len]);
}

/// Copy host bytes back into a hardware slot. Length validation happens at
/// the call site; this copies exactly one block.
pub fn host_to_slot(encoding: SampleEncoding, block_size: usize, host: &[u8], slot: &mut [u8]) {
    let len = encoding.block_bytes(block_size);
    slot[..len].copy_from_slice(&host[..len]);
}

/// Zero one block in a hardware slot. All supported encodings are signed
/// PCM, so zero bytes are silence.
pub fn silence_slot(encoding: SampleEncoding, block_size: usize, slot: &mut [u8]) {
    let len = encoding.block_bytes(block_size);
    slot[..len].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_round_trip() {
        for enc in [
            SampleEncoding::Int16Lsb,
            SampleEncoding::Int24Lsb,
            SampleEncoding::Int32Lsb,
        ] {
            assert_eq!(SampleEncoding::from_raw(enc.raw()), Some(enc));
        }
        assert_eq!(SampleEncoding::from_raw(19), None);
    }

    #[test]
    fn sample_values_survive_encode_decode() {
        let mut buf = [0_u8; 4];

        encode_sample(SampleEncoding::Int16Lsb, -12345, &mut buf[..2]);
        assert_eq!(decode_sample(SampleEncoding::Int16Lsb, &buf[..2]), -12345);

        // 24 bit must sign extend through the top byte.
        encode_sample(SampleEncoding::Int24Lsb, -(1 << 22), &mut buf[..3]);
        assert_eq!(
            decode_sample(SampleEncoding::Int24Lsb, &buf[..3]),
            -(1 << 22)
        );

        encode_sample(SampleEncoding::Int32Lsb, i32::MIN + 7, &mut buf);
        assert_eq!(decode_sample(SampleEncoding::Int32Lsb, &buf), i32::MIN + 7);
    }

    #[test]
    fn slot_round_trip_is_identity() {
        let block = 64;
        for enc in [
            SampleEncoding::Int16Lsb,
            SampleEncoding::Int24Lsb,
            SampleEncoding::Int32Lsb,
        ] {
            let len = enc.block_bytes(block);
            let slot: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let mut host = vec![0_u8; len];
            slot_to_host(enc, block, &slot, &mut host);
            assert_eq!(host, slot);

            let mut back = vec![0_u8; len];
            host_to_slot(enc, block, &host, &mut back);
            assert_eq!(back, slot);
        }
    }

    #[test]
    fn silence_is_zero_bytes() {
        let mut slot = vec![0xab_u8; SampleEncoding::Int16Lsb.block_bytes(32)];
        silence_slot(SampleEncoding::Int16Lsb, 32, &mut slot);
        assert!(slot.iter().all(|&b| b == 0));
    }
}
