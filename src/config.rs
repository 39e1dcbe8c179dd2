use crate::error::BridgeError;
use serde::Deserialize;

fn default_bits() -> u32 {
    32
}

fn default_endianness() -> String {
    "little".to_string()
}

/// Session configuration as hosts submit it. Field names follow the wire
/// form (camelCase JSON), so a config object from an embedding runtime
/// deserializes directly.
///
/// `bits_per_sample` and `endianness` are informational: the encoding the
/// driver reports per channel after buffer creation is authoritative.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub driver_name: String,
    pub sample_rate: u32,
    #[serde(default = "default_bits")]
    pub bits_per_sample: u32,
    pub samples_per_block: u32,
    #[serde(default = "default_endianness")]
    pub endianness: String,
    #[serde(default)]
    pub input_channels: Vec<u32>,
    #[serde(default)]
    pub output_channels: Vec<u32>,
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Upfront validation, before any driver is touched. Failures map onto
    /// the stage that would have rejected the value.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.driver_name.is_empty() {
            return Err(BridgeError::DriverLoad("driver name is empty".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(BridgeError::SampleRate(
                "requested sample rate must be positive".to_string(),
            ));
        }
        if self.samples_per_block == 0 {
            return Err(BridgeError::BufferSizeQuery(
                "requested block size must be positive".to_string(),
            ));
        }
        if self.input_channels.is_empty() && self.output_channels.is_empty() {
            return Err(BridgeError::ChannelQuery(
                "no input or output channels requested".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_form_json() {
        let cfg = SessionConfig::from_json(
            r#"{
                "driverName": "loopback",
                "sampleRate": 48000,
                "bitsPerSample": 16,
                "samplesPerBlock": 256,
                "endianness": "little",
                "inputChannels": [0, 1],
                "outputChannels": [0, 1]
            }"#,
        )
        .expect("valid config must parse");
        assert_eq!(cfg.driver_name, "loopback");
        assert_eq!(cfg.sample_rate, 48000);
        assert_eq!(cfg.samples_per_block, 256);
        assert_eq!(cfg.input_channels, vec![0, 1]);
        cfg.validate().expect("config must validate");
    }

    #[test]
    fn optional_fields_default() {
        let cfg = SessionConfig::from_json(
            r#"{"driverName": "loopback", "sampleRate": 44100, "samplesPerBlock": 512,
                "outputChannels": [0]}"#,
        )
        .unwrap();
        assert_eq!(cfg.bits_per_sample, 32);
        assert_eq!(cfg.endianness, "little");
        assert!(cfg.input_channels.is_empty());
        cfg.validate().expect("output-only config is valid");
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let mut cfg = SessionConfig {
            driver_name: "loopback".to_string(),
            sample_rate: 48000,
            bits_per_sample: 32,
            samples_per_block: 256,
            endianness: "little".to_string(),
            input_channels: vec![0],
            output_channels: vec![0],
        };

        cfg.driver_name.clear();
        assert!(matches!(cfg.validate(), Err(BridgeError::DriverLoad(_))));
        cfg.driver_name = "loopback".to_string();

        cfg.sample_rate = 0;
        assert!(matches!(cfg.validate(), Err(BridgeError::SampleRate(_))));
        cfg.sample_rate = 48000;

        cfg.samples_per_block = 0;
        assert!(matches!(
            cfg.validate(),
            Err(BridgeError::BufferSizeQuery(_))
        ));
        cfg.samples_per_block = 256;

        cfg.input_channels.clear();
        cfg.output_channels.clear();
        assert!(matches!(cfg.validate(), Err(BridgeError::ChannelQuery(_))));
    }
}
