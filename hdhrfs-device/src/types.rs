//! Tuner addressing.

use std::fmt;
use std::str::FromStr;

use crate::error::DeviceError;

/// Identity of one tuner on one device: the device id (or IP address) plus
/// the tuner index on that device.
///
/// The textual form is the one the scan utility writes into the config file:
/// `192.168.1.133:1` or `1040A1B2:0`. A missing index selects tuner 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerAddress {
    /// Device id or IP address, passed verbatim to the control tool.
    pub device: String,
    /// Tuner index on the device.
    pub tuner: u32,
}

impl TunerAddress {
    /// Create an address from a device id and tuner index.
    pub fn new(device: impl Into<String>, tuner: u32) -> Self {
        Self {
            device: device.into(),
            tuner,
        }
    }

    /// The `/tunerN` item prefix used by the control tool.
    pub fn tuner_path(&self) -> String {
        format!("/tuner{}", self.tuner)
    }
}

impl FromStr for TunerAddress {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DeviceError::BadAddress(s.to_string()));
        }
        match s.rsplit_once(':') {
            Some((device, index)) => {
                let tuner = index
                    .parse::<u32>()
                    .map_err(|_| DeviceError::BadAddress(s.to_string()))?;
                if device.is_empty() {
                    return Err(DeviceError::BadAddress(s.to_string()));
                }
                Ok(Self::new(device, tuner))
            }
            None => Ok(Self::new(s, 0)),
        }
    }
}

impl fmt::Display for TunerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.tuner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_and_index() {
        let addr: TunerAddress = "192.168.1.133:1".parse().unwrap();
        assert_eq!(addr.device, "192.168.1.133");
        assert_eq!(addr.tuner, 1);
        assert_eq!(addr.tuner_path(), "/tuner1");
    }

    #[test]
    fn test_parse_device_id_without_index() {
        let addr: TunerAddress = "1040A1B2".parse().unwrap();
        assert_eq!(addr.device, "1040A1B2");
        assert_eq!(addr.tuner, 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<TunerAddress>().is_err());
        assert!(":3".parse::<TunerAddress>().is_err());
        assert!("1040A1B2:x".parse::<TunerAddress>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let addr = TunerAddress::new("10.0.0.5", 2);
        let again: TunerAddress = addr.to_string().parse().unwrap();
        assert_eq!(addr, again);
    }
}
