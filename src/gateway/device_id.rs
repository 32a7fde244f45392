use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::Serialize;

/// The application-layer identity of a tracker: its 15-digit IMEI. The
///  transport-layer identity (the remote UDP endpoint) changes whenever the
///  device's NAT binding moves, so all durable state is keyed by this.
///
/// Parsing enforces length, decimal digits and the Luhn mod-10 check digit,
///  so a held [DeviceId] is always well-formed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<DeviceId, Self::Err> {
        if s.len() != 15 {
            return Err(anyhow!("IMEI must be 15 digits, got {} characters", s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(anyhow!("IMEI contains non-digit characters: {:?}", s));
        }
        if luhn_checksum(s) % 10 != 0 {
            return Err(anyhow!("IMEI fails the Luhn check: {}", s));
        }

        Ok(DeviceId(s.to_string()))
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Luhn mod-10 sum: starting from the rightmost digit, every second digit is
///  doubled and 9 is subtracted when the doubling carries.
fn luhn_checksum(digits: &str) -> u32 {
    digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum()
}
