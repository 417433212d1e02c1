//! Synthetic device identity
//!
//! Each login attempt presents itself as a fresh device: a random serial and
//! an OAuth client id derived from it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device type of the provider's iOS app; also the suffix of the client id
pub const DEVICE_TYPE: &str = "A2CZJZGLK2JJVM";

/// Generate a new device serial: 32 uppercase hex characters
pub fn new_serial() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// Derive the OAuth client id for a serial
///
/// Hex encoding of `serial || "#" || DEVICE_TYPE`.
pub fn client_id(serial: &str) -> String {
    let mut raw = Vec::with_capacity(serial.len() + DEVICE_TYPE.len() + 1);
    raw.extend_from_slice(serial.as_bytes());
    raw.push(b'#');
    raw.extend_from_slice(DEVICE_TYPE.as_bytes());
    hex::encode(raw)
}

/// Serial and derived client id of one synthetic device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub client_id: String,
}

impl DeviceIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_serial(new_serial())
    }

    /// Rebuild an identity from a known serial
    pub fn from_serial(serial: impl Into<String>) -> Self {
        let serial = serial.into();
        let client_id = client_id(&serial);
        Self { serial, client_id }
    }
}
