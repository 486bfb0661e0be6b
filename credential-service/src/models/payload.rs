//! Structured content sealed inside a QR token.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PAYLOAD_VERSION: u8 = 1;

/// Which personal data the printed credential carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonalDataFlags {
    #[serde(rename = "n")]
    pub name: bool,
    #[serde(rename = "c")]
    pub company: bool,
    #[serde(rename = "p")]
    pub photo: bool,
}

/// Decoded QR payload.
///
/// Field names are the short wire names so the token stays small enough for
/// a dense QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    /// Credential id.
    pub id: Uuid,
    /// Credential code.
    pub cred: String,
    /// Event id.
    pub evt: Uuid,
    /// Explicit expiry, unix seconds.
    pub exp: Option<i64>,
    /// Issued at, unix seconds.
    pub ts: i64,
    /// Format version.
    pub v: u8,
    pub pd: Option<PersonalDataFlags>,
}
