//! P2P Service Discovery
//!
//! Handles:
//! - RFC 1035 name expansion for Bonjour matching
//! - Query/response TLV framing
//! - The local service registry that answers peer queries

pub mod dns;
pub mod registry;
pub mod tlv;

pub use dns::{bonjour_query, decompress_dns_label, encode_dns_name, match_bonjour_query};
pub use registry::{ServiceRegistry, SdResponse};
pub use tlv::{
    gas_initial_response, parse_request_tlvs, parse_response_tlvs, SdQuery, SdRequestItem,
    SdResponseTlv,
};

use serde::{Deserialize, Serialize};

/// Service protocol type carried in every SD TLV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SdProtocol {
    All = 0,
    Bonjour = 1,
    Upnp = 2,
    WsDiscovery = 3,
    WifiDisplay = 4,
    VendorSpecific = 255,
}

impl SdProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SdProtocol::All),
            1 => Some(SdProtocol::Bonjour),
            2 => Some(SdProtocol::Upnp),
            3 => Some(SdProtocol::WsDiscovery),
            4 => Some(SdProtocol::WifiDisplay),
            255 => Some(SdProtocol::VendorSpecific),
            _ => None,
        }
    }
}

/// Status code of an SD response TLV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SdStatus {
    Success = 0,
    ProtocolNotAvailable = 1,
    RequestedInfoNotAvailable = 2,
    BadRequest = 3,
}
