//! Service discovery TLV framing
//!
//! Query TLV:    `len (LE16) | protocol | transaction id | query data`
//! Response TLV: `len (LE16) | protocol | transaction id | status | data`
//!
//! `len` covers everything after the length field.

use tracing::debug;

use super::{SdProtocol, SdStatus};
use crate::error::SdDecodeError;

/// One parsed query TLV, borrowing its data from the request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdQuery<'a> {
    pub protocol: u8,
    pub trans_id: u8,
    pub data: &'a [u8],
}

/// Item produced while walking a request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdRequestItem<'a> {
    Query(SdQuery<'a>),
    /// Header readable but the length overruns the frame
    Truncated { protocol: u8, trans_id: u8 },
}

/// Split a request frame into query TLVs.
///
/// A TLV shorter than its own header is skipped. A TLV whose length
/// overruns the frame ends the walk; its header is still reported when
/// readable so the responder can answer it.
pub fn parse_request_tlvs(tlvs: &[u8]) -> Vec<SdRequestItem<'_>> {
    let mut items = Vec::new();
    let mut pos = 0;

    while pos + 1 < tlvs.len() {
        let slen = usize::from(u16::from_le_bytes([tlvs[pos], tlvs[pos + 1]]));
        pos += 2;
        let remaining = tlvs.len() - pos;

        if slen > remaining {
            debug!(slen, remaining, "SD request TLV overruns frame");
            if remaining >= 2 {
                items.push(SdRequestItem::Truncated {
                    protocol: tlvs[pos],
                    trans_id: tlvs[pos + 1],
                });
            }
            break;
        }
        if slen < 2 {
            debug!(slen, "SD request TLV too short for header");
            pos += slen;
            continue;
        }

        items.push(SdRequestItem::Query(SdQuery {
            protocol: tlvs[pos],
            trans_id: tlvs[pos + 1],
            data: &tlvs[pos + 2..pos + slen],
        }));
        pos += slen;
    }

    items
}

/// One parsed response TLV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdResponseTlv {
    pub protocol: u8,
    pub trans_id: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

/// Parse a response frame; any bad length rejects the frame
pub fn parse_response_tlvs(tlvs: &[u8]) -> Result<Vec<SdResponseTlv>, SdDecodeError> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < tlvs.len() {
        if pos + 2 > tlvs.len() {
            return Err(SdDecodeError::Malformed);
        }
        let slen = usize::from(u16::from_le_bytes([tlvs[pos], tlvs[pos + 1]]));
        pos += 2;
        if pos + slen > tlvs.len() || slen < 3 {
            return Err(SdDecodeError::Malformed);
        }
        out.push(SdResponseTlv {
            protocol: tlvs[pos],
            trans_id: tlvs[pos + 1],
            status: tlvs[pos + 2],
            data: tlvs[pos + 3..pos + slen].to_vec(),
        });
        pos += slen;
    }

    Ok(out)
}

/// Appends response TLVs up to a total frame size limit
#[derive(Debug, Clone)]
pub struct SdResponseBuilder {
    buf: Vec<u8>,
    max_len: usize,
}

impl SdResponseBuilder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    fn tailroom(&self) -> usize {
        self.max_len.saturating_sub(self.buf.len())
    }

    /// Append one TLV whose data is the concatenation of `parts`.
    /// Returns `false` without writing anything when it would not fit.
    pub fn push(&mut self, protocol: u8, trans_id: u8, status: SdStatus, parts: &[&[u8]]) -> bool {
        let data_len: usize = parts.iter().map(|p| p.len()).sum();
        let body_len = 3 + data_len;
        if body_len > usize::from(u16::MAX) || self.tailroom() < 2 + body_len {
            return false;
        }
        self.buf.extend_from_slice(&(body_len as u16).to_le_bytes());
        self.buf.push(protocol);
        self.buf.push(trans_id);
        self.buf.push(status as u8);
        for part in parts {
            self.buf.extend_from_slice(part);
        }
        true
    }

    pub fn push_status(&mut self, protocol: u8, trans_id: u8, status: SdStatus) -> bool {
        self.push(protocol, trans_id, status, &[])
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn push_query_tlv(out: &mut Vec<u8>, protocol: u8, trans_id: u8, data: &[u8]) {
    out.extend_from_slice(&((2 + data.len()) as u16).to_le_bytes());
    out.push(protocol);
    out.push(trans_id);
    out.extend_from_slice(data);
}

/// Query TLV for one protocol with raw query data
pub fn query_tlv(protocol: SdProtocol, trans_id: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    push_query_tlv(&mut out, protocol as u8, trans_id, data);
    out
}

/// UPnP query TLV: version byte followed by the search target
pub fn upnp_query_tlv(version: u8, search_target: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + search_target.len());
    data.push(version);
    data.extend_from_slice(search_target.as_bytes());
    query_tlv(SdProtocol::Upnp, 1, &data)
}

/// Wi-Fi Display device roles usable in a WFD query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WfdRole {
    Source = 0x00,
    PrimarySink = 0x01,
    SecondarySink = 0x02,
    SourceAndSink = 0x03,
}

/// Most subelement ids one WFD query TLV may carry
pub const MAX_WFD_SD_SUBELEMS: usize = 20;

/// One WFD query TLV per requested role, transaction ids numbered from 1
pub fn wfd_query_tlvs(roles: &[WfdRole], subelems: &[u8]) -> Vec<u8> {
    let ids = &subelems[..subelems.len().min(MAX_WFD_SD_SUBELEMS)];
    let mut out = Vec::new();
    for (idx, role) in roles.iter().enumerate() {
        let mut data = Vec::with_capacity(1 + ids.len());
        data.push(*role as u8);
        data.extend_from_slice(ids);
        push_query_tlv(&mut out, SdProtocol::WifiDisplay as u8, (idx + 1) as u8, &data);
    }
    out
}

const WLAN_ACTION_PUBLIC: u8 = 4;
const WLAN_PA_GAS_INITIAL_RESP: u8 = 11;
const WLAN_EID_ADV_PROTO: u8 = 108;
const ACCESS_NETWORK_QUERY_PROTOCOL: u8 = 0;
const ANQP_VENDOR_SPECIFIC: u16 = 0xdddd;
/// WFA OUI followed by the P2P OUI type
const P2P_VENDOR_TYPE: [u8; 4] = [0x50, 0x6f, 0x9a, 0x09];

/// Public Action GAS Initial Response body carrying SD response TLVs
pub fn gas_initial_response(dialog_token: u8, update_indic: u16, tlvs: &[u8]) -> Vec<u8> {
    let element_len = P2P_VENDOR_TYPE.len() + 2 + tlvs.len();
    let query_len = 4 + element_len;
    let mut out = Vec::with_capacity(11 + query_len);
    out.push(WLAN_ACTION_PUBLIC);
    out.push(WLAN_PA_GAS_INITIAL_RESP);
    out.push(dialog_token);
    out.extend_from_slice(&0u16.to_le_bytes()); // status
    out.extend_from_slice(&0u16.to_le_bytes()); // comeback delay
    out.extend_from_slice(&[WLAN_EID_ADV_PROTO, 2, 0x00, ACCESS_NETWORK_QUERY_PROTOCOL]);
    out.extend_from_slice(&(query_len as u16).to_le_bytes());
    out.extend_from_slice(&ANQP_VENDOR_SPECIFIC.to_le_bytes());
    out.extend_from_slice(&(element_len as u16).to_le_bytes());
    out.extend_from_slice(&P2P_VENDOR_TYPE);
    out.extend_from_slice(&update_indic.to_le_bytes());
    out.extend_from_slice(tlvs);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_initial_response_layout() {
        let tlvs = [0x03, 0x00, 0x01, 0x07, 0x02];
        let frame = gas_initial_response(9, 0x0102, &tlvs);
        assert_eq!(&frame[..3], &[4, 11, 9]);
        assert_eq!(&frame[7..11], &[108, 2, 0, 0]);
        let query_len = u16::from_le_bytes([frame[11], frame[12]]) as usize;
        assert_eq!(query_len, frame.len() - 13);
        assert_eq!(&frame[13..15], &[0xdd, 0xdd]);
        assert_eq!(&frame[17..21], &P2P_VENDOR_TYPE);
        assert_eq!(&frame[21..23], &[0x02, 0x01]);
        assert_eq!(&frame[23..], &tlvs);
    }

    #[test]
    fn test_parse_two_queries() {
        let mut frame = query_tlv(SdProtocol::Bonjour, 7, b"abc");
        frame.extend(upnp_query_tlv(0x10, "ssdp:all"));
        let items = parse_request_tlvs(&frame);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            SdRequestItem::Query(SdQuery { protocol: 1, trans_id: 7, data: b"abc" })
        );
        match items[1] {
            SdRequestItem::Query(q) => {
                assert_eq!(q.protocol, SdProtocol::Upnp as u8);
                assert_eq!(q.data[0], 0x10);
                assert_eq!(&q.data[1..], b"ssdp:all");
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_overrunning_tlv_reports_header_and_stops() {
        let mut frame = query_tlv(SdProtocol::Bonjour, 1, b"");
        frame.extend_from_slice(&[0x20, 0x00, 0x02, 0x09, 0xaa]);
        let items = parse_request_tlvs(&frame);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], SdRequestItem::Truncated { protocol: 2, trans_id: 9 });
    }

    #[test]
    fn test_short_tlv_skipped() {
        let mut frame = vec![0x01, 0x00, 0xff];
        frame.extend(query_tlv(SdProtocol::All, 3, b""));
        let items = parse_request_tlvs(&frame);
        assert_eq!(
            items,
            vec![SdRequestItem::Query(SdQuery { protocol: 0, trans_id: 3, data: b"" })]
        );
    }

    #[test]
    fn test_response_builder_respects_size_limit() {
        let mut builder = SdResponseBuilder::new(12);
        assert!(builder.push(1, 1, SdStatus::Success, &[b"key", b"val"]));
        assert_eq!(builder.len(), 11);
        assert!(!builder.push_status(2, 1, SdStatus::ProtocolNotAvailable));
        let frame = builder.finish();
        let parsed = parse_response_tlvs(&frame).expect("valid");
        assert_eq!(parsed[0].data, b"keyval");
    }

    #[test]
    fn test_response_parse_rejects_bad_length() {
        assert_eq!(parse_response_tlvs(&[0x02, 0x00, 0x01, 0x01]), Err(SdDecodeError::Malformed));
        assert_eq!(parse_response_tlvs(&[0x09, 0x00, 0x01]), Err(SdDecodeError::Malformed));
        assert_eq!(parse_response_tlvs(&[0x03]), Err(SdDecodeError::Malformed));
    }

    #[test]
    fn test_wfd_query_per_role() {
        let frame = wfd_query_tlvs(&[WfdRole::Source, WfdRole::PrimarySink], &[0, 1, 6]);
        let items = parse_request_tlvs(&frame);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            SdRequestItem::Query(SdQuery { protocol: 4, trans_id: 2, data: &[0x01, 0, 1, 6] })
        );
    }
}
