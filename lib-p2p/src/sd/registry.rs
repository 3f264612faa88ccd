//! Local service registry and SD responder

use tracing::{debug, info};

use super::dns::match_bonjour_query;
use super::tlv::{parse_request_tlvs, SdQuery, SdRequestItem, SdResponseBuilder};
use super::{SdProtocol, SdStatus};

/// Highest WFD subelement id kept in the registry
pub const MAX_WFD_SUBELEMS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BonjourService {
    query: Vec<u8>,
    response: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UpnpService {
    version: u8,
    service: String,
}

/// Response frame built for one incoming SD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdResponse {
    /// Service update indicator at the time the response was built
    pub update_indic: u16,
    pub tlvs: Vec<u8>,
    /// Query TLVs that could not be decoded
    pub malformed: usize,
}

/// Services this device advertises over P2P service discovery
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    bonjour: Vec<BonjourService>,
    upnp: Vec<UpnpService>,
    wfd_subelems: [Option<Vec<u8>>; MAX_WFD_SUBELEMS],
    wifi_display: bool,
    update_indic: u16,
    max_response_len: usize,
}

impl ServiceRegistry {
    pub fn new(wifi_display: bool, max_response_len: usize) -> Self {
        debug!("Initializing SD service registry");
        Self {
            wifi_display,
            max_response_len,
            ..Self::default()
        }
    }

    /// Service update indicator, bumped on every registry change
    pub fn update_indicator(&self) -> u16 {
        self.update_indic
    }

    fn service_update(&mut self) {
        self.update_indic = self.update_indic.wrapping_add(1);
    }

    /// Register a Bonjour record; an existing record with the same key is replaced
    pub fn add_bonjour(&mut self, query: Vec<u8>, response: Vec<u8>) {
        self.bonjour.retain(|s| s.query != query);
        self.bonjour.insert(0, BonjourService { query, response });
        self.service_update();
    }

    pub fn del_bonjour(&mut self, query: &[u8]) -> bool {
        let before = self.bonjour.len();
        self.bonjour.retain(|s| s.query != query);
        let removed = self.bonjour.len() != before;
        if removed {
            self.service_update();
        }
        removed
    }

    pub fn add_upnp(&mut self, version: u8, service: &str) {
        if self
            .upnp
            .iter()
            .any(|s| s.version == version && s.service == service)
        {
            return;
        }
        self.upnp.insert(
            0,
            UpnpService {
                version,
                service: service.to_string(),
            },
        );
        self.service_update();
    }

    pub fn del_upnp(&mut self, version: u8, service: &str) -> bool {
        let before = self.upnp.len();
        self.upnp
            .retain(|s| !(s.version == version && s.service == service));
        let removed = self.upnp.len() != before;
        if removed {
            self.service_update();
        }
        removed
    }

    pub fn set_wfd_subelem(&mut self, id: u8, data: Option<Vec<u8>>) {
        if let Some(slot) = self.wfd_subelems.get_mut(usize::from(id)) {
            *slot = data;
        }
    }

    pub fn flush(&mut self) {
        self.bonjour.clear();
        self.upnp.clear();
        self.service_update();
    }

    /// Answer every query TLV in `tlvs`.
    ///
    /// Each query gets at least one response TLV unless the response size limit
    /// runs out; undecodable queries are answered with a not-available status.
    pub fn build_sd_response(&self, tlvs: &[u8]) -> SdResponse {
        let mut resp = SdResponseBuilder::new(self.max_response_len);
        let mut malformed = 0;

        for item in parse_request_tlvs(tlvs) {
            match item {
                SdRequestItem::Query(query) => self.answer(&mut resp, &query),
                SdRequestItem::Truncated { protocol, trans_id } => {
                    malformed += 1;
                    resp.push_status(protocol, trans_id, SdStatus::RequestedInfoNotAvailable);
                }
            }
        }

        SdResponse {
            update_indic: self.update_indic,
            tlvs: resp.finish(),
            malformed,
        }
    }

    fn answer(&self, resp: &mut SdResponseBuilder, query: &SdQuery<'_>) {
        debug!(
            protocol = query.protocol,
            trans_id = query.trans_id,
            len = query.data.len(),
            "SD query"
        );
        match SdProtocol::from_u8(query.protocol) {
            Some(SdProtocol::All) => {
                if self.bonjour.is_empty() && self.upnp.is_empty() {
                    resp.push_status(query.protocol, query.trans_id, SdStatus::ProtocolNotAvailable);
                    return;
                }
                self.all_bonjour(resp, query.trans_id);
                self.all_upnp(resp, query.trans_id);
            }
            Some(SdProtocol::Bonjour) => self.req_bonjour(resp, query.trans_id, query.data),
            Some(SdProtocol::Upnp) => self.req_upnp(resp, query.trans_id, query.data),
            Some(SdProtocol::WifiDisplay) if self.wifi_display => {
                self.req_wfd(resp, query.trans_id, query.data)
            }
            _ => {
                debug!(protocol = query.protocol, "Unavailable service protocol");
                resp.push_status(query.protocol, query.trans_id, SdStatus::ProtocolNotAvailable);
            }
        }
    }

    fn all_bonjour(&self, resp: &mut SdResponseBuilder, trans_id: u8) {
        for srv in &self.bonjour {
            if !resp.push(
                SdProtocol::Bonjour as u8,
                trans_id,
                SdStatus::Success,
                &[&srv.query, &srv.response],
            ) {
                return;
            }
        }
    }

    fn req_bonjour(&self, resp: &mut SdResponseBuilder, trans_id: u8, query: &[u8]) {
        let proto = SdProtocol::Bonjour as u8;
        if self.bonjour.is_empty() {
            resp.push_status(proto, trans_id, SdStatus::ProtocolNotAvailable);
            return;
        }
        if query.is_empty() {
            self.all_bonjour(resp, trans_id);
            return;
        }

        let mut matches = 0;
        for srv in self
            .bonjour
            .iter()
            .filter(|srv| match_bonjour_query(&srv.query, query))
        {
            if !resp.push(proto, trans_id, SdStatus::Success, &[query, &srv.response]) {
                return;
            }
            matches += 1;
        }

        if matches == 0 {
            debug!("Requested Bonjour service not available");
            resp.push_status(proto, trans_id, SdStatus::RequestedInfoNotAvailable);
        }
    }

    fn all_upnp(&self, resp: &mut SdResponseBuilder, trans_id: u8) {
        for srv in &self.upnp {
            if !resp.push(
                SdProtocol::Upnp as u8,
                trans_id,
                SdStatus::Success,
                &[&[srv.version], srv.service.as_bytes()],
            ) {
                return;
            }
        }
    }

    fn req_upnp(&self, resp: &mut SdResponseBuilder, trans_id: u8, query: &[u8]) {
        let proto = SdProtocol::Upnp as u8;
        if self.upnp.is_empty() {
            resp.push_status(proto, trans_id, SdStatus::ProtocolNotAvailable);
            return;
        }
        let Some((&version, target)) = query.split_first() else {
            self.all_upnp(resp, trans_id);
            return;
        };
        let target = String::from_utf8_lossy(target);

        let matching: Vec<&str> = self
            .upnp
            .iter()
            .filter(|srv| srv.version == version)
            .filter(|srv| target == "ssdp:all" || srv.service.contains(&*target))
            .map(|srv| srv.service.as_str())
            .collect();

        if matching.is_empty() {
            debug!("Requested UPnP service not available");
            resp.push_status(proto, trans_id, SdStatus::RequestedInfoNotAvailable);
            return;
        }

        let joined = matching.join(",");
        resp.push(proto, trans_id, SdStatus::Success, &[&[version], joined.as_bytes()]);
    }

    fn req_wfd(&self, resp: &mut SdResponseBuilder, trans_id: u8, query: &[u8]) {
        let Some((&role, ids)) = query.split_first() else {
            debug!("Missing WFD requested device role");
            resp.push_status(SdProtocol::WifiDisplay as u8, trans_id, SdStatus::BadRequest);
            return;
        };
        info!(role, "WFD service discovery request");

        let subelems: Vec<&[u8]> = ids
            .iter()
            .filter_map(|id| self.wfd_subelems.get(usize::from(*id)))
            .filter_map(|slot| slot.as_deref())
            .collect();
        resp.push(SdProtocol::WifiDisplay as u8, trans_id, SdStatus::Success, &subelems);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::dns::bonjour_query;
    use crate::sd::tlv::{parse_response_tlvs, query_tlv, upnp_query_tlv};

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(true, 1400)
    }

    #[test]
    fn test_unregistered_bonjour_is_not_available() {
        let mut reg = registry();
        reg.add_bonjour(
            bonjour_query("_ipp._tcp.local", 12, 1).expect("query"),
            b"\x09printer-1\xc0\x27".to_vec(),
        );
        let key = bonjour_query("_afpovertcp._tcp.local", 12, 1).expect("query");
        let request = query_tlv(SdProtocol::Bonjour, 42, &key);

        let response = reg.build_sd_response(&request);
        let tlvs = parse_response_tlvs(&response.tlvs).expect("valid response");
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].protocol, SdProtocol::Bonjour as u8);
        assert_eq!(tlvs[0].trans_id, 42);
        assert_eq!(tlvs[0].status, SdStatus::RequestedInfoNotAvailable as u8);
        assert!(tlvs[0].data.is_empty());
    }

    #[test]
    fn test_matching_bonjour_echoes_key_and_value() {
        let mut reg = registry();
        let key = bonjour_query("_ipp._tcp.local", 12, 1).expect("query");
        reg.add_bonjour(key.clone(), b"value".to_vec());
        let compressed = [0x04, b'_', b'i', b'p', b'p', 0xc0, 0x0c, 0x00, 0x0c, 0x01];

        let response = reg.build_sd_response(&query_tlv(SdProtocol::Bonjour, 1, &compressed));
        let tlvs = parse_response_tlvs(&response.tlvs).expect("valid response");
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].status, SdStatus::Success as u8);
        let mut expected = compressed.to_vec();
        expected.extend_from_slice(b"value");
        assert_eq!(tlvs[0].data, expected);
    }

    #[test]
    fn test_empty_registry_reports_protocol_not_available() {
        let reg = registry();
        let mut request = query_tlv(SdProtocol::All, 1, b"");
        request.extend(query_tlv(SdProtocol::Bonjour, 2, b""));
        request.extend(upnp_query_tlv(0x10, "ssdp:all"));
        request.extend(query_tlv(SdProtocol::WsDiscovery, 4, b"x"));

        let tlvs = parse_response_tlvs(&reg.build_sd_response(&request).tlvs).expect("valid");
        assert_eq!(tlvs.len(), 4);
        assert!(tlvs
            .iter()
            .all(|t| t.status == SdStatus::ProtocolNotAvailable as u8));
        assert_eq!(tlvs[3].protocol, SdProtocol::WsDiscovery as u8);
    }

    #[test]
    fn test_upnp_matches_join_with_commas() {
        let mut reg = registry();
        reg.add_upnp(0x10, "uuid:1::urn:schemas-upnp-org:service:ContentDirectory:2");
        reg.add_upnp(0x10, "uuid:1::urn:schemas-upnp-org:device:MediaServer:2");
        reg.add_upnp(0x20, "uuid:2::urn:other");

        let resp = reg.build_sd_response(&upnp_query_tlv(0x10, "ssdp:all"));
        let tlvs = parse_response_tlvs(&resp.tlvs).expect("valid");
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].data[0], 0x10);
        let body = String::from_utf8(tlvs[0].data[1..].to_vec()).expect("utf8");
        assert_eq!(body.split(',').count(), 2);

        let resp = reg.build_sd_response(&upnp_query_tlv(0x10, "Printer"));
        let tlvs = parse_response_tlvs(&resp.tlvs).expect("valid");
        assert_eq!(tlvs[0].status, SdStatus::RequestedInfoNotAvailable as u8);
    }

    #[test]
    fn test_truncated_query_answered_and_earlier_answers_kept() {
        let mut reg = registry();
        reg.add_upnp(0x10, "urn:a");
        let mut request = upnp_query_tlv(0x10, "ssdp:all");
        request.extend_from_slice(&[0x30, 0x00, 0x01, 0x05, 0x01]);

        let resp = reg.build_sd_response(&request);
        assert_eq!(resp.malformed, 1);
        let tlvs = parse_response_tlvs(&resp.tlvs).expect("valid");
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0].status, SdStatus::Success as u8);
        assert_eq!(tlvs[1].trans_id, 5);
        assert_eq!(tlvs[1].status, SdStatus::RequestedInfoNotAvailable as u8);
    }

    #[test]
    fn test_wfd_subelements() {
        let mut reg = registry();
        reg.set_wfd_subelem(0, Some(vec![0x00, 0x00, 0x06, 0x01, 0x11, 0x1c, 0x44, 0x00, 0x32]));
        let request = query_tlv(SdProtocol::WifiDisplay, 3, &[0x01, 0x00, 0x07]);
        let tlvs = parse_response_tlvs(&reg.build_sd_response(&request).tlvs).expect("valid");
        assert_eq!(tlvs[0].status, SdStatus::Success as u8);
        assert_eq!(tlvs[0].data.len(), 9);

        let disabled = ServiceRegistry::new(false, 1400);
        let tlvs = parse_response_tlvs(&disabled.build_sd_response(&request).tlvs).expect("valid");
        assert_eq!(tlvs[0].status, SdStatus::ProtocolNotAvailable as u8);
    }

    #[test]
    fn test_update_indicator_tracks_changes() {
        let mut reg = registry();
        let start = reg.update_indicator();
        reg.add_upnp(0x10, "urn:a");
        reg.add_upnp(0x10, "urn:a");
        assert_eq!(reg.update_indicator(), start + 1);
        assert!(reg.del_upnp(0x10, "urn:a"));
        assert!(!reg.del_upnp(0x10, "urn:a"));
        assert_eq!(reg.update_indicator(), start + 2);
    }
}
