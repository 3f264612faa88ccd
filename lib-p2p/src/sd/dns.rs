//! RFC 1035 name handling for Bonjour service discovery
//!
//! Bonjour queries carried in P2P SD frames may use DNS name compression.
//! Pointers are resolved against a synthetic message that starts with a
//! zeroed 12-byte DNS header followed by the 27-byte in-memory packet holding
//! the two implied queries `_tcp.local. PTR IN` and `_udp.local. PTR IN`.

use crate::error::SdDecodeError;

pub const DNS_HEADER_LEN: usize = 12;

/// In-memory packet prepended ahead of every SD query before decompression
pub const SD_IN_MEMORY_PACKET: [u8; 27] = [
    0x04, b'_', b't', b'c', b'p', 0x05, b'l', b'o', b'c', b'a', b'l', 0x00, 0x00, 0x0c, 0x00,
    0x01, 0x04, b'_', b'u', b'd', b'p', 0xc0, 0x11, 0x00, 0x0c, 0x00, 0x01,
];

/// Longest expanded name, dots included
pub const MAX_NAME_LEN: usize = 255;

/// DNS type + version suffix that closes every Bonjour query
pub const BONJOUR_SUFFIX_LEN: usize = 3;

const PREFIX_LEN: usize = DNS_HEADER_LEN + SD_IN_MEMORY_PACKET.len();

/// Expand the (possibly compressed) name starting at `offset` in `message`.
///
/// Every pointer must refer strictly before its own position, so each jump
/// shrinks the readable window and decoding always terminates. The root name
/// is returned as `"."`.
pub fn decompress_dns_label(message: &[u8], offset: usize) -> Result<String, SdDecodeError> {
    if offset > message.len() {
        return Err(SdDecodeError::Malformed);
    }

    let mut packet = Vec::with_capacity(PREFIX_LEN + message.len());
    packet.extend_from_slice(&[0u8; DNS_HEADER_LEN]);
    packet.extend_from_slice(&SD_IN_MEMORY_PACKET);
    packet.extend_from_slice(message);

    let mut out: Vec<u8> = Vec::new();
    let mut pos = PREFIX_LEN + offset;
    let mut end = packet.len();

    while pos < end {
        let tag = packet[pos] >> 6;
        match tag {
            // reserved in RFC 1035
            1 | 2 => return Err(SdDecodeError::Malformed),
            3 => {
                if pos + 2 > end {
                    return Err(SdDecodeError::Malformed);
                }
                let target = (usize::from(packet[pos] & 0x3f) << 8) | usize::from(packet[pos + 1]);
                if target >= pos {
                    return Err(SdDecodeError::Malformed);
                }
                end = pos;
                pos = target;
            }
            _ => {
                let len = usize::from(packet[pos] & 0x3f);
                if len == 0 {
                    break;
                }
                pos += 1;
                if pos + len > end {
                    return Err(SdDecodeError::Malformed);
                }
                if out.len() + len + 1 > MAX_NAME_LEN {
                    return Err(SdDecodeError::BufferTooSmall);
                }
                out.extend_from_slice(&packet[pos..pos + len]);
                out.push(b'.');
                pos += len;
            }
        }
    }

    if out.is_empty() {
        return Ok(".".to_string());
    }
    out.pop();
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Encode a dotted name as an uncompressed label sequence with root terminator
pub fn encode_dns_name(name: &str) -> Result<Vec<u8>, SdDecodeError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let mut out = Vec::with_capacity(trimmed.len() + 2);
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(SdDecodeError::Malformed);
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    if out.len() + 1 > MAX_NAME_LEN {
        return Err(SdDecodeError::BufferTooSmall);
    }
    out.push(0);
    Ok(out)
}

/// Build a Bonjour query key: name, DNS type (big endian) and version
pub fn bonjour_query(name: &str, dns_type: u16, version: u8) -> Result<Vec<u8>, SdDecodeError> {
    let mut out = encode_dns_name(name)?;
    out.extend_from_slice(&dns_type.to_be_bytes());
    out.push(version);
    Ok(out)
}

/// Whether an incoming Bonjour query selects the registered one.
///
/// DNS type and version must match byte for byte. Names match on binary
/// equality, or else on equality after expanding both sides.
pub fn match_bonjour_query(registered: &[u8], incoming: &[u8]) -> bool {
    if incoming.len() < BONJOUR_SUFFIX_LEN || registered.len() < BONJOUR_SUFFIX_LEN {
        return false;
    }
    let in_split = incoming.len() - BONJOUR_SUFFIX_LEN;
    let reg_split = registered.len() - BONJOUR_SUFFIX_LEN;
    if incoming[in_split..] != registered[reg_split..] {
        return false;
    }
    if incoming == registered {
        return true;
    }

    let Ok(rx_name) = decompress_dns_label(&incoming[..in_split], 0) else {
        return false;
    };
    let Ok(srv_name) = decompress_dns_label(&registered[..reg_split], 0) else {
        return false;
    };
    rx_name == srv_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_name() {
        let msg = encode_dns_name("_ipp._tcp.local").expect("encode");
        assert_eq!(decompress_dns_label(&msg, 0).expect("decode"), "_ipp._tcp.local");
    }

    #[test]
    fn test_pointer_into_in_memory_packet() {
        // "_ipp" then a pointer to "_tcp.local" at offset 12
        let msg = [0x04, b'_', b'i', b'p', b'p', 0xc0, 0x0c];
        assert_eq!(decompress_dns_label(&msg, 0).expect("decode"), "_ipp._tcp.local");

        // "_udp" label in the in-memory packet itself points back at "local"
        let msg = [0x03, b'f', b'o', b'o', 0xc0, 0x1c];
        assert_eq!(decompress_dns_label(&msg, 0).expect("decode"), "foo._udp.local");
    }

    #[test]
    fn test_root_name() {
        assert_eq!(decompress_dns_label(&[0x00], 0).expect("decode"), ".");
        assert_eq!(decompress_dns_label(&[], 0).expect("decode"), ".");
    }

    #[test]
    fn test_forward_and_self_pointers_rejected() {
        // pointer at packet offset 39 pointing to itself
        let self_ptr = [0xc0, 0x27];
        assert_eq!(decompress_dns_label(&self_ptr, 0), Err(SdDecodeError::Malformed));
        let forward = [0xc0, 0x40, 0x00];
        assert_eq!(decompress_dns_label(&forward, 0), Err(SdDecodeError::Malformed));
    }

    #[test]
    fn test_reserved_label_types_rejected() {
        assert_eq!(decompress_dns_label(&[0x40, 0x00], 0), Err(SdDecodeError::Malformed));
        assert_eq!(decompress_dns_label(&[0x80, 0x00], 0), Err(SdDecodeError::Malformed));
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert_eq!(decompress_dns_label(&[0x05, b'a', b'b'], 0), Err(SdDecodeError::Malformed));
        assert_eq!(decompress_dns_label(&[0xc0], 0), Err(SdDecodeError::Malformed));
        assert_eq!(decompress_dns_label(&[0x00], 2), Err(SdDecodeError::Malformed));
    }

    #[test]
    fn test_output_limit() {
        let label = "a".repeat(63);
        let last = "b".repeat(61);
        let name = [label.as_str(), label.as_str(), label.as_str(), last.as_str()].join(".");
        let msg = encode_dns_name(&name).expect("encode fits wire limit");
        assert_eq!(decompress_dns_label(&msg, 0).expect("decode"), name);

        let mut long = msg[..msg.len() - 1].to_vec();
        long.push(5);
        long.extend_from_slice(b"extra");
        long.push(0);
        assert_eq!(decompress_dns_label(&long, 0), Err(SdDecodeError::BufferTooSmall));
    }

    #[test]
    fn test_match_bonjour_binary_and_expanded() {
        let registered = bonjour_query("_ipp._tcp.local", 12, 1).expect("query");
        assert!(match_bonjour_query(&registered, &registered));

        let compressed = [0x04, b'_', b'i', b'p', b'p', 0xc0, 0x0c, 0x00, 0x0c, 0x01];
        assert!(match_bonjour_query(&registered, &compressed));

        let wrong_version = [0x04, b'_', b'i', b'p', b'p', 0xc0, 0x0c, 0x00, 0x0c, 0x02];
        assert!(!match_bonjour_query(&registered, &wrong_version));
        assert!(!match_bonjour_query(&registered, &[0x00, 0x0c]));
    }

    #[test]
    fn test_match_bonjour_rejects_malformed_incoming() {
        let registered = bonjour_query("_ipp._tcp.local", 12, 1).expect("query");
        let looping = [0xc0, 0x27, 0x00, 0x0c, 0x01];
        assert!(!match_bonjour_query(&registered, &looping));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn label() -> impl Strategy<Value = String> {
            "[a-z0-9_-]{1,20}"
        }

        proptest! {
            #[test]
            fn prop_uncompressed_round_trip(labels in prop::collection::vec(label(), 1..6)) {
                let name = labels.join(".");
                let msg = encode_dns_name(&name).unwrap();
                prop_assert_eq!(decompress_dns_label(&msg, 0).unwrap(), name);
            }

            #[test]
            fn prop_non_backward_pointer_is_malformed(
                prefix in prop::collection::vec(label(), 0..3),
                extra in 0u16..0x3000,
            ) {
                let mut msg = encode_dns_name(&prefix.join(".")).unwrap();
                msg.pop();
                let own = (PREFIX_LEN + msg.len()) as u16;
                let target = own + (extra % (0x3fff - own));
                msg.push(0xc0 | (target >> 8) as u8);
                msg.push(target as u8);
                prop_assert_eq!(decompress_dns_label(&msg, 0), Err(SdDecodeError::Malformed));
            }

            #[test]
            fn prop_arbitrary_input_never_panics(
                bytes in prop::collection::vec(any::<u8>(), 0..300),
                offset in 0usize..320,
            ) {
                let _ = decompress_dns_label(&bytes, offset);
                let _ = match_bonjour_query(&bytes, &bytes);
            }
        }
    }
}
