//! ICMP echo packet codec
//!
//! Explicit big-endian, field-by-field encoding and decoding over byte
//! slices. Nothing here overlays structs onto wire bytes; every field is
//! read and written through `to_be_bytes`/`from_be_bytes`, which keeps the
//! codec free of alignment and padding assumptions.
//!
//! Outbound payloads start with the session's 16-byte fingerprint followed
//! by random filler, so replies can be attributed to the session that sent
//! the request even when several pingers share the host.

use serde::{Deserialize, Serialize};
use sonda_common::{Fingerprint, SessionId};
use std::net::Ipv4Addr;
use thiserror::Error;

/// ICMP type for an Echo Request
pub const ECHO_REQUEST: u8 = 8;

/// ICMP type for an Echo Reply
pub const ECHO_REPLY: u8 = 0;

/// Size of the fixed ICMP header
pub const ICMP_HEADER_LEN: usize = 8;

/// Minimum size of an IPv4 header (IHL = 5)
const IPV4_HEADER_MIN_LEN: usize = 20;

/// Protocol number for ICMP in the IPv4 header
const IPPROTO_ICMP: u8 = 1;

/// Codec and validation failures.
///
/// `ChecksumOutOfBounds` and `UnexpectedPayloadLength` indicate a violated
/// framing assumption rather than network noise; they are surfaced to the
/// caller but never panic.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcmpError {
    #[error("datagram of {len} bytes is shorter than an ICMP header")]
    InvalidLength { len: usize },

    #[error("IPv4 header of {offset} bytes does not fit a {len}-byte datagram")]
    InvalidHeaderOffset { offset: usize, len: usize },

    #[error("message of {len} bytes does not divide into 16-bit checksum words")]
    UnexpectedPayloadLength { len: usize },

    #[error("checksum accumulator overflowed")]
    ChecksumOutOfBounds,

    #[error("checksum mismatch: packet carries {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },

    #[error("unexpected ICMP type {0}")]
    InvalidType(u8),

    #[error("unexpected ICMP code {0}")]
    InvalidCode(u8),
}

/// Decoded IPv4 header, present when the platform delivers raw datagrams
/// with the network header still attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Header {
    pub version: u8,
    pub header_length: usize,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

/// Decoded ICMP echo header plus where it sits in the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    /// Offset of the ICMP header within the original datagram
    pub icmp_offset: usize,
    /// The leading IPv4 header, when one was present
    pub ip_header: Option<Ipv4Header>,
}

impl EchoHeader {
    /// The ICMP payload bytes of the datagram this header was decoded from
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[self.icmp_offset + ICMP_HEADER_LEN..]
    }
}

/// Outcome of validating an inbound datagram against a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// An echo reply addressed to this session
    Valid(EchoHeader),

    /// A well-formed reply that belongs to some other conversation
    /// (fingerprint or identifier mismatch); discard without comment
    Foreign,

    /// A malformed or unexpected message; the sequence number is included
    /// when enough of the header could be read to correlate it
    Invalid {
        sequence: Option<u16>,
        error: IcmpError,
    },
}

/// RFC 1071 Internet checksum over an ICMP message.
///
/// The message must start at the ICMP header; the 16-bit word at offset 2
/// (the checksum field itself) is treated as zero, so the same function
/// serves both encoding and verification. Messages with an odd byte count
/// are rejected rather than padded: this codec only ever produces
/// even-length messages, so an odd length is a framing violation.
pub fn checksum(message: &[u8]) -> Result<u16, IcmpError> {
    if message.len() % 2 != 0 {
        return Err(IcmpError::UnexpectedPayloadLength {
            len: message.len(),
        });
    }

    let mut sum: u32 = 0;
    let mut i = 0;
    while i < message.len() {
        // The checksum field does not checksum itself
        if i != 2 {
            let word = u16::from_be_bytes([message[i], message[i + 1]]);
            sum = sum
                .checked_add(word as u32)
                .ok_or(IcmpError::ChecksumOutOfBounds)?;
        }
        i += 2;
    }

    // Fold carries back into the low 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    Ok(!(sum as u16))
}

/// Encode an Echo Request.
///
/// The payload is the session fingerprint followed by
/// `payload_size - 16` random filler bytes (no filler when `payload_size`
/// is at or below the fingerprint length). Identifier and sequence go out
/// in network byte order and the Internet checksum is written into the
/// header before the buffer is returned.
pub fn encode(
    identifier: SessionId,
    sequence: u16,
    fingerprint: &Fingerprint,
    payload_size: usize,
) -> Result<Vec<u8>, IcmpError> {
    use rand::Rng;

    let filler = payload_size.saturating_sub(Fingerprint::LEN);
    let mut buf = vec![0u8; ICMP_HEADER_LEN + Fingerprint::LEN + filler];

    buf[0] = ECHO_REQUEST;
    buf[1] = 0; // code
                // bytes 2..4 stay zero until the checksum is known
    buf[4..6].copy_from_slice(&identifier.0.to_be_bytes());
    buf[6..8].copy_from_slice(&sequence.to_be_bytes());
    buf[ICMP_HEADER_LEN..ICMP_HEADER_LEN + Fingerprint::LEN]
        .copy_from_slice(fingerprint.as_bytes());
    rand::thread_rng().fill(&mut buf[ICMP_HEADER_LEN + Fingerprint::LEN..]);

    let sum = checksum(&buf)?;
    buf[2..4].copy_from_slice(&sum.to_be_bytes());

    Ok(buf)
}

/// Decode the ICMP header of an inbound datagram.
///
/// Depending on socket type and platform, raw-socket reads deliver either
/// the bare ICMP message or the full IP packet. The two cases are told
/// apart by inspecting the would-be IPv4 header: version nibble 4 with the
/// protocol field set to ICMP means the ICMP header starts after IHL x 4
/// bytes; anything else is taken as ICMP at offset zero.
pub fn decode(datagram: &[u8]) -> Result<EchoHeader, IcmpError> {
    if datagram.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::InvalidLength {
            len: datagram.len(),
        });
    }

    let (icmp_offset, ip_header) = if datagram.len() >= IPV4_HEADER_MIN_LEN
        && datagram[0] >> 4 == 4
        && datagram[9] == IPPROTO_ICMP
    {
        let header_length = ((datagram[0] & 0x0f) as usize) * 4;
        if header_length < IPV4_HEADER_MIN_LEN || header_length + ICMP_HEADER_LEN > datagram.len()
        {
            return Err(IcmpError::InvalidHeaderOffset {
                offset: header_length,
                len: datagram.len(),
            });
        }
        let header = Ipv4Header {
            version: datagram[0] >> 4,
            header_length,
            ttl: datagram[8],
            protocol: datagram[9],
            source: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
            destination: Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]),
        };
        (header_length, Some(header))
    } else {
        (0, None)
    };

    let icmp = &datagram[icmp_offset..];
    Ok(EchoHeader {
        icmp_type: icmp[0],
        code: icmp[1],
        checksum: u16::from_be_bytes([icmp[2], icmp[3]]),
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        icmp_offset,
        ip_header,
    })
}

/// Validate an inbound datagram against this session's identity.
///
/// Checks, in order: checksum, message type, code, payload fingerprint,
/// identifier. Fingerprint and identifier mismatches mean the reply was
/// simply not addressed to this session and yield [`Verdict::Foreign`];
/// everything else that fails yields [`Verdict::Invalid`] with whatever
/// sequence number could still be parsed. Pass `identifier = None` when
/// the transport already demultiplexes conversations (DGRAM ICMP sockets,
/// where the kernel rewrites and filters the identifier field).
pub fn validate(
    datagram: &[u8],
    fingerprint: &Fingerprint,
    identifier: Option<SessionId>,
) -> Verdict {
    let header = match decode(datagram) {
        Ok(header) => header,
        Err(error) => {
            return Verdict::Invalid {
                sequence: None,
                error,
            }
        }
    };
    let sequence = Some(header.sequence);

    let computed = match checksum(&datagram[header.icmp_offset..]) {
        Ok(sum) => sum,
        Err(error) => return Verdict::Invalid { sequence, error },
    };
    if computed != header.checksum {
        return Verdict::Invalid {
            sequence,
            error: IcmpError::ChecksumMismatch {
                received: header.checksum,
                computed,
            },
        };
    }

    if header.icmp_type != ECHO_REPLY {
        return Verdict::Invalid {
            sequence,
            error: IcmpError::InvalidType(header.icmp_type),
        };
    }
    if header.code != 0 {
        return Verdict::Invalid {
            sequence,
            error: IcmpError::InvalidCode(header.code),
        };
    }

    let payload = header.payload(datagram);
    if payload.len() < Fingerprint::LEN
        || payload[..Fingerprint::LEN] != fingerprint.as_bytes()[..]
    {
        return Verdict::Foreign;
    }
    if let Some(expected) = identifier {
        if header.identifier != expected.0 {
            return Verdict::Foreign;
        }
    }

    Verdict::Valid(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_from_request(mut packet: Vec<u8>) -> Vec<u8> {
        packet[0] = ECHO_REPLY;
        let sum = checksum(&packet).unwrap();
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    fn prepend_ipv4_header(icmp: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0u8; IPV4_HEADER_MIN_LEN];
        datagram[0] = 0x45; // version 4, IHL 5
        datagram[8] = 61; // ttl
        datagram[9] = IPPROTO_ICMP;
        datagram[12..16].copy_from_slice(&[192, 0, 2, 7]);
        datagram[16..20].copy_from_slice(&[192, 0, 2, 1]);
        datagram.extend_from_slice(icmp);
        datagram
    }

    #[test]
    fn test_encode_layout() {
        let fingerprint = Fingerprint::generate();
        let packet = encode(SessionId(0x1234), 0x5678, &fingerprint, 56).unwrap();

        assert_eq!(packet.len(), ICMP_HEADER_LEN + 56);
        assert_eq!(packet[0], ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 0x5678);
        assert_eq!(&packet[8..24], fingerprint.as_bytes());

        // The embedded checksum verifies
        let embedded = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(checksum(&packet).unwrap(), embedded);
    }

    #[test]
    fn test_encode_small_payload_keeps_fingerprint() {
        let fingerprint = Fingerprint::generate();
        let packet = encode(SessionId(1), 0, &fingerprint, Fingerprint::LEN).unwrap();
        assert_eq!(packet.len(), ICMP_HEADER_LEN + Fingerprint::LEN);
    }

    #[test]
    fn test_odd_length_fails_checksum() {
        let fingerprint = Fingerprint::generate();
        assert!(matches!(
            encode(SessionId(1), 0, &fingerprint, 57),
            Err(IcmpError::UnexpectedPayloadLength { len: 65 })
        ));
        assert!(matches!(
            checksum(&[0u8; 9]),
            Err(IcmpError::UnexpectedPayloadLength { len: 9 })
        ));
    }

    #[test]
    fn test_round_trip_validates() {
        let fingerprint = Fingerprint::generate();
        let identifier = SessionId(0xbeef);
        let packet = encode(identifier, 42, &fingerprint, 32).unwrap();
        let reply = reply_from_request(packet);

        match validate(&reply, &fingerprint, Some(identifier)) {
            Verdict::Valid(header) => {
                assert_eq!(header.sequence, 42);
                assert_eq!(header.identifier, 0xbeef);
                assert_eq!(header.icmp_offset, 0);
                assert!(header.ip_header.is_none());
            }
            other => panic!("expected valid verdict, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_skips_ipv4_header() {
        let fingerprint = Fingerprint::generate();
        let reply = reply_from_request(encode(SessionId(7), 9, &fingerprint, 24).unwrap());
        let datagram = prepend_ipv4_header(&reply);

        let header = decode(&datagram).unwrap();
        assert_eq!(header.icmp_offset, IPV4_HEADER_MIN_LEN);
        assert_eq!(header.sequence, 9);

        let ip = header.ip_header.as_ref().unwrap();
        assert_eq!(ip.ttl, 61);
        assert_eq!(ip.source, Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(ip.destination, Ipv4Addr::new(192, 0, 2, 1));

        // Validation sees through the IP header as well
        assert!(matches!(
            validate(&datagram, &fingerprint, Some(SessionId(7))),
            Verdict::Valid(_)
        ));
    }

    #[test]
    fn test_decode_rejects_short_and_truncated() {
        assert!(matches!(
            decode(&[8, 0, 0]),
            Err(IcmpError::InvalidLength { len: 3 })
        ));

        // Claims an IHL of 15 words but the datagram is far shorter
        let mut datagram = vec![0u8; 24];
        datagram[0] = 0x4f;
        datagram[9] = IPPROTO_ICMP;
        assert!(matches!(
            decode(&datagram),
            Err(IcmpError::InvalidHeaderOffset { offset: 60, .. })
        ));
    }

    #[test]
    fn test_corrupted_byte_fails_checksum() {
        let fingerprint = Fingerprint::generate();
        let mut reply = reply_from_request(encode(SessionId(3), 5, &fingerprint, 32).unwrap());
        reply[10] ^= 0xff;

        match validate(&reply, &fingerprint, Some(SessionId(3))) {
            Verdict::Invalid { sequence, error } => {
                assert_eq!(sequence, Some(5));
                assert!(matches!(error, IcmpError::ChecksumMismatch { .. }));
            }
            other => panic!("expected invalid verdict, got {:?}", other),
        }
    }

    #[test]
    fn test_request_type_rejected() {
        let fingerprint = Fingerprint::generate();
        // An un-flipped request still carries type 8
        let packet = encode(SessionId(3), 11, &fingerprint, 32).unwrap();

        match validate(&packet, &fingerprint, Some(SessionId(3))) {
            Verdict::Invalid { sequence, error } => {
                assert_eq!(sequence, Some(11));
                assert_eq!(error, IcmpError::InvalidType(ECHO_REQUEST));
            }
            other => panic!("expected invalid verdict, got {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_code_rejected() {
        let fingerprint = Fingerprint::generate();
        let mut reply = reply_from_request(encode(SessionId(3), 1, &fingerprint, 32).unwrap());
        reply[1] = 5;
        let sum = checksum(&reply).unwrap();
        reply[2..4].copy_from_slice(&sum.to_be_bytes());

        assert!(matches!(
            validate(&reply, &fingerprint, Some(SessionId(3))),
            Verdict::Invalid {
                error: IcmpError::InvalidCode(5),
                ..
            }
        ));
    }

    #[test]
    fn test_foreign_fingerprint_is_silent() {
        let ours = Fingerprint::generate();
        let theirs = Fingerprint::generate();
        let reply = reply_from_request(encode(SessionId(3), 1, &theirs, 32).unwrap());

        assert_eq!(validate(&reply, &ours, Some(SessionId(3))), Verdict::Foreign);
    }

    #[test]
    fn test_foreign_identifier_is_silent() {
        let fingerprint = Fingerprint::generate();
        let reply = reply_from_request(encode(SessionId(3), 1, &fingerprint, 32).unwrap());

        assert_eq!(
            validate(&reply, &fingerprint, Some(SessionId(4))),
            Verdict::Foreign
        );
        // A kernel-demultiplexed transport skips the identifier check
        assert!(matches!(
            validate(&reply, &fingerprint, None),
            Verdict::Valid(_)
        ));
    }
}
