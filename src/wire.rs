use thiserror::Error;

/// Errors produced while decoding a PTP message off the wire.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Low nibble of the first header octet (transportSpecific | messageType).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpMessageType {
    Sync,
    DelayReq,
    PdelayReq,
    PdelayResp,
    FollowUp,
    DelayResp,
    PdelayRespFollowUp,
    Announce,
    Signaling,
    Management,
    Unknown,
}

impl PtpMessageType {
    fn to_nibble(self) -> u8 {
        match self {
            PtpMessageType::Sync => 0x0,
            PtpMessageType::DelayReq => 0x1,
            PtpMessageType::PdelayReq => 0x2,
            PtpMessageType::PdelayResp => 0x3,
            PtpMessageType::FollowUp => 0x8,
            PtpMessageType::DelayResp => 0x9,
            PtpMessageType::PdelayRespFollowUp => 0xA,
            PtpMessageType::Announce => 0xB,
            PtpMessageType::Signaling => 0xC,
            PtpMessageType::Management => 0xD,
            PtpMessageType::Unknown => 0xFF,
        }
    }
}

impl From<u8> for PtpMessageType {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => PtpMessageType::Sync,
            0x1 => PtpMessageType::DelayReq,
            0x2 => PtpMessageType::PdelayReq,
            0x3 => PtpMessageType::PdelayResp,
            0x8 => PtpMessageType::FollowUp,
            0x9 => PtpMessageType::DelayResp,
            0xA => PtpMessageType::PdelayRespFollowUp,
            0xB => PtpMessageType::Announce,
            0xC => PtpMessageType::Signaling,
            0xD => PtpMessageType::Management,
            _ => PtpMessageType::Unknown,
        }
    }
}

/// The simplified 34-byte PTP header (no padding, all multi-byte fields
/// big-endian). Real PTP headers carry a 48-bit seconds field and more;
/// this is an intentional compromise, see spec §3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    pub transport_specific_message_type: u8,
    pub version_ptp: u8,
    pub message_length: u16,
    pub domain_number: u8,
    pub reserved1: u8,
    pub flags: u16,
    pub correction_field: i64,
    pub reserved2: u32,
    pub source_port_identity: [u8; 10],
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

impl PtpHeader {
    pub const SIZE: usize = 34;

    pub fn message_type(&self) -> PtpMessageType {
        PtpMessageType::from(self.transport_specific_message_type)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < Self::SIZE {
            return Err(WireError::TooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let mut source_port_identity = [0u8; 10];
        source_port_identity.copy_from_slice(&bytes[20..30]);

        Ok(PtpHeader {
            transport_specific_message_type: bytes[0],
            version_ptp: bytes[1],
            message_length: u16::from_be_bytes([bytes[2], bytes[3]]),
            domain_number: bytes[4],
            reserved1: bytes[5],
            flags: u16::from_be_bytes([bytes[6], bytes[7]]),
            correction_field: i64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            reserved2: u32::from_be_bytes(bytes[16..20].try_into().unwrap()),
            source_port_identity,
            sequence_id: u16::from_be_bytes([bytes[30], bytes[31]]),
            control_field: bytes[32],
            log_message_interval: bytes[33] as i8,
        })
    }
}

/// 8-byte simplified PTP timestamp: 32-bit seconds + 32-bit nanoseconds,
/// both big-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtpTimestamp {
    pub seconds: u32,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub const SIZE: usize = 8;

    pub fn new(seconds: u32, nanoseconds: u32) -> Self {
        PtpTimestamp {
            seconds,
            nanoseconds,
        }
    }

    /// Total nanoseconds since this timestamp's zero point, as used by the
    /// path-delay calculation. Computed in host-endian after conversion off
    /// the wire.
    pub fn to_nanos(self) -> i64 {
        self.seconds as i64 * 1_000_000_000 + self.nanoseconds as i64
    }

    fn to_be_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.nanoseconds.to_be_bytes());
        buf
    }

    fn from_be_bytes(bytes: &[u8]) -> Self {
        PtpTimestamp {
            seconds: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            nanoseconds: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Total wire length of a Sync/Follow_Up/Delay_Req/Delay_Resp message:
/// header + one timestamp payload.
pub const MESSAGE_SIZE: usize = PtpHeader::SIZE + PtpTimestamp::SIZE;

/// Encodes a message with a zero-filled header except for the low nibble
/// of byte 0 (message type) and the big-endian sequenceId at offset 30,
/// followed by the timestamp payload at offset 34.
pub fn encode(msg_type: PtpMessageType, sequence_id: u16, payload: PtpTimestamp) -> [u8; MESSAGE_SIZE] {
    let mut buf = [0u8; MESSAGE_SIZE];
    buf[0] = msg_type.to_nibble();
    buf[30..32].copy_from_slice(&sequence_id.to_be_bytes());
    buf[PtpHeader::SIZE..MESSAGE_SIZE].copy_from_slice(&payload.to_be_bytes());
    buf
}

/// Decodes a message, rejecting anything shorter than [`MESSAGE_SIZE`].
/// An unrecognized message-type nibble yields [`PtpMessageType::Unknown`]
/// rather than an error — the caller silently discards it per spec §4.A.
pub fn decode(bytes: &[u8]) -> Result<(PtpMessageType, u16, PtpTimestamp), WireError> {
    if bytes.len() < MESSAGE_SIZE {
        return Err(WireError::TooShort {
            expected: MESSAGE_SIZE,
            actual: bytes.len(),
        });
    }

    let msg_type = PtpMessageType::from(bytes[0]);
    let sequence_id = u16::from_be_bytes([bytes[30], bytes[31]]);
    let payload = PtpTimestamp::from_be_bytes(&bytes[PtpHeader::SIZE..MESSAGE_SIZE]);

    Ok((msg_type, sequence_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ts = PtpTimestamp::new(123_456, 789);
        for msg_type in [
            PtpMessageType::Sync,
            PtpMessageType::DelayReq,
            PtpMessageType::FollowUp,
            PtpMessageType::DelayResp,
        ] {
            let bytes = encode(msg_type, 0xBEEF, ts);
            let (decoded_type, decoded_seq, decoded_ts) = decode(&bytes).unwrap();
            assert_eq!(decoded_type, msg_type);
            assert_eq!(decoded_seq, 0xBEEF);
            assert_eq!(decoded_ts, ts);
        }
    }

    #[test]
    fn encode_length_is_42() {
        let bytes = encode(PtpMessageType::Sync, 0, PtpTimestamp::default());
        assert_eq!(bytes.len(), 42);
    }

    #[test]
    fn sequence_id_is_big_endian_at_offset_30() {
        let bytes = encode(PtpMessageType::Sync, 0x0102, PtpTimestamp::default());
        assert_eq!(bytes[30], 0x01);
        assert_eq!(bytes[31], 0x02);
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let bytes = [0u8; MESSAGE_SIZE - 1];
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn unknown_message_type_does_not_error() {
        let mut bytes = encode(PtpMessageType::Sync, 1, PtpTimestamp::default());
        bytes[0] = 0x07; // not in the recognized set
        let (msg_type, _, _) = decode(&bytes).unwrap();
        assert_eq!(msg_type, PtpMessageType::Unknown);
    }

    #[test]
    fn header_parses_full_34_bytes() {
        let mut bytes = encode(PtpMessageType::DelayResp, 42, PtpTimestamp::new(1, 2));
        bytes[4] = 7; // domainNumber
        bytes[32] = 3; // controlField
        bytes[33] = (-2i8) as u8; // logMessageInterval
        let header = PtpHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_type(), PtpMessageType::DelayResp);
        assert_eq!(header.sequence_id, 42);
        assert_eq!(header.domain_number, 7);
        assert_eq!(header.control_field, 3);
        assert_eq!(header.log_message_interval, -2);
    }

    #[test]
    fn timestamp_to_nanos() {
        let ts = PtpTimestamp::new(2, 500);
        assert_eq!(ts.to_nanos(), 2_000_000_500);
    }
}
