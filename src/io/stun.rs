use std::fmt;
use std::io::{self, Cursor, Write};
use std::net::{IpAddr, SocketAddr};
use std::str;
use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};

use super::{Sha1, StunError};

// Consult libwebrtc for default values here.
pub const STUN_INITIAL_RTO: Duration = Duration::from_millis(250);
pub const STUN_MAX_RETRANS: usize = 7;
pub const STUN_MAX_RTO: Duration = Duration::from_millis(3000);

/// Error code sent back when both agents claim the same role.
pub const ROLE_CONFLICT: u16 = 487;

/// Calculate the send delay given how many times we tried.
///
// Technically RTO should be calculated as per https://datatracker.ietf.org/doc/html/rfc2988, and
// modified by https://datatracker.ietf.org/doc/html/rfc5389#section-7.2.1,
// but chrome does it like this. https://webrtc.googlesource.com/src/+/refs/heads/main/p2p/base/stun_request.cc
pub fn stun_resend_delay(send_count: usize, initial: Duration, max: Duration) -> Duration {
    if send_count == 0 {
        return Duration::ZERO;
    }

    // 2^16 is way past any sane cap.
    let retrans = (send_count - 1).min(16) as u32;

    let rto = initial.saturating_mul(1 << retrans);

    rto.min(max)
}

/// The 96 bit STUN transaction id.
///
/// Together with the magic cookie this fills the 128 bits that follow
/// the message type and length in the header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransId([u8; 12]);

impl TransId {
    /// A new random transaction id.
    pub fn new() -> Self {
        let mut t = [0_u8; 12];
        fastrand::fill(&mut t);
        TransId(t)
    }

    fn from_slice(s: &[u8]) -> Self {
        let mut t = [0_u8; 12];
        t[..].copy_from_slice(s);
        TransId(t)
    }
}

impl fmt::Debug for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransId({})", self)
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Represents a STUN message as fit for our purposes.
///
/// STUN is a very flexible protocol.
/// This implementations only provides what we need for ICE connectivity checks:
/// the BINDING method with requests, success and error responses.
#[derive(Clone, PartialEq, Eq)]
pub struct StunMessage {
    method: Method,
    class: Class,
    trans_id: TransId,
    attrs: Attributes,
    integrity: Vec<u8>,
    integrity_len: u16,
}

impl StunMessage {
    /// Parse a STUN message from a slice of bytes.
    pub fn parse(buf: &[u8]) -> Result<StunMessage, StunError> {
        if buf.len() < 20 {
            return Err(StunError::Parse("STUN header too short".into()));
        }
        let typ = (buf[0] as u16 & 0b0011_1111) << 8 | buf[1] as u16;
        let len = (buf[2] as u16) << 8 | buf[3] as u16;
        if len & 0b0000_0011 > 0 {
            return Err(StunError::Parse("len is not a multiple of 4".into()));
        }
        if len as usize != buf.len() - 20 {
            return Err(StunError::Parse(
                "STUN length vs packet length mismatch".into(),
            ));
        }
        if &buf[4..8] != MAGIC {
            return Err(StunError::Parse("magic cookie mismatch".into()));
        }
        // typ is method and class
        // |M11|M10|M9|M8|M7|C1|M6|M5|M4|C0|M3|M2|M1|M0|
        // |11 |10 |9 |8 |7 |1 |6 |5 |4 |0 |3 |2 |1 |0 |
        let class = Class::from_typ(typ);
        let method = Method::from_typ(typ);
        let trans_id = TransId::from_slice(&buf[8..20]);

        let mut message_integrity_offset = None;

        let attrs = Attributes::parse(&buf[20..], trans_id, &mut message_integrity_offset)?;

        // message-integrity only includes the length up until and including
        // the message-integrity attribute.
        let Some(message_integrity_offset) = message_integrity_offset else {
            return Err(StunError::Parse("No message integrity in incoming".into()));
        };

        // length including message integrity attribute
        let integrity_len = (message_integrity_offset + 4 + 20) as u16;

        // password as key is called "short-term credentials"
        // buffer from beginning including header (+20) to where message-integrity starts.
        let integrity = buf[0..(message_integrity_offset + 20)].to_vec();

        if method == Method::Binding && class == Class::Success {
            if attrs.xor_mapped_address.is_none() {
                return Err(StunError::Parse("STUN packet missing mapped addr".into()));
            }
        } else if method == Method::Binding && class == Class::Request {
            if attrs.split_username().is_none() {
                return Err(StunError::Parse("STUN packet missing username".into()));
            }
            if attrs.priority.is_none() {
                return Err(StunError::Parse("STUN packet missing priority".into()));
            }
        } else if method == Method::Binding && class == Class::Failure {
            if attrs.error_code.is_none() {
                return Err(StunError::Parse("STUN error response missing code".into()));
            }
        }

        Ok(StunMessage {
            class,
            method,
            trans_id,
            attrs,
            integrity,
            integrity_len,
        })
    }

    /// Whether this STUN message is a BINDING request.
    pub fn is_binding_request(&self) -> bool {
        self.method == Method::Binding && self.class == Class::Request
    }

    /// Whether this STUN message is a response.
    pub fn is_response(&self) -> bool {
        matches!(self.class, Class::Success | Class::Failure)
    }

    /// Whether this STUN message is a _successful_ BINDING response.
    pub fn is_successful_binding_response(&self) -> bool {
        self.method == Method::Binding && self.class == Class::Success
    }

    /// Whether this STUN message is a BINDING error response.
    pub fn is_failed_binding_response(&self) -> bool {
        self.method == Method::Binding && self.class == Class::Failure
    }

    /// The transaction ID of this STUN message.
    pub fn trans_id(&self) -> TransId {
        self.trans_id
    }

    /// Constructs a new BINDING request from the provided data.
    pub fn binding_request(
        username: &str,
        trans_id: TransId,
        controlling: bool,
        control_tie_breaker: u64,
        prio: u32,
        use_candidate: bool,
    ) -> Self {
        StunMessage {
            class: Class::Request,
            method: Method::Binding,
            trans_id,
            attrs: Attributes {
                username: Some(username.to_string()),
                ice_controlling: controlling.then_some(control_tie_breaker),
                ice_controlled: (!controlling).then_some(control_tie_breaker),
                priority: Some(prio),
                use_candidate: use_candidate.then_some(true),
                ..Default::default()
            },
            integrity: vec![],
            integrity_len: 0,
        }
    }

    /// Constructs a new STUN BINDING reply.
    pub fn reply(trans_id: TransId, mapped_address: SocketAddr) -> StunMessage {
        StunMessage {
            class: Class::Success,
            method: Method::Binding,
            trans_id,
            attrs: Attributes {
                xor_mapped_address: Some(mapped_address),
                ..Default::default()
            },
            integrity: vec![],
            integrity_len: 0,
        }
    }

    /// Constructs a STUN BINDING error response.
    pub fn error_reply(trans_id: TransId, code: u16, reason: &str) -> StunMessage {
        StunMessage {
            class: Class::Failure,
            method: Method::Binding,
            trans_id,
            attrs: Attributes {
                error_code: Some((code, reason.to_string())),
                ..Default::default()
            },
            integrity: vec![],
            integrity_len: 0,
        }
    }

    /// If present, splits the value of the USERNAME attribute into local and remote (separated by `:`).
    pub fn split_username(&self) -> Option<(&str, &str)> {
        self.attrs.split_username()
    }

    /// If present, returns the value of XOR-MAPPED-ADDRESS attribute.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attrs.xor_mapped_address
    }

    /// If present, returns the value of the PRIORITY attribute.
    pub fn prio(&self) -> Option<u32> {
        self.attrs.priority
    }

    /// Whether this message has the USE-CANDIDATE attribute.
    pub fn use_candidate(&self) -> bool {
        self.attrs.use_candidate()
    }

    /// The tie breaker of the ICE-CONTROLLING attribute.
    pub fn ice_controlling(&self) -> Option<u64> {
        self.attrs.ice_controlling
    }

    /// The tie breaker of the ICE-CONTROLLED attribute.
    pub fn ice_controlled(&self) -> Option<u64> {
        self.attrs.ice_controlled
    }

    /// The ERROR-CODE of an error response.
    pub fn error_code(&self) -> Option<u16> {
        self.attrs.error_code.as_ref().map(|(code, _)| *code)
    }

    /// Verify the integrity of this message against the provided password.
    #[must_use]
    pub fn check_integrity(&self, password: &str) -> bool {
        if self.integrity.len() < 4 {
            return false;
        }
        if let Some(integ) = self.attrs.message_integrity {
            let sha1: Sha1 = password.as_bytes().into();
            let comp = sha1.hmac(&[
                &self.integrity[..2],
                &[(self.integrity_len >> 8) as u8, self.integrity_len as u8],
                &self.integrity[4..],
            ]);
            comp == integ
        } else {
            false
        }
    }

    /// Serialize this message into the provided buffer, returning the final length of the message.
    ///
    /// The provided password is used to authenticate the message.
    pub fn to_bytes(&self, password: &str, buf: &mut [u8]) -> Result<usize, StunError> {
        const MSG_HEADER_LEN: usize = 20;
        const MSG_INTEGRITY_LEN: usize = 20;
        const FPRINT_LEN: usize = 4;
        const ATTR_TLV_LENGTH: usize = 4;

        let attr_len = self.attrs.padded_len()
            + MSG_INTEGRITY_LEN
            + ATTR_TLV_LENGTH
            + FPRINT_LEN
            + ATTR_TLV_LENGTH;

        if buf.len() < MSG_HEADER_LEN + attr_len {
            return Err(StunError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "buffer too small for STUN message",
            )));
        }

        let mut buf = Cursor::new(buf);

        // Message header
        {
            let typ = self.class.to_u16() | self.method.to_u16();
            buf.write_all(&typ.to_be_bytes())?;

            // -8 for fingerprint
            buf.write_all(&((attr_len - 8) as u16).to_be_bytes())?;
            buf.write_all(MAGIC)?;
            buf.write_all(&self.trans_id.0)?;
        }

        // Custom attributes
        self.attrs.to_bytes(&mut buf, &self.trans_id.0)?;

        // Message integrity
        buf.write_all(&0x0008_u16.to_be_bytes())?;
        buf.write_all(&(MSG_INTEGRITY_LEN as u16).to_be_bytes())?;
        buf.write_all(&[0; MSG_INTEGRITY_LEN])?; // placeholder
        let integrity_value_offset = MSG_HEADER_LEN + self.attrs.padded_len() + ATTR_TLV_LENGTH;

        // Fingerprint
        buf.write_all(&0x8028_u16.to_be_bytes())?;
        buf.write_all(&(FPRINT_LEN as u16).to_be_bytes())?;
        buf.write_all(&[0; FPRINT_LEN])?; // placeholder
        let fingerprint_value_offest = integrity_value_offset + MSG_INTEGRITY_LEN + ATTR_TLV_LENGTH;

        let buf = buf.into_inner();

        // Compute and fill in message integrity
        let sha1: Sha1 = password.as_bytes().into();
        let hmac = sha1.hmac(&[&buf[0..(integrity_value_offset - ATTR_TLV_LENGTH)]]);
        buf[integrity_value_offset..(integrity_value_offset + MSG_INTEGRITY_LEN)]
            .copy_from_slice(&hmac);

        // Fill in total message length
        buf[2..4].copy_from_slice(&(attr_len as u16).to_be_bytes());

        // Compute and fill in fingerprint
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC)
            .checksum(&buf[0..(fingerprint_value_offest - ATTR_TLV_LENGTH)])
            ^ 0x5354_554e;
        buf[fingerprint_value_offest..(fingerprint_value_offest + FPRINT_LEN)]
            .copy_from_slice(&crc.to_be_bytes());

        Ok(MSG_HEADER_LEN + attr_len)
    }

    /// Serialize into a freshly allocated buffer.
    pub fn to_vec(&self, password: &str) -> Result<Vec<u8>, StunError> {
        let mut buf = vec![0_u8; 1500];
        let n = self.to_bytes(password, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

const MAGIC: &[u8] = &[0x21, 0x12, 0xA4, 0x42];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Class {
    Request,
    Indication,
    Success,
    Failure,
}

impl Class {
    fn from_typ(typ: u16) -> Self {
        use Class::*;
        match typ & 0b0000_0001_0001_0000 {
            0b0000_0000_0000_0000 => Request,
            0b0000_0000_0001_0000 => Indication,
            0b0000_0001_0000_0000 => Success,
            _ => Failure,
        }
    }

    fn to_u16(self) -> u16 {
        use Class::*;
        match self {
            Request => 0b0000_0000_0000_0000,
            Indication => 0b0000_0000_0001_0000,
            Success => 0b0000_0001_0000_0000,
            Failure => 0b0000_0001_0001_0000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Binding,
    Unknown(u16),
}

impl Method {
    fn from_typ(typ: u16) -> Self {
        use Method::*;
        match typ & 0b0011_1110_1110_1111 {
            0b0000_0000_0000_0001 => Binding,
            v => Unknown(v),
        }
    }

    fn to_u16(self) -> u16 {
        use Method::*;
        match self {
            Binding => 0b0000_0000_0000_0001,
            Unknown(v) => v,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Attributes {
    username: Option<String>,                // < 128 utf8 chars
    message_integrity: Option<[u8; 20]>,     // 20 bytes sha-1
    error_code: Option<(u16, String)>,       // 300-699 and reason phrase < 128 utf8 chars
    xor_mapped_address: Option<SocketAddr>,  // 0x0020
    software: Option<String>,
    fingerprint: Option<u32>, // crc32
    // https://tools.ietf.org/html/rfc8445
    priority: Option<u32>,        // 0x0024
    use_candidate: Option<bool>,  // 0x0025
    ice_controlled: Option<u64>,  // 0x8029
    ice_controlling: Option<u64>, // 0x802a
    // https://tools.ietf.org/html/draft-thatcher-ice-network-cost-00
    network_cost: Option<(u16, u16)>, // 0xc057
}

fn pad_len(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

impl Attributes {
    fn split_username(&self) -> Option<(&str, &str)> {
        // usernames are on the form gfNK:062g where
        // gfNK is the ufrag of the receiver and
        // 062g is the sender.

        let v = self.username.as_deref()?;
        let idx = v.find(':')?;

        if idx == 0 || idx + 1 >= v.len() {
            return None;
        }

        let local = &v[..idx];
        let remote = &v[(idx + 1)..];

        Some((local, remote))
    }

    fn use_candidate(&self) -> bool {
        self.use_candidate.unwrap_or(false)
    }

    fn padded_len(&self) -> usize {
        let username = self
            .username
            .as_ref()
            .map(|v| 4 + v.len() + pad_len(v.len()))
            .unwrap_or_default();
        let error_code = self
            .error_code
            .as_ref()
            .map(|(_, reason)| 4 + 4 + reason.len() + pad_len(reason.len()))
            .unwrap_or_default();
        let ice_controlled = self.ice_controlled.map(|_| 4 + 8).unwrap_or_default();
        let ice_controlling = self.ice_controlling.map(|_| 4 + 8).unwrap_or_default();
        let priority = self.priority.map(|_| 4 + 4).unwrap_or_default();
        let address = self
            .xor_mapped_address
            .map(|a| 4 + if a.is_ipv4() { 8 } else { 20 })
            .unwrap_or_default();
        let use_candidate = if self.use_candidate() { 4 } else { 0 };

        username + error_code + ice_controlled + ice_controlling + priority + address + use_candidate
    }

    fn to_bytes(&self, vec: &mut dyn Write, trans_id: &[u8]) -> io::Result<()> {
        if let Some(v) = &self.username {
            vec.write_all(&0x0006_u16.to_be_bytes())?;
            vec.write_all(&(v.len() as u16).to_be_bytes())?;
            vec.write_all(v.as_bytes())?;
            vec.write_all(&[0; 3][..pad_len(v.len())])?;
        }
        if let Some((code, reason)) = &self.error_code {
            vec.write_all(&0x0009_u16.to_be_bytes())?;
            vec.write_all(&((4 + reason.len()) as u16).to_be_bytes())?;
            vec.write_all(&[0, 0, (code / 100) as u8, (code % 100) as u8])?;
            vec.write_all(reason.as_bytes())?;
            vec.write_all(&[0; 3][..pad_len(reason.len())])?;
        }
        if let Some(v) = self.ice_controlled {
            vec.write_all(&0x8029_u16.to_be_bytes())?;
            vec.write_all(&8_u16.to_be_bytes())?;
            vec.write_all(&v.to_be_bytes())?;
        }
        if let Some(v) = self.ice_controlling {
            vec.write_all(&0x802a_u16.to_be_bytes())?;
            vec.write_all(&8_u16.to_be_bytes())?;
            vec.write_all(&v.to_be_bytes())?;
        }
        if let Some(v) = self.priority {
            vec.write_all(&0x0024_u16.to_be_bytes())?;
            vec.write_all(&4_u16.to_be_bytes())?;
            vec.write_all(&v.to_be_bytes())?;
        }
        if let Some(v) = self.xor_mapped_address {
            let mut buf = [0_u8; 20];
            let len = encode_xor(v, &mut buf, trans_id);
            vec.write_all(&0x0020_u16.to_be_bytes())?;
            vec.write_all(&((len as u16).to_be_bytes()))?;
            vec.write_all(&buf[0..len])?;
        }
        if self.use_candidate() {
            vec.write_all(&0x0025_u16.to_be_bytes())?;
            vec.write_all(&0_u16.to_be_bytes())?;
        }

        Ok(())
    }

    fn parse(
        mut buf: &[u8],
        trans_id: TransId,
        msg_integrity_off: &mut Option<usize>,
    ) -> Result<Attributes, StunError> {
        let mut attributes = Attributes::default();

        let mut off = 0;
        // With the exception of the FINGERPRINT
        //    attribute, which appears after MESSAGE-INTEGRITY, agents MUST ignore
        //    all other attributes that follow MESSAGE-INTEGRITY
        let mut ignore_rest = false;
        while !buf.is_empty() {
            if buf.len() < 4 {
                return Err(StunError::Parse("Truncated STUN attribute header".into()));
            }
            let typ = (buf[0] as u16) << 8 | buf[1] as u16;
            let len = (buf[2] as usize) << 8 | buf[3] as usize;
            trace!("STUN attribute typ 0x{:04x?} len {}", typ, len);
            if len > buf.len() - 4 {
                return Err(StunError::Parse(format!(
                    "Bad STUN attribute length: {} > {}",
                    len,
                    buf.len() - 4,
                )));
            }
            let value = &buf[4..(4 + len)];
            if !ignore_rest || typ == 0x8028 {
                match typ {
                    0x0001 => {
                        warn!("STUN got MappedAddress");
                    }
                    0x0006 => {
                        attributes.username = Some(decode_str(typ, value)?);
                    }
                    0x0008 => {
                        if len != 20 {
                            return Err(StunError::Parse(
                                "Expected message integrity to have length 20".into(),
                            ));
                        }
                        // message integrity is up until, but not including the message
                        // integrity attribute.
                        *msg_integrity_off = Some(off);
                        ignore_rest = true;
                        let mut integ = [0_u8; 20];
                        integ.copy_from_slice(value);
                        attributes.message_integrity = Some(integ);
                    }
                    0x0009 => {
                        if len < 4 {
                            return Err(StunError::Parse("Error code too short".into()));
                        }
                        if value[0] != 0 || value[1] != 0 || value[2] & 0b1111_1000 != 0 {
                            return Err(StunError::Parse("Expected 0 at top of error code".into()));
                        }
                        let class = value[2] as u16 * 100;
                        if !(300..=699).contains(&class) {
                            return Err(StunError::Parse(format!(
                                "Error class is not in range: {class}"
                            )));
                        }
                        let code = class + (value[3] % 100) as u16;
                        attributes.error_code = Some((code, decode_str(typ, &value[4..])?));
                    }
                    0x000a => {
                        warn!("STUN got UnknownAttributes");
                    }
                    0x0020 => {
                        attributes.xor_mapped_address = Some(decode_xor(value, trans_id)?);
                    }
                    0x0022 => {
                        attributes.software = Some(decode_str(typ, value)?);
                    }
                    0x0024 => {
                        if len != 4 {
                            return Err(StunError::Parse("Priority that isnt 4 in length".into()));
                        }
                        let bytes = [value[0], value[1], value[2], value[3]];
                        attributes.priority = Some(u32::from_be_bytes(bytes));
                    }
                    0x0025 => {
                        if len != 0 {
                            return Err(StunError::Parse(
                                "UseCandidate that isnt 0 in length".into(),
                            ));
                        }
                        attributes.use_candidate = Some(true);
                    }
                    0x8023 => {
                        warn!("STUN got AlternateServer");
                    }
                    0x8028 => {
                        if len != 4 {
                            return Err(StunError::Parse("Fingerprint that isnt 4 in length".into()));
                        }
                        let bytes = [value[0], value[1], value[2], value[3]];
                        attributes.fingerprint = Some(u32::from_be_bytes(bytes));
                    }
                    0x8029 => {
                        if len != 8 {
                            return Err(StunError::Parse(
                                "IceControlled that isnt 8 in length".into(),
                            ));
                        }
                        let mut bytes = [0_u8; 8];
                        bytes.copy_from_slice(value);
                        attributes.ice_controlled = Some(u64::from_be_bytes(bytes));
                    }
                    0x802a => {
                        if len != 8 {
                            return Err(StunError::Parse(
                                "IceControlling that isnt 8 in length".into(),
                            ));
                        }
                        let mut bytes = [0_u8; 8];
                        bytes.copy_from_slice(value);
                        attributes.ice_controlling = Some(u64::from_be_bytes(bytes));
                    }
                    0xc057 => {
                        if len != 4 {
                            warn!("NetworkCost that isnt 4 in length");
                        } else {
                            let net_id = (value[0] as u16) << 8 | value[1] as u16;
                            let cost = (value[2] as u16) << 8 | value[3] as u16;
                            attributes.network_cost = Some((net_id, cost));
                        }
                    }
                    _ => {}
                }
            }
            // attributes are on even 32 bit boundaries
            let skip = (4 + len + pad_len(len)).min(buf.len());
            buf = &buf[skip..];
            off += skip;
        }
        Ok(attributes)
    }
}

fn decode_str(typ: u16, buf: &[u8]) -> Result<String, StunError> {
    // 128 characters of up to 4 bytes utf-8 each.
    if buf.len() > 128 * 4 {
        return Err(StunError::Parse(format!(
            "0x{typ:04x?} too long str len: {}",
            buf.len()
        )));
    }
    match str::from_utf8(buf) {
        Ok(v) => Ok(v.to_string()),
        Err(_) => Err(StunError::Parse(format!("0x{typ:04x?} malformed utf-8"))),
    }
}

fn encode_xor(addr: SocketAddr, buf: &mut [u8; 20], trans_id: &[u8]) -> usize {
    let port = addr.port() ^ 0x2112;
    buf[2..4].copy_from_slice(&port.to_be_bytes());
    buf[1] = if addr.is_ipv4() { 1 } else { 2 };
    let ip_buf = &mut buf[4..];
    match addr {
        SocketAddr::V4(v) => {
            let bytes = v.ip().octets();
            for i in 0..4 {
                ip_buf[i] = bytes[i] ^ MAGIC[i];
            }
            8
        }
        SocketAddr::V6(v) => {
            let bytes = v.ip().octets();
            for i in 0..4 {
                ip_buf[i] = bytes[i] ^ MAGIC[i];
            }
            for i in 4..16 {
                ip_buf[i] = bytes[i] ^ trans_id[i - 4];
            }
            20
        }
    }
}

fn decode_xor(buf: &[u8], trans_id: TransId) -> Result<SocketAddr, StunError> {
    if buf.len() < 8 {
        return Err(StunError::Parse("XOR-MAPPED-ADDRESS too short".into()));
    }
    let port = (((buf[2] as u16) << 8) | (buf[3] as u16)) ^ 0x2112;
    let ip_buf = &buf[4..];
    let ip = match buf[1] {
        1 => {
            let mut bytes = [0_u8; 4];
            for i in 0..4 {
                bytes[i] = ip_buf[i] ^ MAGIC[i];
            }
            IpAddr::V4(bytes.into())
        }
        2 if ip_buf.len() >= 16 => {
            let mut bytes = [0_u8; 16];
            for i in 0..4 {
                bytes[i] = ip_buf[i] ^ MAGIC[i];
            }
            for i in 4..16 {
                bytes[i] = ip_buf[i] ^ trans_id.0[i - 4];
            }
            IpAddr::V6(bytes.into())
        }
        e => {
            return Err(StunError::Parse(format!("Invalid address family: {e:?}")));
        }
    };

    Ok(SocketAddr::new(ip, port))
}

impl fmt::Debug for StunMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StunMessage")
            .field("method", &self.method)
            .field("class", &self.class)
            .field("trans_id", &self.trans_id)
            .field("attrs", &self.attrs)
            .field("integrity_len", &self.integrity.len())
            .finish()
    }
}
