use std::{error, fmt, net::IpAddr};

use log::debug;

pub const IKE_HEADER_LEN: usize = 28;
pub const MAX_IKE_MESSAGE_LEN: usize = 65535;

pub const IKEV2_MAJOR_VERSION: u8 = 2;
pub const IKEV2_MINOR_VERSION: u8 = 0;

const GENERIC_PAYLOAD_HEADER_LEN: usize = 4;
const CRITICAL_BIT: u8 = 1 << 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const IKE_SA_INIT: ExchangeType = ExchangeType(34);
    pub const IKE_AUTH: ExchangeType = ExchangeType(35);
    pub const CREATE_CHILD_SA: ExchangeType = ExchangeType(36);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(37);

    fn from_u8(value: u8) -> Result<ExchangeType, FormatError> {
        if value >= Self::IKE_SA_INIT.0 && value <= Self::INFORMATIONAL.0 {
            Ok(ExchangeType(value))
        } else {
            debug!("Unsupported IKEv2 Exchange Type {}", value);
            Err("Unsupported IKEv2 Exchange Type".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE_SA_INIT => write!(f, "IKE_SA_INIT"),
            Self::IKE_AUTH => write!(f, "IKE_AUTH"),
            Self::CREATE_CHILD_SA => write!(f, "CREATE_CHILD_SA"),
            Self::INFORMATIONAL => write!(f, "INFORMATIONAL"),
            _ => write!(f, "Unknown exchange type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const INITIATOR: Flags = Flags(1 << 3);
    pub const VERSION: Flags = Flags(1 << 4);
    pub const RESPONSE: Flags = Flags(1 << 5);

    fn from_u8(value: u8) -> Result<Flags, FormatError> {
        const RESERVED_MASK: u8 =
            0xff & !Flags::INITIATOR.0 & !Flags::VERSION.0 & !Flags::RESPONSE.0;
        if value & RESERVED_MASK != 0x00 {
            debug!("IKEv2 reserved flags are set {}", value & RESERVED_MASK);
            return Err("IKEv2 reserved flags are set".into());
        }
        Ok(Flags(value))
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(&self, flag: Flags) -> Flags {
        Flags(self.0 | flag.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Flags::INITIATOR) {
            f.write_str("Initiator")?;
        }
        if self.has(Flags::VERSION) {
            f.write_str("Version")?;
        }
        if self.has(Flags::RESPONSE) {
            f.write_str("Response")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(33);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(34);
    pub const ID_INITIATOR: PayloadType = PayloadType(35);
    pub const ID_RESPONDER: PayloadType = PayloadType(36);
    pub const CERTIFICATE: PayloadType = PayloadType(37);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(38);
    pub const AUTHENTICATION: PayloadType = PayloadType(39);
    pub const NONCE: PayloadType = PayloadType(40);
    pub const NOTIFY: PayloadType = PayloadType(41);
    pub const DELETE: PayloadType = PayloadType(42);
    pub const VENDOR_ID: PayloadType = PayloadType(43);
    pub const TRAFFIC_SELECTOR_INITIATOR: PayloadType = PayloadType(44);
    pub const TRAFFIC_SELECTOR_RESPONDER: PayloadType = PayloadType(45);
    pub const ENCRYPTED_AND_AUTHENTICATED: PayloadType = PayloadType(46);
    pub const CONFIGURATION: PayloadType = PayloadType(47);
    pub const EXTENSIBLE_AUTHENTICATION: PayloadType = PayloadType(48);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }

    fn is_known(&self) -> bool {
        (self.0 >= Self::SECURITY_ASSOCIATION.0 && self.0 <= Self::EXTENSIBLE_AUTHENTICATION.0)
            || self.0 == Self::NONE.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload"),
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association"),
            Self::KEY_EXCHANGE => write!(f, "Key Exchange"),
            Self::ID_INITIATOR => write!(f, "Identification - Initiator"),
            Self::ID_RESPONDER => write!(f, "Identification - Responder"),
            Self::CERTIFICATE => write!(f, "Certificate"),
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request"),
            Self::AUTHENTICATION => write!(f, "Authentication"),
            Self::NONCE => write!(f, "Nonce"),
            Self::NOTIFY => write!(f, "Notify"),
            Self::DELETE => write!(f, "Delete"),
            Self::VENDOR_ID => write!(f, "Vendor ID"),
            Self::TRAFFIC_SELECTOR_INITIATOR => write!(f, "Traffic Selector - Initiator"),
            Self::TRAFFIC_SELECTOR_RESPONDER => write!(f, "Traffic Selector - Responder"),
            Self::ENCRYPTED_AND_AUTHENTICATED => write!(f, "Encrypted and Authenticated"),
            Self::CONFIGURATION => write!(f, "Configuration"),
            Self::EXTENSIBLE_AUTHENTICATION => write!(f, "Extensible Authentication"),
            _ => write!(f, "Unknown payload type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const IKE: ProtocolId = ProtocolId(1);
    pub const AH: ProtocolId = ProtocolId(2);
    pub const ESP: ProtocolId = ProtocolId(3);

    fn from_u8(value: u8) -> Result<ProtocolId, FormatError> {
        if value >= Self::IKE.0 && value <= Self::ESP.0 {
            Ok(ProtocolId(value))
        } else {
            debug!("Unsupported IKEv2 IPSec Protocol ID {}", value);
            Err("Unsupported IKEv2 IPSec Protocol ID".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE => write!(f, "IKE"),
            Self::AH => write!(f, "AH"),
            Self::ESP => write!(f, "ESP"),
            _ => write!(f, "Unknown IPSec Protocol ID {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransformType(u8, u16);

// See http://www.iana.org/assignments/ikev2-parameters/ for additional values.
impl TransformType {
    pub const ENCR_AES_CBC: TransformType = TransformType(1, 12);
    pub const ENCR_AES_GCM_16: TransformType = TransformType(1, 20);
    pub const ENCR_CHACHA20_POLY1305: TransformType = TransformType(1, 28);

    pub const PRF_HMAC_SHA2_256: TransformType = TransformType(2, 5);
    pub const PRF_HMAC_SHA2_384: TransformType = TransformType(2, 6);

    pub const AUTH_HMAC_SHA2_256_128: TransformType = TransformType(3, 12);

    pub const DH_2048_MODP: TransformType = TransformType(4, 14);
    pub const DH_256_ECP: TransformType = TransformType(4, 19);
    pub const DH_384_ECP: TransformType = TransformType(4, 20);
    pub const DH_CURVE25519: TransformType = TransformType(4, 31);

    pub const NO_ESN: TransformType = TransformType(5, 0);
    pub const ESN: TransformType = TransformType(5, 1);

    pub const TYPE_ENCR: u8 = 1;
    pub const TYPE_PRF: u8 = 2;
    pub const TYPE_INTEG: u8 = 3;
    pub const TYPE_DH: u8 = 4;
    pub const TYPE_ESN: u8 = 5;

    pub fn from_raw(transform_type: u8, transform_id: u16) -> Result<TransformType, FormatError> {
        if (1..=5).contains(&transform_type) {
            Ok(TransformType(transform_type, transform_id))
        } else {
            debug!(
                "Unsupported IKEv2 Transform Type {} ID {}",
                transform_type, transform_id
            );
            Err("Unsupported IKEv2 Transform Type".into())
        }
    }

    pub fn type_id(&self) -> (u8, u16) {
        (self.0, self.1)
    }

    pub fn dh_from_group(group: u16) -> TransformType {
        TransformType(Self::TYPE_DH, group)
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ENCR_AES_CBC => write!(f, "ENCR_AES_CBC"),
            Self::ENCR_AES_GCM_16 => write!(f, "ENCR_AES_GCM_16"),
            Self::ENCR_CHACHA20_POLY1305 => write!(f, "ENCR_CHACHA20_POLY1305"),
            Self::PRF_HMAC_SHA2_256 => write!(f, "PRF_HMAC_SHA2_256"),
            Self::PRF_HMAC_SHA2_384 => write!(f, "PRF_HMAC_SHA2_384"),
            Self::AUTH_HMAC_SHA2_256_128 => write!(f, "AUTH_HMAC_SHA2_256_128"),
            Self::DH_2048_MODP => write!(f, "DH_2048_MODP"),
            Self::DH_256_ECP => write!(f, "DH_256_ECP"),
            Self::DH_384_ECP => write!(f, "DH_384_ECP"),
            Self::DH_CURVE25519 => write!(f, "DH_CURVE25519"),
            Self::NO_ESN => write!(f, "NO_ESN"),
            Self::ESN => write!(f, "ESN"),
            _ => write!(f, "Unknown transform type {} id {}", self.0, self.1),
        }
    }
}

pub const TRANSFORM_ATTRIBUTE_KEY_LENGTH: u16 = 14;
const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NotifyMessageType(u16);

impl NotifyMessageType {
    pub const UNSUPPORTED_CRITICAL_PAYLOAD: NotifyMessageType = NotifyMessageType(1);
    pub const INVALID_SYNTAX: NotifyMessageType = NotifyMessageType(7);
    pub const NO_PROPOSAL_CHOSEN: NotifyMessageType = NotifyMessageType(14);
    pub const INVALID_KE_PAYLOAD: NotifyMessageType = NotifyMessageType(17);
    pub const AUTHENTICATION_FAILED: NotifyMessageType = NotifyMessageType(24);
    pub const TS_UNACCEPTABLE: NotifyMessageType = NotifyMessageType(38);
    pub const NO_ADDITIONAL_SAS: NotifyMessageType = NotifyMessageType(35);

    pub const INITIAL_CONTACT: NotifyMessageType = NotifyMessageType(16384);
    pub const COOKIE: NotifyMessageType = NotifyMessageType(16390);
    pub const USE_TRANSPORT_MODE: NotifyMessageType = NotifyMessageType(16391);
    pub const REKEY_SA: NotifyMessageType = NotifyMessageType(16393);

    pub fn from_u16(value: u16) -> NotifyMessageType {
        NotifyMessageType(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    // Error-class notifications occupy the range below 16384.
    pub fn is_error(&self) -> bool {
        self.0 < 16384
    }
}

impl fmt::Display for NotifyMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSUPPORTED_CRITICAL_PAYLOAD => write!(f, "UNSUPPORTED_CRITICAL_PAYLOAD"),
            Self::INVALID_SYNTAX => write!(f, "INVALID_SYNTAX"),
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO_PROPOSAL_CHOSEN"),
            Self::INVALID_KE_PAYLOAD => write!(f, "INVALID_KE_PAYLOAD"),
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION_FAILED"),
            Self::TS_UNACCEPTABLE => write!(f, "TS_UNACCEPTABLE"),
            Self::NO_ADDITIONAL_SAS => write!(f, "NO_ADDITIONAL_SAS"),
            Self::INITIAL_CONTACT => write!(f, "INITIAL_CONTACT"),
            Self::COOKIE => write!(f, "COOKIE"),
            Self::USE_TRANSPORT_MODE => write!(f, "USE_TRANSPORT_MODE"),
            Self::REKEY_SA => write!(f, "REKEY_SA"),
            _ => write!(f, "Unknown Notify Message Type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AuthMethod(u8);

impl AuthMethod {
    pub const RSA_DIGITAL_SIGNATURE: AuthMethod = AuthMethod(1);
    pub const SHARED_KEY_MESSAGE_INTEGRITY_CODE: AuthMethod = AuthMethod(2);

    pub fn from_u8(value: u8) -> AuthMethod {
        AuthMethod(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RSA_DIGITAL_SIGNATURE => write!(f, "RSA Digital Signature"),
            Self::SHARED_KEY_MESSAGE_INTEGRITY_CODE => {
                write!(f, "Shared Key Message Integrity Code")
            }
            _ => write!(f, "Unknown auth method {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IdentificationType(u8);

impl IdentificationType {
    pub const ID_IPV4_ADDR: IdentificationType = IdentificationType(1);
    pub const ID_FQDN: IdentificationType = IdentificationType(2);
    pub const ID_RFC822_ADDR: IdentificationType = IdentificationType(3);
    pub const ID_IPV6_ADDR: IdentificationType = IdentificationType(5);
    pub const ID_DER_ASN1_DN: IdentificationType = IdentificationType(9);

    pub fn from_u8(value: u8) -> IdentificationType {
        IdentificationType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CertificateEncoding(u8);

impl CertificateEncoding {
    pub const X509_SIGNATURE: CertificateEncoding = CertificateEncoding(4);

    pub fn from_u8(value: u8) -> CertificateEncoding {
        CertificateEncoding(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TrafficSelectorType(u8);

impl TrafficSelectorType {
    pub const TS_IPV4_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(7);
    pub const TS_IPV6_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(8);

    fn from_u8(value: u8) -> Result<TrafficSelectorType, FormatError> {
        if value == Self::TS_IPV4_ADDR_RANGE.0 || value == Self::TS_IPV6_ADDR_RANGE.0 {
            Ok(TrafficSelectorType(value))
        } else {
            debug!("Unsupported IKEv2 Traffic Selector Type {}", value);
            Err("Unsupported IKEv2 Traffic Selector Type".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

// IKE header, RFC 7296 Section 3.1.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IkeHeader {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: PayloadType,
    pub major_version: u8,
    pub minor_version: u8,
    pub exchange_type: ExchangeType,
    pub flags: Flags,
    pub message_id: u32,
    pub length: u32,
}

impl IkeHeader {
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        exchange_type: ExchangeType,
        flags: Flags,
        message_id: u32,
    ) -> IkeHeader {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload: PayloadType::NONE,
            major_version: IKEV2_MAJOR_VERSION,
            minor_version: IKEV2_MINOR_VERSION,
            exchange_type,
            flags,
            message_id,
            length: IKE_HEADER_LEN as u32,
        }
    }

    pub fn decode(b: &[u8]) -> Result<IkeHeader, FormatError> {
        if b.len() < IKE_HEADER_LEN {
            debug!("Not enough data in IKEv2 header ({} bytes)", b.len());
            return Err("Not enough data in IKEv2 header".into());
        }
        let mut spi = [0u8; 8];
        spi.copy_from_slice(&b[0..8]);
        let initiator_spi = u64::from_be_bytes(spi);
        spi.copy_from_slice(&b[8..16]);
        let responder_spi = u64::from_be_bytes(spi);
        let next_payload = PayloadType::from_u8(b[16]);
        let major_version = b[17] >> 4;
        let minor_version = b[17] & 0x0f;
        if major_version != IKEV2_MAJOR_VERSION {
            debug!(
                "Unsupported major version {}.{}",
                major_version, minor_version
            );
            return Err("Unsupported IKEv2 major version".into());
        }
        let exchange_type = ExchangeType::from_u8(b[18])?;
        let flags = Flags::from_u8(b[19])?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&b[20..24]);
        let message_id = u32::from_be_bytes(word);
        word.copy_from_slice(&b[24..28]);
        let length = u32::from_be_bytes(word);
        if (length as usize) < IKE_HEADER_LEN || (length as usize) > MAX_IKE_MESSAGE_LEN {
            debug!("Bad message length in header {}", length);
            return Err("Bad message length in IKEv2 header".into());
        }
        Ok(IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            major_version,
            minor_version,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    pub fn encode(&self) -> [u8; IKE_HEADER_LEN] {
        let mut b = [0u8; IKE_HEADER_LEN];
        b[0..8].copy_from_slice(&self.initiator_spi.to_be_bytes());
        b[8..16].copy_from_slice(&self.responder_spi.to_be_bytes());
        b[16] = self.next_payload.type_id();
        b[17] = self.major_version << 4 | self.minor_version;
        b[18] = self.exchange_type.type_id();
        b[19] = self.flags.0;
        b[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        b[24..28].copy_from_slice(&self.length.to_be_bytes());
        b
    }

    pub fn is_response(&self) -> bool {
        self.flags.has(Flags::RESPONSE)
    }

    pub fn is_request(&self) -> bool {
        !self.is_response()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SaTransform {
    pub transform_type: TransformType,
    pub key_length: Option<u16>,
}

impl SaTransform {
    pub fn new(transform_type: TransformType) -> SaTransform {
        SaTransform {
            transform_type,
            key_length: None,
        }
    }

    pub fn with_key_length(transform_type: TransformType, key_length: u16) -> SaTransform {
        SaTransform {
            transform_type,
            key_length: Some(key_length),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Proposal {
    pub number: u8,
    pub protocol_id: ProtocolId,
    pub spi: Vec<u8>,
    pub transforms: Vec<SaTransform>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NotifyPayload {
    pub protocol_id: Option<ProtocolId>,
    pub spi: Vec<u8>,
    pub message_type: NotifyMessageType,
    pub data: Vec<u8>,
}

impl NotifyPayload {
    pub fn new(message_type: NotifyMessageType) -> NotifyPayload {
        NotifyPayload {
            protocol_id: None,
            spi: vec![],
            message_type,
            data: vec![],
        }
    }

    pub fn with_data(message_type: NotifyMessageType, data: Vec<u8>) -> NotifyPayload {
        NotifyPayload {
            protocol_id: None,
            spi: vec![],
            message_type,
            data,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DeletePayload {
    pub protocol_id: ProtocolId,
    pub spis: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IdPayload {
    pub id_type: IdentificationType,
    pub data: Vec<u8>,
}

impl IdPayload {
    // The ID payload body is part of the AUTH signed octets.
    pub fn body(&self) -> Vec<u8> {
        let mut b = vec![0u8; 4 + self.data.len()];
        b[0] = self.id_type.type_id();
        b[4..].copy_from_slice(&self.data);
        b
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TrafficSelector {
    pub ts_type: TrafficSelectorType,
    pub ip_protocol_id: u8,
    pub start_port: u16,
    pub end_port: u16,
    pub start_addr: IpAddr,
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    pub fn from_address(addr: IpAddr) -> TrafficSelector {
        let ts_type = match addr {
            IpAddr::V4(_) => TrafficSelectorType::TS_IPV4_ADDR_RANGE,
            IpAddr::V6(_) => TrafficSelectorType::TS_IPV6_ADDR_RANGE,
        };
        TrafficSelector {
            ts_type,
            ip_protocol_id: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: addr,
            end_addr: addr,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    SecurityAssociation(Vec<Proposal>),
    KeyExchange {
        group: u16,
        data: Vec<u8>,
    },
    Nonce(Vec<u8>),
    Notify(NotifyPayload),
    Delete(DeletePayload),
    IdInitiator(IdPayload),
    IdResponder(IdPayload),
    Certificate {
        encoding: CertificateEncoding,
        data: Vec<u8>,
    },
    CertificateRequest {
        encoding: CertificateEncoding,
        data: Vec<u8>,
    },
    Authentication {
        method: AuthMethod,
        data: Vec<u8>,
    },
    TrafficSelectorInitiator(Vec<TrafficSelector>),
    TrafficSelectorResponder(Vec<TrafficSelector>),
    Encrypted {
        first_payload: PayloadType,
        data: Vec<u8>,
    },
    Vendor(Vec<u8>),
    // Unknown non-critical payloads are carried through verbatim.
    Unknown {
        payload_type: u8,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::SecurityAssociation(_) => PayloadType::SECURITY_ASSOCIATION,
            Self::KeyExchange { .. } => PayloadType::KEY_EXCHANGE,
            Self::Nonce(_) => PayloadType::NONCE,
            Self::Notify(_) => PayloadType::NOTIFY,
            Self::Delete(_) => PayloadType::DELETE,
            Self::IdInitiator(_) => PayloadType::ID_INITIATOR,
            Self::IdResponder(_) => PayloadType::ID_RESPONDER,
            Self::Certificate { .. } => PayloadType::CERTIFICATE,
            Self::CertificateRequest { .. } => PayloadType::CERTIFICATE_REQUEST,
            Self::Authentication { .. } => PayloadType::AUTHENTICATION,
            Self::TrafficSelectorInitiator(_) => PayloadType::TRAFFIC_SELECTOR_INITIATOR,
            Self::TrafficSelectorResponder(_) => PayloadType::TRAFFIC_SELECTOR_RESPONDER,
            Self::Encrypted { .. } => PayloadType::ENCRYPTED_AND_AUTHENTICATED,
            Self::Vendor(_) => PayloadType::VENDOR_ID,
            Self::Unknown { payload_type, .. } => PayloadType::from_u8(*payload_type),
        }
    }

    fn decode(payload_type: PayloadType, b: &[u8], next_payload: u8) -> Result<Payload, FormatError> {
        match payload_type {
            PayloadType::SECURITY_ASSOCIATION => Ok(Self::SecurityAssociation(decode_proposals(b)?)),
            PayloadType::KEY_EXCHANGE => {
                if b.len() < 4 {
                    debug!("Not enough data in key exchange payload");
                    return Err("Not enough data in key exchange payload".into());
                }
                let mut group = [0u8; 2];
                group.copy_from_slice(&b[0..2]);
                Ok(Self::KeyExchange {
                    group: u16::from_be_bytes(group),
                    data: b[4..].to_vec(),
                })
            }
            PayloadType::NONCE => Ok(Self::Nonce(b.to_vec())),
            PayloadType::NOTIFY => Ok(Self::Notify(decode_notify(b)?)),
            PayloadType::DELETE => Ok(Self::Delete(decode_delete(b)?)),
            PayloadType::ID_INITIATOR | PayloadType::ID_RESPONDER => {
                if b.len() < 4 {
                    debug!("Not enough data in identification payload");
                    return Err("Not enough data in identification payload".into());
                }
                let id = IdPayload {
                    id_type: IdentificationType::from_u8(b[0]),
                    data: b[4..].to_vec(),
                };
                if payload_type == PayloadType::ID_INITIATOR {
                    Ok(Self::IdInitiator(id))
                } else {
                    Ok(Self::IdResponder(id))
                }
            }
            PayloadType::CERTIFICATE | PayloadType::CERTIFICATE_REQUEST => {
                if b.is_empty() {
                    debug!("Not enough data in certificate payload");
                    return Err("Not enough data in certificate payload".into());
                }
                let encoding = CertificateEncoding::from_u8(b[0]);
                let data = b[1..].to_vec();
                if payload_type == PayloadType::CERTIFICATE {
                    Ok(Self::Certificate { encoding, data })
                } else {
                    Ok(Self::CertificateRequest { encoding, data })
                }
            }
            PayloadType::AUTHENTICATION => {
                if b.len() < 4 {
                    debug!("Not enough data in authentication payload");
                    return Err("Not enough data in authentication payload".into());
                }
                Ok(Self::Authentication {
                    method: AuthMethod::from_u8(b[0]),
                    data: b[4..].to_vec(),
                })
            }
            PayloadType::TRAFFIC_SELECTOR_INITIATOR | PayloadType::TRAFFIC_SELECTOR_RESPONDER => {
                let selectors = decode_traffic_selectors(b)?;
                if payload_type == PayloadType::TRAFFIC_SELECTOR_INITIATOR {
                    Ok(Self::TrafficSelectorInitiator(selectors))
                } else {
                    Ok(Self::TrafficSelectorResponder(selectors))
                }
            }
            PayloadType::ENCRYPTED_AND_AUTHENTICATED => Ok(Self::Encrypted {
                first_payload: PayloadType::from_u8(next_payload),
                data: b.to_vec(),
            }),
            PayloadType::VENDOR_ID => Ok(Self::Vendor(b.to_vec())),
            _ => Ok(Self::Unknown {
                payload_type: payload_type.type_id(),
                data: b.to_vec(),
            }),
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Self::SecurityAssociation(proposals) => encode_proposals(proposals),
            Self::KeyExchange { group, data } => {
                let mut b = vec![0u8; 4 + data.len()];
                b[0..2].copy_from_slice(&group.to_be_bytes());
                b[4..].copy_from_slice(data);
                b
            }
            Self::Nonce(data) => data.clone(),
            Self::Notify(notify) => encode_notify(notify),
            Self::Delete(delete) => encode_delete(delete),
            Self::IdInitiator(id) | Self::IdResponder(id) => id.body(),
            Self::Certificate { encoding, data } | Self::CertificateRequest { encoding, data } => {
                let mut b = vec![0u8; 1 + data.len()];
                b[0] = encoding.type_id();
                b[1..].copy_from_slice(data);
                b
            }
            Self::Authentication { method, data } => {
                let mut b = vec![0u8; 4 + data.len()];
                b[0] = method.type_id();
                b[4..].copy_from_slice(data);
                b
            }
            Self::TrafficSelectorInitiator(selectors)
            | Self::TrafficSelectorResponder(selectors) => encode_traffic_selectors(selectors),
            Self::Encrypted { data, .. } => data.clone(),
            Self::Vendor(data) => data.clone(),
            Self::Unknown { data, .. } => data.clone(),
        }
    }

    fn next_payload_override(&self) -> Option<PayloadType> {
        // The SK payload's next field names the first payload inside the envelope.
        match self {
            Self::Encrypted { first_payload, .. } => Some(*first_payload),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Payloads {
    items: Vec<Payload>,
}

impl Payloads {
    pub fn new() -> Payloads {
        Payloads { items: vec![] }
    }

    pub fn push(&mut self, payload: Payload) {
        self.items.push(payload);
    }

    pub fn get(&self, payload_type: PayloadType) -> Option<&Payload> {
        self.items
            .iter()
            .find(|pl| pl.payload_type() == payload_type)
    }

    pub fn iter(&self) -> std::slice::Iter<Payload> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first_payload_type(&self) -> PayloadType {
        self.items
            .first()
            .map(|pl| pl.payload_type())
            .unwrap_or(PayloadType::NONE)
    }

    // Checks that all essential payload types of an exchange are present.
    pub fn ensure(&self, payload_types: &[PayloadType]) -> Result<(), FormatError> {
        for payload_type in payload_types {
            if self.get(*payload_type).is_none() {
                debug!("Essential payload {} is missing", payload_type);
                return Err("Essential payload is missing".into());
            }
        }
        Ok(())
    }

    pub fn security_association(&self) -> Option<&[Proposal]> {
        match self.get(PayloadType::SECURITY_ASSOCIATION) {
            Some(Payload::SecurityAssociation(proposals)) => Some(proposals.as_slice()),
            _ => None,
        }
    }

    pub fn key_exchange(&self) -> Option<(u16, &[u8])> {
        match self.get(PayloadType::KEY_EXCHANGE) {
            Some(Payload::KeyExchange { group, data }) => Some((*group, data.as_slice())),
            _ => None,
        }
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        match self.get(PayloadType::NONCE) {
            Some(Payload::Nonce(data)) => Some(data.as_slice()),
            _ => None,
        }
    }

    pub fn notifications(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.items.iter().filter_map(|pl| match pl {
            Payload::Notify(notify) => Some(notify),
            _ => None,
        })
    }

    pub fn notification(&self, message_type: NotifyMessageType) -> Option<&NotifyPayload> {
        self.notifications()
            .find(|notify| notify.message_type == message_type)
    }

    pub fn encrypted(&self) -> Option<(PayloadType, &[u8])> {
        match self.get(PayloadType::ENCRYPTED_AND_AUTHENTICATED) {
            Some(Payload::Encrypted {
                first_payload,
                data,
            }) => Some((*first_payload, data.as_slice())),
            _ => None,
        }
    }

    pub fn identification(&self, initiator: bool) -> Option<&IdPayload> {
        let payload_type = if initiator {
            PayloadType::ID_INITIATOR
        } else {
            PayloadType::ID_RESPONDER
        };
        match self.get(payload_type) {
            Some(Payload::IdInitiator(id)) | Some(Payload::IdResponder(id)) => Some(id),
            _ => None,
        }
    }

    pub fn authentication(&self) -> Option<(AuthMethod, &[u8])> {
        match self.get(PayloadType::AUTHENTICATION) {
            Some(Payload::Authentication { method, data }) => Some((*method, data.as_slice())),
            _ => None,
        }
    }

    pub fn certificate(&self) -> Option<(CertificateEncoding, &[u8])> {
        match self.get(PayloadType::CERTIFICATE) {
            Some(Payload::Certificate { encoding, data }) => Some((*encoding, data.as_slice())),
            _ => None,
        }
    }

    pub fn traffic_selectors(&self, initiator: bool) -> Option<&[TrafficSelector]> {
        let payload_type = if initiator {
            PayloadType::TRAFFIC_SELECTOR_INITIATOR
        } else {
            PayloadType::TRAFFIC_SELECTOR_RESPONDER
        };
        match self.get(payload_type) {
            Some(Payload::TrafficSelectorInitiator(ts))
            | Some(Payload::TrafficSelectorResponder(ts)) => Some(ts.as_slice()),
            _ => None,
        }
    }

    pub fn delete(&self) -> Option<&DeletePayload> {
        match self.get(PayloadType::DELETE) {
            Some(Payload::Delete(delete)) => Some(delete),
            _ => None,
        }
    }
}

impl FromIterator<Payload> for Payloads {
    fn from_iter<T: IntoIterator<Item = Payload>>(iter: T) -> Payloads {
        Payloads {
            items: iter.into_iter().collect(),
        }
    }
}

// A fully decoded (or to-be-encoded) IKEv2 message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub header: IkeHeader,
    pub payloads: Payloads,
}

impl Message {
    pub fn new(header: IkeHeader) -> Message {
        Message {
            header,
            payloads: Payloads::new(),
        }
    }

    pub fn decode(b: &[u8]) -> Result<Message, FormatError> {
        let header = IkeHeader::decode(b)?;
        if b.len() < header.length as usize {
            debug!(
                "Datagram shorter than header length ({} < {})",
                b.len(),
                header.length
            );
            return Err("Datagram shorter than header length".into());
        }
        let payloads = decode_payloads(
            &b[IKE_HEADER_LEN..header.length as usize],
            header.next_payload,
        )?;
        Ok(Message { header, payloads })
    }

    // Plaintext encoding; SK envelopes are sealed by the TKM before this step.
    pub fn encode(&mut self) -> Result<Vec<u8>, FormatError> {
        let body = encode_payloads(&self.payloads);
        self.header.next_payload = self.payloads.first_payload_type();
        let length = IKE_HEADER_LEN + body.len();
        if length > MAX_IKE_MESSAGE_LEN {
            debug!("Message too large to encode ({} bytes)", length);
            return Err("Message too large to encode".into());
        }
        self.header.length = length as u32;
        let mut b = Vec::with_capacity(length);
        b.extend_from_slice(&self.header.encode());
        b.extend_from_slice(&body);
        Ok(b)
    }
}

pub fn decode_payloads(b: &[u8], first: PayloadType) -> Result<Payloads, FormatError> {
    let mut payloads = Payloads::new();
    let mut next_payload = first.type_id();
    let mut data = b;
    while next_payload != PayloadType::NONE.type_id() {
        if data.len() < GENERIC_PAYLOAD_HEADER_LEN {
            debug!("Not enough data in payload header");
            return Err("Not enough data in payload header".into());
        }
        let chained_next = data[0];
        let flags = data[1];
        let mut length = [0u8; 2];
        length.copy_from_slice(&data[2..4]);
        let length = u16::from_be_bytes(length) as usize;
        if length < GENERIC_PAYLOAD_HEADER_LEN {
            debug!("Payload length {} too short", length);
            return Err("Payload length too short".into());
        }
        if length > data.len() {
            debug!("Payload overflow ({} > {})", length, data.len());
            return Err("Payload overflow".into());
        }
        let critical = flags & CRITICAL_BIT != 0;
        let payload_type = PayloadType::from_u8(next_payload);
        if !payload_type.is_known() && critical {
            debug!("Unknown critical payload {}", next_payload);
            return Err("Unknown critical payload".into());
        }
        let payload = Payload::decode(
            payload_type,
            &data[GENERIC_PAYLOAD_HEADER_LEN..length],
            chained_next,
        )?;
        let is_encrypted = matches!(payload, Payload::Encrypted { .. });
        payloads.push(payload);
        if is_encrypted {
            // Everything after the SK payload is covered by its ICV.
            break;
        }
        next_payload = chained_next;
        data = &data[length..];
    }
    Ok(payloads)
}

pub fn encode_payloads(payloads: &Payloads) -> Vec<u8> {
    let mut b = vec![];
    let count = payloads.iter().len();
    for (i, payload) in payloads.iter().enumerate() {
        let body = payload.encode_body();
        let next = if let Some(next) = payload.next_payload_override() {
            next
        } else if i + 1 < count {
            payloads
                .iter()
                .nth(i + 1)
                .map(|pl| pl.payload_type())
                .unwrap_or(PayloadType::NONE)
        } else {
            PayloadType::NONE
        };
        let length = (GENERIC_PAYLOAD_HEADER_LEN + body.len()) as u16;
        b.push(next.type_id());
        b.push(0);
        b.extend_from_slice(&length.to_be_bytes());
        b.extend_from_slice(&body);
    }
    b
}

fn decode_proposals(b: &[u8]) -> Result<Vec<Proposal>, FormatError> {
    let mut proposals = vec![];
    let mut data = b;
    while !data.is_empty() {
        if data.len() < 8 {
            debug!("Not enough data in security association proposal");
            return Err("Not enough data in security association proposal".into());
        }
        let last_substruct = data[0];
        let mut length = [0u8; 2];
        length.copy_from_slice(&data[2..4]);
        let length = u16::from_be_bytes(length) as usize;
        if length < 8 || length > data.len() {
            debug!("Proposal overflow");
            return Err("Proposal overflow".into());
        }
        if last_substruct == 0 && data.len() != length {
            debug!("Unaccounted proposal bytes");
            return Err("Unaccounted proposal bytes".into());
        }
        let number = data[4];
        let protocol_id = ProtocolId::from_u8(data[5])?;
        let spi_size = data[6] as usize;
        let num_transforms = data[7] as usize;
        if length < 8 + spi_size {
            debug!("Proposal SPI overflow");
            return Err("Proposal SPI overflow".into());
        }
        let spi = data[8..8 + spi_size].to_vec();
        let transforms = decode_transforms(&data[8 + spi_size..length], num_transforms)?;
        proposals.push(Proposal {
            number,
            protocol_id,
            spi,
            transforms,
        });
        data = &data[length..];
    }
    Ok(proposals)
}

fn decode_transforms(b: &[u8], num_transforms: usize) -> Result<Vec<SaTransform>, FormatError> {
    let mut transforms = vec![];
    let mut data = b;
    while !data.is_empty() {
        if data.len() < 8 {
            debug!("Not enough data in transform substructure");
            return Err("Not enough data in transform substructure".into());
        }
        let mut length = [0u8; 2];
        length.copy_from_slice(&data[2..4]);
        let length = u16::from_be_bytes(length) as usize;
        if length < 8 || length > data.len() {
            debug!("Transform overflow");
            return Err("Transform overflow".into());
        }
        let transform_type = data[4];
        let mut transform_id = [0u8; 2];
        transform_id.copy_from_slice(&data[6..8]);
        let transform_id = u16::from_be_bytes(transform_id);
        let transform_type = TransformType::from_raw(transform_type, transform_id)?;
        let key_length = decode_key_length_attribute(&data[8..length])?;
        transforms.push(SaTransform {
            transform_type,
            key_length,
        });
        data = &data[length..];
    }
    if transforms.len() != num_transforms {
        debug!(
            "Transform count mismatch ({} listed, {} decoded)",
            num_transforms,
            transforms.len()
        );
        return Err("Transform count mismatch".into());
    }
    Ok(transforms)
}

fn decode_key_length_attribute(b: &[u8]) -> Result<Option<u16>, FormatError> {
    let mut data = b;
    let mut key_length = None;
    while !data.is_empty() {
        if data.len() < 4 {
            debug!("Not enough data in transform attribute");
            return Err("Not enough data in transform attribute".into());
        }
        let mut attribute_type = [0u8; 2];
        attribute_type.copy_from_slice(&data[0..2]);
        let attribute_type = u16::from_be_bytes(attribute_type);
        if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
            let mut value = [0u8; 2];
            value.copy_from_slice(&data[2..4]);
            if attribute_type & !ATTRIBUTE_FORMAT_TV == TRANSFORM_ATTRIBUTE_KEY_LENGTH {
                key_length = Some(u16::from_be_bytes(value));
            }
            data = &data[4..];
        } else {
            let mut length = [0u8; 2];
            length.copy_from_slice(&data[2..4]);
            let length = u16::from_be_bytes(length) as usize;
            if length < 4 || length > data.len() {
                debug!("Transform attribute overflow");
                return Err("Transform attribute overflow".into());
            }
            data = &data[length..];
        }
    }
    Ok(key_length)
}

fn encode_proposals(proposals: &[Proposal]) -> Vec<u8> {
    let mut b = vec![];
    for (i, proposal) in proposals.iter().enumerate() {
        let last_substruct = if i + 1 == proposals.len() { 0 } else { 2 };
        let transforms = encode_sa_transforms(&proposal.transforms);
        let length = (8 + proposal.spi.len() + transforms.len()) as u16;
        b.push(last_substruct);
        b.push(0);
        b.extend_from_slice(&length.to_be_bytes());
        b.push(proposal.number);
        b.push(proposal.protocol_id.type_id());
        b.push(proposal.spi.len() as u8);
        b.push(proposal.transforms.len() as u8);
        b.extend_from_slice(&proposal.spi);
        b.extend_from_slice(&transforms);
    }
    b
}

fn encode_sa_transforms(transforms: &[SaTransform]) -> Vec<u8> {
    let mut b = vec![];
    for (i, transform) in transforms.iter().enumerate() {
        let last_substruct = if i + 1 == transforms.len() { 0 } else { 3 };
        let attribute_len = if transform.key_length.is_some() { 4 } else { 0 };
        let length = (8 + attribute_len) as u16;
        let (transform_type, transform_id) = transform.transform_type.type_id();
        b.push(last_substruct);
        b.push(0);
        b.extend_from_slice(&length.to_be_bytes());
        b.push(transform_type);
        b.push(0);
        b.extend_from_slice(&transform_id.to_be_bytes());
        if let Some(key_length) = transform.key_length {
            let attribute_type = ATTRIBUTE_FORMAT_TV | TRANSFORM_ATTRIBUTE_KEY_LENGTH;
            b.extend_from_slice(&attribute_type.to_be_bytes());
            b.extend_from_slice(&key_length.to_be_bytes());
        }
    }
    b
}

fn decode_notify(b: &[u8]) -> Result<NotifyPayload, FormatError> {
    if b.len() < 4 {
        debug!("Not enough data in notify payload");
        return Err("Not enough data in notify payload".into());
    }
    let protocol_id = if b[0] != 0 {
        Some(ProtocolId::from_u8(b[0])?)
    } else {
        None
    };
    let spi_size = b[1] as usize;
    if b.len() < 4 + spi_size {
        debug!("Notify SPI overflow");
        return Err("Notify SPI overflow".into());
    }
    let mut message_type = [0u8; 2];
    message_type.copy_from_slice(&b[2..4]);
    Ok(NotifyPayload {
        protocol_id,
        spi: b[4..4 + spi_size].to_vec(),
        message_type: NotifyMessageType::from_u16(u16::from_be_bytes(message_type)),
        data: b[4 + spi_size..].to_vec(),
    })
}

fn encode_notify(notify: &NotifyPayload) -> Vec<u8> {
    let mut b = vec![];
    b.push(notify.protocol_id.map(|p| p.type_id()).unwrap_or(0));
    b.push(notify.spi.len() as u8);
    b.extend_from_slice(&notify.message_type.type_id().to_be_bytes());
    b.extend_from_slice(&notify.spi);
    b.extend_from_slice(&notify.data);
    b
}

fn decode_delete(b: &[u8]) -> Result<DeletePayload, FormatError> {
    if b.len() < 4 {
        debug!("Not enough data in delete payload");
        return Err("Not enough data in delete payload".into());
    }
    let protocol_id = ProtocolId::from_u8(b[0])?;
    let spi_size = b[1] as usize;
    let mut num_spis = [0u8; 2];
    num_spis.copy_from_slice(&b[2..4]);
    let num_spis = u16::from_be_bytes(num_spis) as usize;
    if b.len() < 4 + spi_size * num_spis {
        debug!("Delete SPI overflow");
        return Err("Delete SPI overflow".into());
    }
    let spis = (0..num_spis)
        .map(|i| b[4 + i * spi_size..4 + (i + 1) * spi_size].to_vec())
        .collect();
    Ok(DeletePayload { protocol_id, spis })
}

fn encode_delete(delete: &DeletePayload) -> Vec<u8> {
    let spi_size = delete.spis.first().map(|spi| spi.len()).unwrap_or(0);
    let mut b = vec![];
    b.push(delete.protocol_id.type_id());
    b.push(spi_size as u8);
    b.extend_from_slice(&(delete.spis.len() as u16).to_be_bytes());
    for spi in &delete.spis {
        b.extend_from_slice(spi);
    }
    b
}

fn decode_traffic_selectors(b: &[u8]) -> Result<Vec<TrafficSelector>, FormatError> {
    if b.len() < 4 {
        debug!("Not enough data in traffic selector payload");
        return Err("Not enough data in traffic selector payload".into());
    }
    let num_selectors = b[0] as usize;
    let mut selectors = vec![];
    let mut data = &b[4..];
    for _ in 0..num_selectors {
        if data.len() < 8 {
            debug!("Not enough data in traffic selector");
            return Err("Not enough data in traffic selector".into());
        }
        let ts_type = TrafficSelectorType::from_u8(data[0])?;
        let ip_protocol_id = data[1];
        let mut length = [0u8; 2];
        length.copy_from_slice(&data[2..4]);
        let length = u16::from_be_bytes(length) as usize;
        if length < 8 || length > data.len() {
            debug!("Traffic selector overflow");
            return Err("Traffic selector overflow".into());
        }
        let mut port = [0u8; 2];
        port.copy_from_slice(&data[4..6]);
        let start_port = u16::from_be_bytes(port);
        port.copy_from_slice(&data[6..8]);
        let end_port = u16::from_be_bytes(port);
        let addr_len = match ts_type {
            TrafficSelectorType::TS_IPV4_ADDR_RANGE => 4,
            _ => 16,
        };
        if length != 8 + addr_len * 2 {
            debug!("Traffic selector address length mismatch");
            return Err("Traffic selector address length mismatch".into());
        }
        let start_addr = decode_addr(&data[8..8 + addr_len])?;
        let end_addr = decode_addr(&data[8 + addr_len..8 + addr_len * 2])?;
        selectors.push(TrafficSelector {
            ts_type,
            ip_protocol_id,
            start_port,
            end_port,
            start_addr,
            end_addr,
        });
        data = &data[length..];
    }
    if !data.is_empty() {
        debug!("Unaccounted traffic selector bytes");
        return Err("Unaccounted traffic selector bytes".into());
    }
    Ok(selectors)
}

fn decode_addr(b: &[u8]) -> Result<IpAddr, FormatError> {
    match b.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(b);
            Ok(IpAddr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Ok(IpAddr::from(octets))
        }
        _ => Err("Invalid address length in traffic selector".into()),
    }
}

fn encode_traffic_selectors(selectors: &[TrafficSelector]) -> Vec<u8> {
    let mut b = vec![selectors.len() as u8, 0, 0, 0];
    for ts in selectors {
        let addrs: (Vec<u8>, Vec<u8>) = match (ts.start_addr, ts.end_addr) {
            (IpAddr::V4(start), IpAddr::V4(end)) => {
                (start.octets().to_vec(), end.octets().to_vec())
            }
            (start, end) => {
                let to16 = |addr: IpAddr| match addr {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped().octets().to_vec(),
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                (to16(start), to16(end))
            }
        };
        let length = (8 + addrs.0.len() + addrs.1.len()) as u16;
        b.push(ts.ts_type.type_id());
        b.push(ts.ip_protocol_id);
        b.extend_from_slice(&length.to_be_bytes());
        b.extend_from_slice(&ts.start_port.to_be_bytes());
        b.extend_from_slice(&ts.end_port.to_be_bytes());
        b.extend_from_slice(&addrs.0);
        b.extend_from_slice(&addrs.1);
    }
    b
}

#[derive(Debug)]
pub struct FormatError {
    msg: &'static str,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl error::Error for FormatError {}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError { msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proposals() -> Vec<Proposal> {
        vec![Proposal {
            number: 1,
            protocol_id: ProtocolId::IKE,
            spi: vec![],
            transforms: vec![
                SaTransform::with_key_length(TransformType::ENCR_CHACHA20_POLY1305, 256),
                SaTransform::new(TransformType::PRF_HMAC_SHA2_256),
                SaTransform::new(TransformType::DH_256_ECP),
            ],
        }]
    }

    fn sample_message() -> Message {
        let mut msg = Message::new(IkeHeader::new(
            0x928f3f581f05a563,
            0,
            ExchangeType::IKE_SA_INIT,
            Flags::INITIATOR,
            42,
        ));
        msg.payloads
            .push(Payload::SecurityAssociation(sample_proposals()));
        msg.payloads.push(Payload::KeyExchange {
            group: TransformType::DH_256_ECP.type_id().1,
            data: vec![0xab; 64],
        });
        msg.payloads.push(Payload::Nonce(vec![0x11; 32]));
        msg
    }

    #[test]
    fn header_round_trip() {
        let header = IkeHeader::new(
            0x1122334455667788,
            0x99aabbccddeeff00,
            ExchangeType::IKE_AUTH,
            Flags::INITIATOR.with(Flags::RESPONSE),
            7,
        );
        let decoded = IkeHeader::decode(&header.encode()).expect("decode header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_rejects_short_input() {
        assert!(IkeHeader::decode(&[0u8; IKE_HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn header_rejects_bad_length() {
        let mut header = IkeHeader::new(1, 0, ExchangeType::IKE_SA_INIT, Flags::INITIATOR, 0);
        header.length = (IKE_HEADER_LEN - 1) as u32;
        assert!(IkeHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn message_round_trip() {
        let mut msg = sample_message();
        let encoded = msg.encode().expect("encode message");
        let decoded = Message::decode(&encoded).expect("decode message");
        assert_eq!(msg, decoded);
        // Byte-identical re-encoding.
        let mut decoded = decoded;
        assert_eq!(encoded, decoded.encode().expect("re-encode message"));
    }

    #[test]
    fn notify_round_trip() {
        let mut msg = Message::new(IkeHeader::new(
            5,
            0,
            ExchangeType::IKE_SA_INIT,
            Flags::RESPONSE,
            0,
        ));
        msg.payloads.push(Payload::Notify(NotifyPayload::with_data(
            NotifyMessageType::INVALID_KE_PAYLOAD,
            TransformType::DH_256_ECP.type_id().1.to_be_bytes().to_vec(),
        )));
        let encoded = msg.encode().expect("encode notify");
        let decoded = Message::decode(&encoded).expect("decode notify");
        assert_eq!(msg, decoded);
        let notify = decoded
            .payloads
            .notification(NotifyMessageType::INVALID_KE_PAYLOAD)
            .expect("notify payload");
        assert_eq!(notify.data, vec![0, 19]);
    }

    #[test]
    fn traffic_selector_round_trip() {
        let mut msg = Message::new(IkeHeader::new(
            6,
            7,
            ExchangeType::IKE_AUTH,
            Flags::INITIATOR,
            1,
        ));
        msg.payloads.push(Payload::TrafficSelectorInitiator(vec![
            TrafficSelector::from_address("192.168.10.2".parse().unwrap()),
        ]));
        msg.payloads.push(Payload::TrafficSelectorResponder(vec![
            TrafficSelector::from_address("2001:db8::1".parse().unwrap()),
        ]));
        let encoded = msg.encode().expect("encode selectors");
        assert_eq!(msg, Message::decode(&encoded).expect("decode selectors"));
    }

    #[test]
    fn delete_round_trip() {
        let mut msg = Message::new(IkeHeader::new(
            8,
            9,
            ExchangeType::INFORMATIONAL,
            Flags::INITIATOR,
            2,
        ));
        msg.payloads.push(Payload::Delete(DeletePayload {
            protocol_id: ProtocolId::ESP,
            spis: vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]],
        }));
        let encoded = msg.encode().expect("encode delete");
        assert_eq!(msg, Message::decode(&encoded).expect("decode delete"));
    }

    #[test]
    fn unknown_noncritical_payload_is_preserved() {
        // Payload type 120 is unassigned; the critical bit is clear.
        let mut msg = sample_message();
        msg.payloads.push(Payload::Unknown {
            payload_type: 120,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        });
        let encoded = msg.encode().expect("encode unknown");
        let decoded = Message::decode(&encoded).expect("decode unknown");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn unknown_critical_payload_is_fatal() {
        let mut msg = sample_message();
        msg.payloads.push(Payload::Unknown {
            payload_type: 120,
            data: vec![1, 2, 3],
        });
        let mut encoded = msg.encode().expect("encode");
        // Locate the unknown payload's generic header and set its critical bit.
        let total = encoded.len();
        encoded[total - 7 + 1] |= CRITICAL_BIT;
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn payload_overrun_is_rejected() {
        let mut msg = sample_message();
        let mut encoded = msg.encode().expect("encode");
        // Corrupt the first payload length to overrun the buffer.
        let overrun = (encoded.len() as u16) + 64;
        encoded[IKE_HEADER_LEN + 2..IKE_HEADER_LEN + 4].copy_from_slice(&overrun.to_be_bytes());
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn short_payload_length_is_rejected() {
        let mut msg = sample_message();
        let mut encoded = msg.encode().expect("encode");
        encoded[IKE_HEADER_LEN + 2..IKE_HEADER_LEN + 4].copy_from_slice(&2u16.to_be_bytes());
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn sk_envelope_carries_inner_first_payload() {
        let mut msg = Message::new(IkeHeader::new(
            3,
            4,
            ExchangeType::IKE_AUTH,
            Flags::INITIATOR,
            1,
        ));
        msg.payloads.push(Payload::Encrypted {
            first_payload: PayloadType::ID_INITIATOR,
            data: vec![0x55; 48],
        });
        let encoded = msg.encode().expect("encode SK");
        let decoded = Message::decode(&encoded).expect("decode SK");
        let (first, data) = decoded.payloads.encrypted().expect("SK payload");
        assert_eq!(first, PayloadType::ID_INITIATOR);
        assert_eq!(data, &[0x55; 48][..]);
    }
}
