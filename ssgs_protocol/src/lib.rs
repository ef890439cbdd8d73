// lib.rs — SSGSCP wire protocol: framing, AES-256-CTR codec, seal telemetry

use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

// =============================== Wire constants =============================

/// Every SSGSCP datagram opens with this literal.
pub const MAGIC: [u8; 6] = *b"SSGSCP";

/// On-wire IV width. Extended to the 16-byte AES-CTR counter block by
/// right-padding with zeros.
pub const IV_LEN: usize = 8;

/// Unencrypted header: magic(6) + IV(8) + gateway UID(4).
pub const HEADER_LEN: usize = 18;

/// Fixed literal carried inside the encrypted region of every packet; its
/// survival across decryption is the protocol's sole authentication check.
pub const AUTH_TAG: [u8; 4] = [0x00, 0x01, 0x02, 0x03];

/// Header plus the smallest (empty-payload, padded) encrypted block.
pub const MIN_DATAGRAM_LEN: usize = 26;

/// The payload length field is a single byte.
pub const MAX_PAYLOAD_LEN: usize = 255;

pub const DEFAULT_SERVER_PORT: u16 = 1818;

/// 256-bit pre-shared gateway key.
pub type Key = [u8; 32];

type Aes256Ctr = Ctr128BE<Aes256>;

// =============================== Gateway UID ================================

/// Fixed 4-byte gateway identifier. Compared byte-wise over all 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GatewayUid(pub [u8; 4]);

impl GatewayUid {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Parse from hex, tolerating embedded whitespace ("aa bb cc dd").
    pub fn from_hex(s: &str) -> Result<Self, UidError> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(&compact).map_err(|_| UidError::BadHex)?;
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| UidError::BadLength(v.len()))?;
        Ok(GatewayUid(arr))
    }
}

impl From<[u8; 4]> for GatewayUid {
    fn from(bytes: [u8; 4]) -> Self {
        GatewayUid(bytes)
    }
}

impl fmt::Display for GatewayUid {
    /// Canonical rendering: `[ab cd ef 12]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:02x} {:02x} {:02x} {:02x}]",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UidError {
    #[error("not valid hex")]
    BadHex,
    #[error("uid must be 4 bytes, got {0}")]
    BadLength(usize),
}

// =============================== Packet types ===============================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Gateway → server handshake request. Encrypted.
    Conn = 1,
    /// Server → gateway handshake accept. Encrypted.
    ConnAccept = 2,
    /// Server → gateway handshake reject. Packed under the all-zero key.
    ConnFail = 3,
    /// Per-packet receipt, both directions. Encrypted.
    RcptOk = 10,
    /// Server → gateway configuration message. Encrypted, delivered reliably.
    MsgConf = 20,
    /// Gateway → server telemetry report. Encrypted.
    MsgStatus = 21,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(PacketType::Conn),
            2 => Ok(PacketType::ConnAccept),
            3 => Ok(PacketType::ConnFail),
            10 => Ok(PacketType::RcptOk),
            20 => Ok(PacketType::MsgConf),
            21 => Ok(PacketType::MsgStatus),
            other => Err(other),
        }
    }
}

// ============================= Packets (logical) ============================

/// One logical SSGSCP packet, before packing / after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub gateway_uid: GatewayUid,
    pub packet_id: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        gateway_uid: GatewayUid,
        packet_id: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            packet_type,
            gateway_uid,
            packet_id,
            payload,
        }
    }
}

/// Parse result. `Malformed` covers anything the unencrypted header rules
/// out; `AuthFailed` covers frames that decrypt to garbage (tag mismatch, or
/// a type byte outside the enum, which under CTR is corruption too).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Malformed,
    AuthFailed,
    Valid(Packet),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("payload is {0} bytes; limit is {MAX_PAYLOAD_LEN}")]
    PayloadTooLong(usize),
}

// ================================= Codec ====================================

/// AES-256-CTR keystream over `buf`, in place. The counter block is the
/// 8-byte wire IV right-padded with zeros. Encrypt and decrypt are the same
/// operation.
pub fn apply_keystream(key: &Key, iv: &[u8; IV_LEN], buf: &mut [u8]) {
    let mut block = [0u8; 16];
    block[..IV_LEN].copy_from_slice(iv);
    let mut cipher = Aes256Ctr::new(key.into(), (&block).into());
    cipher.apply_keystream(buf);
}

/// Pack a logical packet into a ready-to-send datagram. Draws a fresh 8-byte
/// IV from the OS RNG on every call.
///
/// Encrypted-region plaintext, zero-padded to a 4-byte multiple:
/// ```text
/// type(1) ‖ auth tag {0,1,2,3}(4) ‖ packet_id(u16 BE) ‖ len(1) ‖ payload
/// ```
pub fn pack(packet: &Packet, key: &Key) -> Result<Vec<u8>, PackError> {
    if packet.payload.len() > MAX_PAYLOAD_LEN {
        return Err(PackError::PayloadTooLong(packet.payload.len()));
    }

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let body_len = (8 + packet.payload.len() + 3) & !3;
    let mut body = vec![0u8; body_len];
    body[0] = packet.packet_type as u8;
    body[1..5].copy_from_slice(&AUTH_TAG);
    body[5..7].copy_from_slice(&packet.packet_id.to_be_bytes());
    body[7] = packet.payload.len() as u8;
    body[8..8 + packet.payload.len()].copy_from_slice(&packet.payload);
    apply_keystream(key, &iv, &mut body);

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&iv);
    out.extend_from_slice(packet.gateway_uid.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypt and authenticate one datagram. The payload is truncated to the
/// declared length, clamped to the bytes actually present after padding.
pub fn parse(datagram: &[u8], key: &Key) -> ParseOutcome {
    if datagram.len() < MIN_DATAGRAM_LEN || datagram[..6] != MAGIC {
        return ParseOutcome::Malformed;
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&datagram[6..14]);
    let gateway_uid = GatewayUid([datagram[14], datagram[15], datagram[16], datagram[17]]);

    let mut body = datagram[HEADER_LEN..].to_vec();
    apply_keystream(key, &iv, &mut body);

    if body[1..5] != AUTH_TAG {
        return ParseOutcome::AuthFailed;
    }
    let packet_type = match PacketType::try_from(body[0]) {
        Ok(t) => t,
        Err(_) => return ParseOutcome::AuthFailed,
    };

    let packet_id = u16::from_be_bytes([body[5], body[6]]);
    let declared = body[7] as usize;
    let payload = body[8..8 + declared.min(body.len() - 8)].to_vec();

    ParseOutcome::Valid(Packet {
        packet_type,
        gateway_uid,
        packet_id,
        payload,
    })
}

/// Read the gateway UID out of the unencrypted header. Never touches the
/// cipher, so the server can route to the right key before decrypting.
pub fn parse_uid(datagram: &[u8]) -> Option<GatewayUid> {
    if datagram.len() < HEADER_LEN || datagram[..6] != MAGIC {
        return None;
    }
    Some(GatewayUid([
        datagram[14],
        datagram[15],
        datagram[16],
        datagram[17],
    ]))
}

// =========================== Sensor seal telemetry ==========================

/// One decoded measurement report from a sensor seal, relayed inside a
/// MSGSTATUS payload. Fields the seal did not report stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSealUpdate {
    pub sensor_seal_uid: Option<[u8; 4]>,
    /// °C
    pub temperature: Option<f32>,
    /// mm/s²
    pub vibration: Option<f32>,
    pub rpm: Option<u32>,
    /// V
    pub voltage: Option<f32>,
    pub msg_id: Option<u32>,
}

/// Seam for the payload decoders; the server core only sees this trait.
pub trait TelemetryParser {
    fn parse(&self, payload: &[u8]) -> SensorSealUpdate;
}

const FIELD_TEMPERATURE: u8 = 0x01;
const FIELD_VIBRATION: u8 = 0x02;
const FIELD_RPM: u8 = 0x03;
const FIELD_VOLTAGE: u8 = 0x04;

/// Default decoder for the tagged seal payload layout:
/// ```text
/// seal_uid(4) ‖ msg_id(u32 BE) ‖ repeated tag(1) + value(4)
/// ```
/// Tags: 0x01 temperature (f32 BE), 0x02 vibration (f32 BE),
/// 0x03 rpm (u32 BE), 0x04 voltage (f32 BE). An unknown tag ends the scan;
/// payloads shorter than the header decode to all-`None`.
#[derive(Debug, Clone, Default)]
pub struct SealPayloadParser;

impl TelemetryParser for SealPayloadParser {
    fn parse(&self, payload: &[u8]) -> SensorSealUpdate {
        let mut update = SensorSealUpdate::default();
        if payload.len() < 8 {
            return update;
        }
        update.sensor_seal_uid = Some([payload[0], payload[1], payload[2], payload[3]]);
        update.msg_id = Some(u32::from_be_bytes([
            payload[4], payload[5], payload[6], payload[7],
        ]));

        let mut rest = &payload[8..];
        while rest.len() >= 5 {
            let value = [rest[1], rest[2], rest[3], rest[4]];
            match rest[0] {
                FIELD_TEMPERATURE => update.temperature = Some(f32::from_be_bytes(value)),
                FIELD_VIBRATION => update.vibration = Some(f32::from_be_bytes(value)),
                FIELD_RPM => update.rpm = Some(u32::from_be_bytes(value)),
                FIELD_VOLTAGE => update.voltage = Some(f32::from_be_bytes(value)),
                _ => break,
            }
            rest = &rest[5..];
        }
        update
    }
}

// ================================ Tests =====================================

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = [0x11; 32];
    const UID: GatewayUid = GatewayUid([0xAA, 0xBB, 0xCC, 0xDD]);

    fn sample(packet_type: PacketType, packet_id: u16, payload: &[u8]) -> Packet {
        Packet::new(packet_type, UID, packet_id, payload.to_vec())
    }

    #[test]
    fn roundtrip_preserves_all_fields() {
        let pkt = sample(PacketType::MsgStatus, 0xBEEF, b"seal telemetry");
        let bytes = pack(&pkt, &KEY).expect("pack");
        match parse(&bytes, &KEY) {
            ParseOutcome::Valid(back) => assert_eq!(back, pkt),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_packs_to_minimum_length() {
        let bytes = pack(&sample(PacketType::Conn, 0, b""), &KEY).unwrap();
        assert_eq!(bytes.len(), MIN_DATAGRAM_LEN);
        match parse(&bytes, &KEY) {
            ParseOutcome::Valid(back) => assert!(back.payload.is_empty()),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn padding_arithmetic_matches_wire_formula() {
        for len in [0usize, 1, 3, 4, 5, 8, 100, 255] {
            let bytes = pack(&sample(PacketType::MsgConf, 1, &vec![0x42; len]), &KEY).unwrap();
            assert_eq!(bytes.len(), 18 + (8 + len).div_ceil(4) * 4, "payload len {len}");
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let err = pack(&sample(PacketType::MsgConf, 1, &[0u8; 256]), &KEY).unwrap_err();
        assert_eq!(err, PackError::PayloadTooLong(256));
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert_eq!(parse(&[0u8; 10], &KEY), ParseOutcome::Malformed);
        assert_eq!(parse(&[0u8; 25], &KEY), ParseOutcome::Malformed);
    }

    #[test]
    fn magic_mismatch_is_malformed() {
        let mut bytes = pack(&sample(PacketType::Conn, 0, b""), &KEY).unwrap();
        bytes[0] ^= 0xFF;
        assert_eq!(parse(&bytes, &KEY), ParseOutcome::Malformed);
    }

    #[test]
    fn tag_byte_flip_fails_authentication() {
        // Plaintext offsets 1..5 hold the tag; on the wire that is 19..23.
        for wire_offset in 19..23 {
            let mut bytes = pack(&sample(PacketType::MsgStatus, 7, b"p"), &KEY).unwrap();
            bytes[wire_offset] ^= 0x01;
            assert_eq!(
                parse(&bytes, &KEY),
                ParseOutcome::AuthFailed,
                "offset {wire_offset}"
            );
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let bytes = pack(&sample(PacketType::Conn, 0, b""), &KEY).unwrap();
        let other: Key = [0x22; 32];
        assert_eq!(parse(&bytes, &other), ParseOutcome::AuthFailed);
    }

    #[test]
    fn unknown_type_byte_fails_authentication() {
        let mut bytes = pack(&sample(PacketType::Conn, 0, b""), &KEY).unwrap();
        // Rewrite the encrypted type byte to 0xFF without disturbing the tag.
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[6..14]);
        let mut body = bytes[HEADER_LEN..].to_vec();
        apply_keystream(&KEY, &iv, &mut body);
        body[0] = 0xFF;
        apply_keystream(&KEY, &iv, &mut body);
        bytes[HEADER_LEN..].copy_from_slice(&body);
        assert_eq!(parse(&bytes, &KEY), ParseOutcome::AuthFailed);
    }

    #[test]
    fn plaintext_layout_is_stable() {
        let pkt = sample(PacketType::MsgStatus, 0x1234, b"xyz");
        let bytes = pack(&pkt, &KEY).unwrap();

        assert_eq!(&bytes[..6], &MAGIC);
        assert_eq!(&bytes[14..18], UID.as_bytes());

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[6..14]);
        let mut body = bytes[HEADER_LEN..].to_vec();
        apply_keystream(&KEY, &iv, &mut body);

        assert_eq!(body[0], PacketType::MsgStatus as u8);
        assert_eq!(&body[1..5], &AUTH_TAG);
        assert_eq!(&body[5..7], &0x1234u16.to_be_bytes());
        assert_eq!(body[7], 3);
        assert_eq!(&body[8..11], b"xyz");
        assert_eq!(body[11], 0); // padding
    }

    #[test]
    fn payload_truncated_to_declared_length() {
        let bytes = pack(&sample(PacketType::MsgStatus, 5, b"abcdef"), &KEY).unwrap();

        // Shrink the declared length from 6 to 4 under the keystream.
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[6..14]);
        let mut body = bytes[HEADER_LEN..].to_vec();
        apply_keystream(&KEY, &iv, &mut body);
        body[7] = 4;
        apply_keystream(&KEY, &iv, &mut body);
        let mut doctored = bytes.clone();
        doctored[HEADER_LEN..].copy_from_slice(&body);

        match parse(&doctored, &KEY) {
            ParseOutcome::Valid(back) => assert_eq!(back.payload, b"abcd"),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn declared_length_clamped_to_available_bytes() {
        let bytes = pack(&sample(PacketType::MsgStatus, 5, b"ab"), &KEY).unwrap();

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[6..14]);
        let mut body = bytes[HEADER_LEN..].to_vec();
        apply_keystream(&KEY, &iv, &mut body);
        body[7] = 200; // claims more than the 4 bytes present
        apply_keystream(&KEY, &iv, &mut body);
        let mut doctored = bytes.clone();
        doctored[HEADER_LEN..].copy_from_slice(&body);

        match parse(&doctored, &KEY) {
            ParseOutcome::Valid(back) => assert_eq!(back.payload.len(), 4),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn uid_extraction_needs_no_key() {
        let bytes = pack(&sample(PacketType::Conn, 0, b""), &KEY).unwrap();
        assert_eq!(parse_uid(&bytes), Some(UID));

        let mut bad_magic = bytes.clone();
        bad_magic[3] ^= 0xFF;
        assert_eq!(parse_uid(&bad_magic), None);
        assert_eq!(parse_uid(&bytes[..17]), None);
    }

    #[test]
    fn uid_display_is_bracketed_hex() {
        assert_eq!(UID.to_string(), "[aa bb cc dd]");
    }

    #[test]
    fn uid_from_hex_strips_whitespace() {
        assert_eq!(GatewayUid::from_hex("aa bb cc dd").unwrap(), UID);
        assert_eq!(GatewayUid::from_hex("AABBCCDD").unwrap(), UID);
        assert_eq!(GatewayUid::from_hex("aabbcc"), Err(UidError::BadLength(3)));
        assert_eq!(GatewayUid::from_hex("zzzzzzzz"), Err(UidError::BadHex));
    }

    #[test]
    fn seal_update_decodes_all_fields() {
        let mut payload = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x2A];
        payload.push(FIELD_TEMPERATURE);
        payload.extend_from_slice(&21.5f32.to_be_bytes());
        payload.push(FIELD_VIBRATION);
        payload.extend_from_slice(&0.25f32.to_be_bytes());
        payload.push(FIELD_RPM);
        payload.extend_from_slice(&1450u32.to_be_bytes());
        payload.push(FIELD_VOLTAGE);
        payload.extend_from_slice(&3.3f32.to_be_bytes());

        let update = SealPayloadParser.parse(&payload);
        assert_eq!(update.sensor_seal_uid, Some([0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(update.msg_id, Some(42));
        assert_eq!(update.temperature, Some(21.5));
        assert_eq!(update.vibration, Some(0.25));
        assert_eq!(update.rpm, Some(1450));
        assert_eq!(update.voltage, Some(3.3));
    }

    #[test]
    fn seal_update_missing_fields_stay_none() {
        let mut payload = vec![1, 2, 3, 4, 0, 0, 0, 1];
        payload.push(FIELD_TEMPERATURE);
        payload.extend_from_slice(&(-4.0f32).to_be_bytes());

        let update = SealPayloadParser.parse(&payload);
        assert_eq!(update.temperature, Some(-4.0));
        assert_eq!(update.vibration, None);
        assert_eq!(update.rpm, None);
        assert_eq!(update.voltage, None);
    }

    #[test]
    fn seal_update_short_payload_is_empty() {
        assert_eq!(SealPayloadParser.parse(b""), SensorSealUpdate::default());
        assert_eq!(SealPayloadParser.parse(&[1, 2, 3]), SensorSealUpdate::default());
    }

    #[test]
    fn seal_update_unknown_tag_ends_scan() {
        let mut payload = vec![1, 2, 3, 4, 0, 0, 0, 1];
        payload.push(0x7F);
        payload.extend_from_slice(&1.0f32.to_be_bytes());
        payload.push(FIELD_RPM);
        payload.extend_from_slice(&900u32.to_be_bytes());

        let update = SealPayloadParser.parse(&payload);
        assert_eq!(update.rpm, None);
        assert_eq!(update.msg_id, Some(1));
    }
}
