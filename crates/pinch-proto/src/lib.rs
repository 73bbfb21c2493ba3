//! Envelope wire format for the Pinch protocol.
//!
//! Every WebSocket frame carries one protobuf-encoded [`Envelope`].
//! The relay reads only the routing header (version, addresses, type);
//! payload bodies are end-to-end encrypted and stay opaque in transit.
//!
//! The message definitions mirror `pinch/v1/envelope.proto` as
//! hand-written `prost` structs, so the encoding is byte-compatible
//! with peer implementations.

use prost::Message as _;

use pinch_types::{PinchError, Result};

/// The only envelope version this implementation understands.
pub const ENVELOPE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Classifies an envelope for routing and handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// Unset; rejected by the relay.
    Unspecified = 0,
    /// Key exchange during connection setup.
    Handshake = 1,
    /// Relay-issued authentication challenge.
    AuthChallenge = 2,
    /// Agent response to an authentication challenge.
    AuthResponse = 3,
    /// Routed end-to-end message.
    Message = 4,
    /// Recipient delivery acknowledgement.
    DeliveryConfirm = 5,
    /// Request to establish a contact connection.
    ConnectionRequest = 6,
    /// Response to a connection request.
    ConnectionResponse = 7,
    /// Keepalive.
    Heartbeat = 8,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The on-wire routed unit.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Wire format version; see [`ENVELOPE_VERSION`].
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Pinch address of the sender.
    #[prost(string, tag = "2")]
    pub from_address: String,
    /// Pinch address of the intended recipient.
    #[prost(string, tag = "3")]
    pub to_address: String,
    /// Envelope classification.
    #[prost(enumeration = "MessageType", tag = "4")]
    pub r#type: i32,
    /// Sender-assigned message identifier (16 random bytes).
    #[prost(bytes = "vec", tag = "5")]
    pub message_id: Vec<u8>,
    /// Sender clock at creation, milliseconds since epoch.
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
    /// Payload body; the relay never inspects it.
    #[prost(oneof = "envelope::Payload", tags = "7, 8, 9")]
    pub payload: Option<envelope::Payload>,
}

/// Payload variants for [`Envelope`].
pub mod envelope {
    /// One-of payload body.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Sealed end-to-end payload.
        #[prost(message, tag = "7")]
        Encrypted(super::EncryptedPayload),
        /// Unencrypted payload (handshake-adjacent control data).
        #[prost(message, tag = "8")]
        Plaintext(super::PlaintextPayload),
        /// Key material exchanged at connection setup.
        #[prost(message, tag = "9")]
        Handshake(super::Handshake),
    }
}

/// NaCl-box sealed payload body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedPayload {
    /// 24-byte XSalsa20-Poly1305 nonce.
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
    /// Sealed ciphertext including the authentication tag.
    #[prost(bytes = "vec", tag = "2")]
    pub ciphertext: Vec<u8>,
    /// Sender's X25519 public key for the box computation.
    #[prost(bytes = "vec", tag = "3")]
    pub sender_public_key: Vec<u8>,
}

/// Unencrypted payload body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlaintextPayload {
    /// Payload schema version.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Per-sender sequence number.
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
    /// Sender clock at creation, milliseconds since epoch.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    /// Raw content bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub content: Vec<u8>,
    /// MIME type of `content`.
    #[prost(string, tag = "5")]
    pub content_type: String,
}

/// Key material exchanged during connection setup.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    /// Handshake schema version.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Ed25519 signing public key.
    #[prost(bytes = "vec", tag = "2")]
    pub signing_key: Vec<u8>,
    /// X25519 encryption public key.
    #[prost(bytes = "vec", tag = "3")]
    pub encryption_key: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Header extraction
// ---------------------------------------------------------------------------

/// The routing-relevant fields of an envelope.
///
/// This is all the relay core ever reads from a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Wire format version.
    pub version: u32,
    /// Sender address.
    pub from_address: String,
    /// Recipient address.
    pub to_address: String,
    /// Raw wire value of the type field. Classify through
    /// [`message_type`](Self::message_type); an unrecognized value is a
    /// routing-policy concern, not a parse failure.
    pub raw_type: i32,
}

impl EnvelopeHeader {
    /// Decodes a frame and extracts its routing header.
    ///
    /// # Errors
    ///
    /// Returns [`PinchError::InvalidEnvelope`] only when the bytes are
    /// not a valid protobuf envelope. A well-formed envelope always
    /// parses, whatever its type field carries.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let envelope = Envelope::decode(frame).map_err(|e| PinchError::InvalidEnvelope {
            reason: format!("protobuf decode failed: {e}"),
        })?;

        Ok(Self {
            version: envelope.version,
            from_address: envelope.from_address,
            to_address: envelope.to_address,
            raw_type: envelope.r#type,
        })
    }

    /// Classifies the type field, or `None` when the wire value is not
    /// a recognized [`MessageType`].
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.raw_type).ok()
    }
}

impl Envelope {
    /// Serializes the envelope into a wire frame.
    pub fn to_frame(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample_envelope() -> Envelope {
        Envelope {
            version: ENVELOPE_VERSION,
            from_address: "pinch:abc123@relay.example.com".into(),
            to_address: "pinch:def456@relay.example.com".into(),
            r#type: MessageType::Message as i32,
            message_id: (1u8..=16).collect(),
            timestamp: 1_700_000_000_000,
            payload: Some(envelope::Payload::Encrypted(EncryptedPayload {
                nonce: vec![0x64; 24],
                ciphertext: b"encrypted-data-here".to_vec(),
                sender_public_key: (0u8..32).collect(),
            })),
        }
    }

    #[test]
    fn envelope_roundtrip() -> pinch_types::Result<()> {
        let original = sample_envelope();
        let frame = original.to_frame();
        assert!(!frame.is_empty());

        let decoded = Envelope::decode(frame.as_slice()).map_err(|e| {
            PinchError::InvalidEnvelope {
                reason: e.to_string(),
            }
        })?;
        assert_eq!(decoded, original);
        Ok(())
    }

    #[test]
    fn header_parse_extracts_routing_fields() -> pinch_types::Result<()> {
        let frame = sample_envelope().to_frame();
        let header = EnvelopeHeader::parse(&frame)?;

        assert_eq!(header.version, 1);
        assert_eq!(header.from_address, "pinch:abc123@relay.example.com");
        assert_eq!(header.to_address, "pinch:def456@relay.example.com");
        assert_eq!(header.message_type(), Some(MessageType::Message));
        Ok(())
    }

    #[test]
    fn garbage_frame_rejected() {
        // A truncated length-delimited field trips the decoder.
        assert!(EnvelopeHeader::parse(&[0x12, 0xFF]).is_err());
    }

    #[test]
    fn unknown_message_type_parses_but_does_not_classify() -> pinch_types::Result<()> {
        // A well-formed envelope with an unrecognized type still
        // parses; only classification fails. Callers treat that as a
        // policy drop, never a protocol error.
        let mut envelope = sample_envelope();
        envelope.r#type = 99;

        let header = EnvelopeHeader::parse(&envelope.to_frame())?;
        assert_eq!(header.raw_type, 99);
        assert_eq!(header.message_type(), None);
        assert_eq!(header.from_address, "pinch:abc123@relay.example.com");
        Ok(())
    }

    #[test]
    fn handshake_payload_roundtrip() {
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            from_address: "pinch:abc123@relay.example.com".into(),
            to_address: String::new(),
            r#type: MessageType::Handshake as i32,
            message_id: Vec::new(),
            timestamp: 0,
            payload: Some(envelope::Payload::Handshake(Handshake {
                version: 1,
                signing_key: (0u8..32).collect(),
                encryption_key: (32u8..64).collect(),
            })),
        };

        let decoded = Envelope::decode(envelope.to_frame().as_slice()).unwrap();
        assert_eq!(decoded, envelope);
        match decoded.payload {
            Some(envelope::Payload::Handshake(h)) => {
                assert_eq!(h.signing_key.len(), 32);
                assert_eq!(h.encryption_key.len(), 32);
            }
            other => panic!("expected handshake payload, got {other:?}"),
        }
    }

    #[test]
    fn message_type_values_match_schema() {
        assert_eq!(MessageType::Unspecified as i32, 0);
        assert_eq!(MessageType::Handshake as i32, 1);
        assert_eq!(MessageType::AuthChallenge as i32, 2);
        assert_eq!(MessageType::AuthResponse as i32, 3);
        assert_eq!(MessageType::Message as i32, 4);
        assert_eq!(MessageType::DeliveryConfirm as i32, 5);
        assert_eq!(MessageType::ConnectionRequest as i32, 6);
        assert_eq!(MessageType::ConnectionResponse as i32, 7);
        assert_eq!(MessageType::Heartbeat as i32, 8);
    }

    #[test]
    fn empty_frame_decodes_to_defaults() -> pinch_types::Result<()> {
        // Protobuf: an empty byte string is a valid message with every
        // field at its default. The version gate downstream rejects it.
        let header = EnvelopeHeader::parse(&[])?;
        assert_eq!(header.version, 0);
        assert_eq!(header.message_type(), Some(MessageType::Unspecified));
        Ok(())
    }
}
