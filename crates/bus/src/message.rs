use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire-format message envelope carried by every destination on the bus.
///
/// Payloads are serialized with MessagePack. The `subject` is what topic
/// exchanges filter on and what RPC services dispatch on (the method name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing subject (e.g. "TaskStatus.scheduled", "GetSpecification").
    pub subject: String,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Unique id of this message, used for logging and duplicate detection.
    pub message_id: Uuid,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        subject: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            subject: subject.into(),
            payload: rmp_serde::to_vec_named(payload)?,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
            version: 1,
        })
    }

    /// Create a message from an already-encoded payload.
    pub fn from_raw(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
            version: 1,
        }
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Serialize this entire message envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserialize a message envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Size of the encoded payload, used for broker accounting.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Lets serde treat `Vec<u8>` as a MessagePack bin instead of an array.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let buf: ByteBuf = Deserialize::deserialize(d)?;
        Ok(buf.0)
    }

    /// Accepts both borrowed and owned byte buffers.
    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
            struct Visitor;

            impl<'de> serde::de::Visitor<'de> for Visitor {
                type Value = ByteBuf;

                fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str("a byte buffer")
                }

                fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ByteBuf, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<ByteBuf, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A: serde::de::SeqAccess<'de>>(
                    self,
                    mut seq: A,
                ) -> Result<ByteBuf, A::Error> {
                    let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                    while let Some(b) = seq.next_element::<u8>()? {
                        out.push(b);
                    }
                    Ok(ByteBuf(out))
                }
            }

            d.deserialize_byte_buf(Visitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_to_original() {
        let msg = Message::new("TaskStatus.scheduled", &"hello world".to_string()).unwrap();

        assert_eq!(msg.subject, "TaskStatus.scheduled");
        assert_eq!(msg.decode::<String>().unwrap(), "hello world");
    }

    #[test]
    fn envelope_bytes_preserve_identity() {
        let msg = Message::new("GetSpecification", &42u64).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.subject, "GetSpecification");
        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.decode::<u64>().unwrap(), 42);
    }

    #[test]
    fn each_message_gets_a_fresh_id() {
        let a = Message::new("s", &1u8).unwrap();
        let b = Message::new("s", &1u8).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }
}
