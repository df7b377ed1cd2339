//! Message catalog.
//!
//! The catalog fixes every message kind the fleet can exchange. A message on the wire is a
//! list of parts:
//!
//! ```text
//! [topic tag, source name, send timestamp, flags, ...payload parts]
//! ```
//!
//! Decoding relies only on the topic tag and the flags carried in the header. For non-data
//! topics the flags spell the payload type codes; for `data` they name the data shape.

use super::codec::{self, Buffer, CodecError, Mapping};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic tags that lead every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Request the receiver to shut down.
    Exit,
    /// Connection status reply.
    Connection,
    /// Error report with trace.
    Error,
    /// Free text.
    String,
    /// Named event with keyword arguments.
    Event,
    /// Bare trigger pulse.
    Trigger,
    /// Point-to-point query to a saver.
    Request,
    /// Measurement data of any shape.
    Data,
}

impl Topic {
    /// Every topic, in tag order.
    pub const ALL: [Topic; 8] = [
        Topic::Exit,
        Topic::Connection,
        Topic::Error,
        Topic::String,
        Topic::Event,
        Topic::Trigger,
        Topic::Request,
        Topic::Data,
    ];

    /// Tag leading the header.
    pub fn tag(self) -> &'static str {
        match self {
            Topic::Exit => "exit",
            Topic::Connection => "connection",
            Topic::Error => "error",
            Topic::String => "string",
            Topic::Event => "event",
            Topic::Trigger => "trigger",
            Topic::Request => "request",
            Topic::Data => "data",
        }
    }

    /// Inverse of [`tag`](Self::tag).
    pub fn from_tag(tag: &str) -> Option<Self> {
        Topic::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Shape of a `data` message, carried in its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataShape {
    /// `t`: time + mapping
    Timestamped,
    /// `i`: time + index + mapping
    Indexed,
    /// `a`: time + index + array buffer
    Array,
    /// `f`: time + index + image frame
    Frame,
}

impl DataShape {
    /// Flag written in the header of a `data` message.
    pub fn flag(self) -> &'static str {
        match self {
            DataShape::Timestamped => "t",
            DataShape::Indexed => "i",
            DataShape::Array => "a",
            DataShape::Frame => "f",
        }
    }

    /// Inverse of [`flag`](Self::flag).
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "t" => Some(DataShape::Timestamped),
            "i" => Some(DataShape::Indexed),
            "a" => Some(DataShape::Array),
            "f" => Some(DataShape::Frame),
            _ => None,
        }
    }
}

/// Every kind of message in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    /// Shut down.
    Exit = 0,
    /// Whether the sender is fully wired.
    Connection = 1,
    /// Error report.
    Error = 2,
    /// Free text.
    String = 3,
    /// Named event.
    Event = 4,
    /// Trigger pulse.
    Trigger = 5,
    /// Query to a saver.
    Request = 6,
    /// Data: time and values.
    Timestamped = 7,
    /// Data: time, index and values.
    Indexed = 8,
    /// Data: time, index and an array.
    Array = 9,
    /// Data: time, index and an image frame.
    Frame = 10,
}

impl MessageKind {
    /// Every kind, in discriminant order.
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Exit,
        MessageKind::Connection,
        MessageKind::Error,
        MessageKind::String,
        MessageKind::Event,
        MessageKind::Trigger,
        MessageKind::Request,
        MessageKind::Timestamped,
        MessageKind::Indexed,
        MessageKind::Array,
        MessageKind::Frame,
    ];

    /// Topic this kind is sent under.
    pub fn topic(self) -> Topic {
        match self {
            MessageKind::Exit => Topic::Exit,
            MessageKind::Connection => Topic::Connection,
            MessageKind::Error => Topic::Error,
            MessageKind::String => Topic::String,
            MessageKind::Event => Topic::Event,
            MessageKind::Trigger => Topic::Trigger,
            MessageKind::Request => Topic::Request,
            MessageKind::Timestamped
            | MessageKind::Indexed
            | MessageKind::Array
            | MessageKind::Frame => Topic::Data,
        }
    }

    /// Flags written in the header for this kind.
    pub fn flags(self) -> &'static str {
        match self {
            MessageKind::Exit | MessageKind::Trigger => "",
            MessageKind::Connection => "b",
            MessageKind::Error => "ds",
            MessageKind::String | MessageKind::Request => "s",
            MessageKind::Event => "sd",
            MessageKind::Timestamped => DataShape::Timestamped.flag(),
            MessageKind::Indexed => DataShape::Indexed.flag(),
            MessageKind::Array => DataShape::Array.flag(),
            MessageKind::Frame => DataShape::Frame.flag(),
        }
    }

    /// Data shape, for the four data kinds.
    pub fn shape(self) -> Option<DataShape> {
        match self {
            MessageKind::Timestamped => Some(DataShape::Timestamped),
            MessageKind::Indexed => Some(DataShape::Indexed),
            MessageKind::Array => Some(DataShape::Array),
            MessageKind::Frame => Some(DataShape::Frame),
            _ => None,
        }
    }

    fn from_shape(shape: DataShape) -> Self {
        match shape {
            DataShape::Timestamped => MessageKind::Timestamped,
            DataShape::Indexed => MessageKind::Indexed,
            DataShape::Array => MessageKind::Array,
            DataShape::Frame => MessageKind::Frame,
        }
    }

    /// Resolves a kind from the header's topic tag and flags.
    pub fn resolve(tag: &str, flags: &str) -> Result<Self, CodecError> {
        let topic = Topic::from_tag(tag).ok_or_else(|| CodecError::UnknownTopic(tag.into()))?;
        let unknown = || CodecError::UnknownShape {
            topic: tag.into(),
            flags: flags.into(),
        };
        if topic == Topic::Data {
            return DataShape::from_flag(flags).map(Self::from_shape).ok_or_else(unknown);
        }
        let kind = MessageKind::ALL
            .into_iter()
            .find(|k| k.topic() == topic)
            .ok_or_else(unknown)?;
        if kind.flags() != flags {
            return Err(unknown());
        }
        Ok(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape() {
            Some(shape) => write!(f, "data/{}", shape.flag()),
            None => f.write_str(self.topic().tag()),
        }
    }
}

/// Set of message kinds, used as a subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindSet(u16);

impl KindSet {
    /// No kind.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every kind.
    pub fn all() -> Self {
        Self::of(&MessageKind::ALL)
    }

    /// All four data shapes.
    pub fn data() -> Self {
        Self::of(&[
            MessageKind::Timestamped,
            MessageKind::Indexed,
            MessageKind::Array,
            MessageKind::Frame,
        ])
    }

    /// Exactly `kinds`.
    pub fn of(kinds: &[MessageKind]) -> Self {
        kinds.iter().fold(Self::empty(), |set, k| set.with(*k))
    }

    /// This set plus `kind`.
    #[must_use]
    pub fn with(self, kind: MessageKind) -> Self {
        Self(self.0 | (1 << kind as u8))
    }

    /// Kinds in either set.
    #[must_use]
    pub fn union(self, other: KindSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether `kind` is admitted.
    pub fn contains(self, kind: MessageKind) -> bool {
        self.0 & (1 << kind as u8) != 0
    }

    /// Whether no kind is admitted.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// One bit per kind, by discriminant; what a subscriber sends in its hello.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Rebuilds a set from raw bits, ignoring bits with no kind.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits & Self::all().0)
    }

    /// Admitted kinds, in discriminant order.
    pub fn iter(self) -> impl Iterator<Item = MessageKind> {
        MessageKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

/// Structured error description carried by ERROR messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Short classification, e.g. `"Error"`, `"CriticalError"`, `"Panic"`.
    pub kind: String,
    /// Human-readable description
    pub message: String,
    /// Set when the sender asks the orchestrator to shut the fleet down.
    #[serde(default)]
    pub critical: bool,
}

impl ErrorReport {
    fn to_mapping(&self) -> Result<Mapping, CodecError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(CodecError::Mapping("error report is not an object".into())),
            Err(e) => Err(CodecError::Mapping(e.to_string())),
        }
    }

    fn from_mapping(map: Mapping) -> Result<Self, CodecError> {
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| CodecError::Mapping(e.to_string()))
    }
}

/// Typed payload of a message; the variant determines the [`MessageKind`].
///
/// Data variants carry their acquisition `time` (UNIX seconds) separately from the
/// message's send timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Shut down
    Exit,
    /// True once every subscription of the sender is live
    Connection(bool),
    /// A failure and where it happened
    Error {
        /// Classification and message
        report: ErrorReport,
        /// Where it happened
        trace: String,
    },
    /// Free text
    String(String),
    /// Named event with keyword arguments
    Event {
        /// Event name
        name: String,
        /// Keyword arguments
        kwargs: Mapping,
    },
    /// Trigger pulse
    Trigger,
    /// Query name, answered point-to-point
    Request(String),
    /// Named values at one time
    Timestamped {
        /// Acquisition time
        time: f64,
        /// Named values
        data: Mapping,
    },
    /// Named values of one sample
    Indexed {
        /// Acquisition time
        time: f64,
        /// Sample index
        index: i64,
        /// Named values
        data: Mapping,
    },
    /// N-dimensional array of one sample
    Array {
        /// Acquisition time
        time: f64,
        /// Sample index
        index: i64,
        /// Array contents
        buffer: Buffer,
    },
    /// One image frame
    Frame {
        /// Acquisition time
        time: f64,
        /// Frame index
        index: i64,
        /// Pixel data
        buffer: Buffer,
    },
}

impl Payload {
    /// An EVENT payload.
    pub fn event(name: impl Into<String>, kwargs: Mapping) -> Self {
        Payload::Event {
            name: name.into(),
            kwargs,
        }
    }

    /// The catalog kind of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Exit => MessageKind::Exit,
            Payload::Connection(_) => MessageKind::Connection,
            Payload::Error { .. } => MessageKind::Error,
            Payload::String(_) => MessageKind::String,
            Payload::Event { .. } => MessageKind::Event,
            Payload::Trigger => MessageKind::Trigger,
            Payload::Request(_) => MessageKind::Request,
            Payload::Timestamped { .. } => MessageKind::Timestamped,
            Payload::Indexed { .. } => MessageKind::Indexed,
            Payload::Array { .. } => MessageKind::Array,
            Payload::Frame { .. } => MessageKind::Frame,
        }
    }

    fn encode_into(&self, parts: &mut Vec<Bytes>) -> Result<(), CodecError> {
        match self {
            Payload::Exit | Payload::Trigger => {}
            Payload::Connection(ok) => parts.push(codec::encode_bool(*ok)),
            Payload::Error { report, trace } => {
                parts.push(codec::encode_mapping(&report.to_mapping()?)?);
                parts.push(codec::encode_str(trace));
            }
            Payload::String(text) | Payload::Request(text) => parts.push(codec::encode_str(text)),
            Payload::Event { name, kwargs } => {
                parts.push(codec::encode_str(name));
                parts.push(codec::encode_mapping(kwargs)?);
            }
            Payload::Timestamped { time, data } => {
                parts.push(codec::encode_float(*time));
                parts.push(codec::encode_mapping(data)?);
            }
            Payload::Indexed { time, index, data } => {
                parts.push(codec::encode_float(*time));
                parts.push(codec::encode_int(*index));
                parts.push(codec::encode_mapping(data)?);
            }
            Payload::Array {
                time,
                index,
                buffer,
            }
            | Payload::Frame {
                time,
                index,
                buffer,
            } => {
                parts.push(codec::encode_float(*time));
                parts.push(codec::encode_int(*index));
                parts.push(codec::encode_buffer(buffer));
            }
        }
        Ok(())
    }

    fn decode(kind: MessageKind, parts: &[Bytes]) -> Result<Self, CodecError> {
        let mut reader = PartReader::new(parts, 4);
        let payload = match kind {
            MessageKind::Exit => Payload::Exit,
            MessageKind::Trigger => Payload::Trigger,
            MessageKind::Connection => Payload::Connection(codec::decode_bool(reader.next()?)?),
            MessageKind::Error => Payload::Error {
                report: ErrorReport::from_mapping(codec::decode_mapping(reader.next()?)?)?,
                trace: codec::decode_str(reader.next()?)?,
            },
            MessageKind::String => Payload::String(codec::decode_str(reader.next()?)?),
            MessageKind::Request => Payload::Request(codec::decode_str(reader.next()?)?),
            MessageKind::Event => Payload::Event {
                name: codec::decode_str(reader.next()?)?,
                kwargs: codec::decode_mapping(reader.next()?)?,
            },
            MessageKind::Timestamped => Payload::Timestamped {
                time: codec::decode_float(reader.next()?)?,
                data: codec::decode_mapping(reader.next()?)?,
            },
            MessageKind::Indexed => Payload::Indexed {
                time: codec::decode_float(reader.next()?)?,
                index: codec::decode_int(reader.next()?)?,
                data: codec::decode_mapping(reader.next()?)?,
            },
            MessageKind::Array => Payload::Array {
                time: codec::decode_float(reader.next()?)?,
                index: codec::decode_int(reader.next()?)?,
                buffer: codec::decode_buffer(reader.next()?)?,
            },
            MessageKind::Frame => Payload::Frame {
                time: codec::decode_float(reader.next()?)?,
                index: codec::decode_int(reader.next()?)?,
                buffer: codec::decode_buffer(reader.next()?)?,
            },
        };
        reader.finish()?;
        Ok(payload)
    }
}

struct PartReader<'a> {
    parts: &'a [Bytes],
    pos: usize,
}

impl<'a> PartReader<'a> {
    fn new(parts: &'a [Bytes], pos: usize) -> Self {
        Self { parts, pos }
    }

    fn next(&mut self) -> Result<&'a [u8], CodecError> {
        let part = self
            .parts
            .get(self.pos)
            .ok_or(CodecError::MissingPart(self.pos))?;
        self.pos += 1;
        Ok(part.as_ref())
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.parts.len().saturating_sub(self.pos) {
            0 => Ok(()),
            extra => Err(CodecError::TrailingParts(extra)),
        }
    }
}

/// Current UNIX time in fractional seconds.
pub fn now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
}

/// A decoded (or ready-to-send) message. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    source: String,
    timestamp: f64,
    payload: Payload,
}

impl Message {
    /// Builds a message stamped with the current time.
    pub fn new(source: impl Into<String>, payload: Payload) -> Self {
        Self::with_timestamp(source, now(), payload)
    }

    /// Builds a message with an explicit send timestamp.
    pub fn with_timestamp(source: impl Into<String>, timestamp: f64, payload: Payload) -> Self {
        Self {
            source: source.into(),
            timestamp,
            payload,
        }
    }

    /// Name of the sending participant.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Send timestamp, UNIX seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// The typed payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the message, keeping the payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// The catalog kind of the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Topic the message is sent under.
    pub fn topic(&self) -> Topic {
        self.kind().topic()
    }

    /// Event name, if this is an EVENT message.
    pub fn event_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Event { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Encodes into wire parts: header followed by payload parts.
    pub fn encode(&self) -> Result<Vec<Bytes>, CodecError> {
        let kind = self.kind();
        let mut parts = Vec::with_capacity(7);
        parts.push(codec::encode_str(kind.topic().tag()));
        parts.push(codec::encode_str(&self.source));
        parts.push(codec::encode_float(self.timestamp));
        parts.push(codec::encode_str(kind.flags()));
        self.payload.encode_into(&mut parts)?;
        Ok(parts)
    }

    /// Decodes wire parts produced by [`Message::encode`].
    pub fn decode(parts: &[Bytes]) -> Result<Self, CodecError> {
        let mut header = PartReader::new(parts, 0);
        let tag = codec::decode_str(header.next()?)?;
        let source = codec::decode_str(header.next()?)?;
        let timestamp = codec::decode_float(header.next()?)?;
        let flags = codec::decode_str(header.next()?)?;
        let kind = MessageKind::resolve(&tag, &flags)?;
        let payload = Payload::decode(kind, parts)?;
        Ok(Self {
            source,
            timestamp,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(value: serde_json::Value) -> Mapping {
        value.as_object().cloned().unwrap_or_default()
    }

    fn roundtrip(payload: Payload) {
        let msg = Message::with_timestamp("camera", 1_700_000_000.25, payload);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_every_kind_roundtrips() {
        let frame = Buffer::from_u8(vec![2, 2], vec![1, 2, 3, 4]).unwrap();
        roundtrip(Payload::Exit);
        roundtrip(Payload::Connection(true));
        roundtrip(Payload::Error {
            report: ErrorReport {
                kind: "CriticalError".into(),
                message: "laser interlock open".into(),
                critical: true,
            },
            trace: "at step()".into(),
        });
        roundtrip(Payload::String(String::new()));
        roundtrip(Payload::event("start_recording", mapping(json!({"filename": "run"}))));
        roundtrip(Payload::Trigger);
        roundtrip(Payload::Request("status".into()));
        roundtrip(Payload::Timestamped {
            time: 0.0,
            data: Mapping::new(),
        });
        roundtrip(Payload::Indexed {
            time: -1.0,
            index: i64::MIN,
            data: mapping(json!({"x": 1})),
        });
        roundtrip(Payload::Array {
            time: 2.0,
            index: 0,
            buffer: Buffer::from_f64(vec![0], &[]).unwrap(),
        });
        roundtrip(Payload::Frame {
            time: 3.0,
            index: i64::MAX,
            buffer: frame,
        });
    }

    #[test]
    fn test_header_layout() {
        let msg = Message::with_timestamp(
            "w1",
            5.0,
            Payload::Indexed {
                time: 4.0,
                index: 7,
                data: Mapping::new(),
            },
        );
        let parts = msg.encode().unwrap();
        assert_eq!(parts.len(), 7);
        assert_eq!(&parts[0][..], b"data");
        assert_eq!(&parts[1][..], b"w1");
        assert_eq!(&parts[3][..], b"i");
    }

    #[test]
    fn test_unknown_tag_and_flags() {
        let mut parts = Message::new("w1", Payload::Trigger).encode().unwrap();
        parts[0] = Bytes::from_static(b"telemetry");
        assert_eq!(
            Message::decode(&parts),
            Err(CodecError::UnknownTopic("telemetry".into()))
        );

        let mut parts = Message::new("w1", Payload::Trigger).encode().unwrap();
        parts[0] = Bytes::from_static(b"data");
        parts[3] = Bytes::from_static(b"z");
        assert!(matches!(Message::decode(&parts), Err(CodecError::UnknownShape { .. })));

        // correct tag but flags that disagree with the topic
        let mut parts = Message::new("w1", Payload::String("x".into())).encode().unwrap();
        parts[3] = Bytes::from_static(b"b");
        assert!(matches!(Message::decode(&parts), Err(CodecError::UnknownShape { .. })));
    }

    #[test]
    fn test_missing_and_trailing_parts() {
        let mut parts = Message::new("w1", Payload::Connection(true)).encode().unwrap();
        parts.pop();
        assert_eq!(Message::decode(&parts), Err(CodecError::MissingPart(4)));

        let mut parts = Message::new("w1", Payload::Exit).encode().unwrap();
        parts.push(Bytes::from_static(b"extra"));
        assert_eq!(Message::decode(&parts), Err(CodecError::TrailingParts(1)));

        assert_eq!(Message::decode(&[]), Err(CodecError::MissingPart(0)));
    }

    #[test]
    fn test_kind_set() {
        let set = KindSet::of(&[MessageKind::Exit, MessageKind::Event]);
        assert!(set.contains(MessageKind::Exit));
        assert!(!set.contains(MessageKind::Frame));
        assert_eq!(KindSet::from_bits(set.bits()), set);
        assert_eq!(KindSet::data().iter().count(), 4);
        assert!(KindSet::all().contains(MessageKind::Frame));
        assert!(KindSet::empty().is_empty());
    }
}
