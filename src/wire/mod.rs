//! Wire protocol: payload codecs, the message catalog and stream framing.

pub mod catalog;
pub mod codec;
pub mod frame;

pub use catalog::{now, DataShape, ErrorReport, KindSet, Message, MessageKind, Payload, Topic};
pub use codec::{Buffer, CodecError, DType, Mapping};
