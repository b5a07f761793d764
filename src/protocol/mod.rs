//! Wire protocol: binary audio frames and JSON control messages

pub mod control;
pub mod frame;

pub use control::{CodecInfo, ControlMessage, ServerEvent, StreamCodec};
pub use frame::{Frame, FrameType, HEADER_LEN};
