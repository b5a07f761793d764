//! Opus codec wrappers and the Ogg demuxer
//!
//! The stream pipeline either runs the in-process encoder or reads an
//! external encoder's Ogg output through [`demux::OggDemuxer`]. Inbound mic
//! audio is decoded per client with [`OpusDecoder`].

pub mod decoder;
pub mod demux;
pub mod encoder;
pub mod pcm;

pub use decoder::OpusDecoder;
pub use demux::{CapturedPacket, ContainerPage, OggDemuxer, PacketExtractor};
pub use encoder::OpusEncoder;
