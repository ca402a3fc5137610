//! streampix-io: Emission, replay, and the live TCP session.
//!
//! This crate owns everything that crosses the process boundary: the
//! framed snapshot serialization and its consumers, memory-mapped
//! replay of raw captures, the client control handshake, and the
//! threaded live acquisition session.

mod emitter;
mod error;
mod handshake;
mod pipeline;
mod replay;
mod server;
mod snapshot;

pub use emitter::{
    ArtifactWriter, EmissionScheduler, FrameConsumer, SnapshotConsumer, SnapshotSlot,
};
pub use error::{Error, Result};
pub use handshake::{Handshake, HANDSHAKE_LEN};
pub use pipeline::{replay_file, replay_folder, Pipeline};
pub use replay::{FolderReplay, MappedCapture};
pub use server::{LiveSession, SessionExit};
pub use snapshot::{
    legacy_text_array, snapshot_frames, ArrayId, ElemType, Frame, FRAME_MAGIC, FRAME_SENTINEL,
    FRAME_VERSION, HEADER_LEN,
};
