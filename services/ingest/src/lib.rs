//! TCP ingest for sensor tick batches.
//!
//! Field controllers open a connection, write newline separated tick records
//! and close it (or send a lone `\r\n`). Each batch is decoded, stored and
//! attributed to a controller through the `osp-storage` stores.
//!
//! ```text
//! TcpListener -> FrameBuffer -> IngestPipeline -> TimeSeriesStore
//!                                     │
//!                                     └──> AssociationResolver -> DirectoryStore
//! ```

pub mod config;
pub mod frame_decoder;
pub mod listener;
pub mod pipeline;
pub mod resolver;

pub use config::IngestConfig;
pub use frame_decoder::{records, ChunkStatus, FrameBuffer, FrameError};
pub use listener::{IngestListener, ListenerStats};
pub use pipeline::{IngestPipeline, PipelineError};
pub use resolver::AssociationResolver;
