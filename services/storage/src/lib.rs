//! OSP Storage Service
//!
//! Storage layer and query API for the open sensor platform. Soil sensors
//! report ticks through a coordinating controller; this crate owns the tick
//! record codec, the key/value backed stores that hold ticks and the
//! controller/sensor directory, and the HTTP surface dashboards read from.
//!
//! ## Architecture
//!
//! ```text
//!  osp-ingest                      Redis                        Dashboard
//! ┌──────────────┐           ┌──────────────────┐          ┌──────────────┐
//! │ Pipeline     │──────────▶│ osp:controllers  │          │ HTTP client  │
//! └──────────────┘           │ osp:sensor:*     │          └──────────────┘
//!        │                   │ osp:coordinator:*│                 │
//!        ▼                   │ osp:logs         │                 ▼
//! ┌──────────────┐           └──────────────────┘          ┌──────────────┐
//! │ TimeSeries / │                   ▲                     │ Query API    │
//! │ Directory    │───────────────────┴─────────────────────│ (axum)       │
//! └──────────────┘                                         └──────────────┘
//! ```
//!
//! Every store works against the [`KvStore`] trait so the Redis backend can be
//! swapped for [`MemoryStore`] in tests.

pub mod api;
pub mod codec;
pub mod config;
pub mod directory;
pub mod kv;
pub mod memory_store;
pub mod oplog;
pub mod readings;
pub mod redis_store;
pub mod tick;
pub mod timeseries;

pub use api::{create_router, start_api_server, AppState};
pub use codec::{
    decode_battery_voltage, decode_signed_magnitude16, decode_tick_record, DecodeError,
    RecordZone,
};
pub use config::Config;
pub use directory::{Controller, Coordinates, DirectoryStore, Sensor};
pub use kv::{KvStore, StoreError};
pub use memory_store::MemoryStore;
pub use oplog::OpLog;
pub use readings::{ControllerReading, ReadingStore};
pub use redis_store::RedisStore;
pub use tick::{DecodedTick, PaginatedTicks, Tick};
pub use timeseries::{TickRange, TimeSeriesStore};
