//! Peer-to-peer content-addressable blob distribution, agent core.
//!
//! An agent embeds a [`scheduler`]: one actor that owns every torrent
//! session, a content-addressable [`store`] holding blobs in download
//! and cache states, a piece-exchange [`protocol`] spoken between
//! agents, and a [`tracker`] announce client for peer discovery. Blob
//! metainfo is resolved from the [`origin`] cluster on first sight and
//! persisted next to the blob.
//!
//! The entry point is [`scheduler::spawn`], which returns a
//! [`scheduler::SchedulerHandle`] exposing the control surface:
//! download, remove, probe, reload and blacklist snapshot.

pub mod conf;
pub mod error;
pub mod metainfo;
pub mod origin;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod tracker;

mod define;
pub use define::*;
