#![deny(unsafe_code)]

//! Pure Rust client core for the PulseAudio native protocol.
//!
//! The entry point is [`Context`]: it dials the daemon over an ordered
//! candidate list (optionally forking one when none is running),
//! authenticates, negotiates protocol capabilities, and multiplexes
//! tagged requests, server events, and per-stream media frames over one
//! socket — all driven by a caller-owned [`Mainloop`].

pub mod command;
pub mod config;
pub mod context;
pub mod error;
mod forkdetect;
pub mod iochannel;
pub mod mainloop;
pub mod memblock;
pub mod memblockq;
pub mod operation;
pub mod pdispatch;
pub mod presence;
pub mod proplist;
pub mod pstream;
pub mod sample;
pub mod serverlist;
pub mod socket_client;
pub mod spawn;
pub mod stream;
pub mod subscribe;
pub mod tagstruct;

pub use error::{ErrorCode, Result};

// Re-export the working set at the crate root for convenience.
pub use crate::command::{Command, INVALID_INDEX, PROTOCOL_VERSION};
pub use crate::config::ClientConfig;
pub use crate::context::{
    ConnectFlags, Context, ContextState, EXT_DEVICE_MANAGER, EXT_STREAM_RESTORE, WeakContext,
    library_version, rtclock_now,
};
pub use crate::mainloop::{Mainloop, USEC_INVALID};
pub use crate::memblock::Memblock;
pub use crate::memblockq::SeekMode;
pub use crate::operation::{Operation, OperationState};
pub use crate::presence::{BusKind, DaemonPresence, ManualPresence};
pub use crate::proplist::{PROP_APPLICATION_NAME, Proplist, UpdateMode};
pub use crate::sample::{SampleFormat, SampleSpec};
pub use crate::spawn::SpawnApi;
pub use crate::stream::{Direction, Stream, StreamState};
pub use crate::subscribe::{EventOp, Facility, SubscriptionEvent};
