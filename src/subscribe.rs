//! Server event subscription types.
//!
//! A `SUBSCRIBE_EVENT` packet carries one word describing what changed:
//! the low nibble selects the facility, bits 4..5 the operation.

/// Server-side object class an event refers to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
#[non_exhaustive]
pub enum Facility {
    Sink = 0,
    Source = 1,
    SinkInput = 2,
    SourceOutput = 3,
    Module = 4,
    Client = 5,
    SampleCache = 6,
    Server = 7,
    Card = 9,
}

/// What happened to the object.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventOp {
    New,
    Change,
    Remove,
}

const FACILITY_MASK: u32 = 0x000F;
const TYPE_MASK: u32 = 0x0030;
const TYPE_NEW: u32 = 0x0000;
const TYPE_CHANGE: u32 = 0x0010;
const TYPE_REMOVE: u32 = 0x0020;

/// A decoded subscription event word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubscriptionEvent(u32);

impl SubscriptionEvent {
    pub fn from_wire(v: u32) -> SubscriptionEvent {
        SubscriptionEvent(v)
    }

    pub fn facility(self) -> Option<Facility> {
        use Facility::*;
        Some(match self.0 & FACILITY_MASK {
            0 => Sink,
            1 => Source,
            2 => SinkInput,
            3 => SourceOutput,
            4 => Module,
            5 => Client,
            6 => SampleCache,
            7 => Server,
            9 => Card,
            _ => return None,
        })
    }

    pub fn operation(self) -> Option<EventOp> {
        match self.0 & TYPE_MASK {
            TYPE_NEW => Some(EventOp::New),
            TYPE_CHANGE => Some(EventOp::Change),
            TYPE_REMOVE => Some(EventOp::Remove),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        self.0
    }
}

/// Subscription interest masks for the `SUBSCRIBE` request.
pub mod mask {
    pub const NULL: u32 = 0x0000;
    pub const SINK: u32 = 0x0001;
    pub const SOURCE: u32 = 0x0002;
    pub const SINK_INPUT: u32 = 0x0004;
    pub const SOURCE_OUTPUT: u32 = 0x0008;
    pub const MODULE: u32 = 0x0010;
    pub const CLIENT: u32 = 0x0020;
    pub const SAMPLE_CACHE: u32 = 0x0040;
    pub const SERVER: u32 = 0x0080;
    pub const CARD: u32 = 0x0200;
    pub const ALL: u32 = 0x02FF;
}
