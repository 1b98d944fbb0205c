//! Native protocol commands and version constants.

/// Protocol version this library speaks.
pub const PROTOCOL_VERSION: u32 = 30;

/// Oldest peer version the library will talk to.
pub const PROTOCOL_VERSION_MIN: u32 = 8;

/// Bit 31 of the `AUTH` version word advertises shared-memory capability
/// on protocol versions >= 13.
pub const VERSION_SHM_BIT: u32 = 0x8000_0000;

/// Mask clearing the capability bit from a version word.
pub const VERSION_MASK: u32 = 0x7FFF_FFFF;

/// The distinguished invalid object index.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Protocol commands. Discriminants are wire values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum Command {
    // Correlated by tag.
    Error = 0,
    Timeout = 1,
    Reply = 2,

    // Client -> server requests.
    CreatePlaybackStream = 3,
    DeletePlaybackStream = 4,
    CreateRecordStream = 5,
    DeleteRecordStream = 6,
    Exit = 7,
    Auth = 8,
    SetClientName = 9,
    SetDefaultSink = 44,
    SetDefaultSource = 45,
    Subscribe = 35,

    // Server -> client, routed by command.
    Request = 61,
    Overflow = 62,
    Underflow = 63,
    PlaybackStreamKilled = 64,
    RecordStreamKilled = 65,
    SubscribeEvent = 66,
    PlaybackStreamSuspended = 76,
    RecordStreamSuspended = 77,
    PlaybackStreamMoved = 78,
    RecordStreamMoved = 79,
    UpdateClientProplist = 80,
    RemoveClientProplist = 83,
    Started = 86,
    Extension = 87,
    ClientEvent = 91,
    PlaybackStreamEvent = 92,
    RecordStreamEvent = 93,
    PlaybackBufferAttrChanged = 94,
    RecordBufferAttrChanged = 95,
}

impl Command {
    pub fn from_wire(v: u32) -> Option<Command> {
        use Command::*;
        Some(match v {
            0 => Error,
            1 => Timeout,
            2 => Reply,
            3 => CreatePlaybackStream,
            4 => DeletePlaybackStream,
            5 => CreateRecordStream,
            6 => DeleteRecordStream,
            7 => Exit,
            8 => Auth,
            9 => SetClientName,
            35 => Subscribe,
            44 => SetDefaultSink,
            45 => SetDefaultSource,
            61 => Request,
            62 => Overflow,
            63 => Underflow,
            64 => PlaybackStreamKilled,
            65 => RecordStreamKilled,
            66 => SubscribeEvent,
            76 => PlaybackStreamSuspended,
            77 => RecordStreamSuspended,
            78 => PlaybackStreamMoved,
            79 => RecordStreamMoved,
            80 => UpdateClientProplist,
            83 => RemoveClientProplist,
            86 => Started,
            87 => Extension,
            91 => ClientEvent,
            92 => PlaybackStreamEvent,
            93 => RecordStreamEvent,
            94 => PlaybackBufferAttrChanged,
            95 => RecordBufferAttrChanged,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Commands correlated to a request by tag rather than dispatched by
    /// command.
    pub fn is_reply_kind(self) -> bool {
        matches!(self, Command::Reply | Command::Error | Command::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(Command::Auth.to_wire(), 8);
        assert_eq!(Command::SetClientName.to_wire(), 9);
        assert_eq!(Command::SetDefaultSink.to_wire(), 44);
        assert_eq!(Command::SubscribeEvent.to_wire(), 66);
        assert_eq!(Command::Extension.to_wire(), 87);
        for v in [0u32, 7, 8, 9, 44, 61, 87, 95] {
            assert_eq!(Command::from_wire(v).expect("known").to_wire(), v);
        }
        assert!(Command::from_wire(10_000).is_none());
    }

    #[test]
    fn reply_kinds() {
        assert!(Command::Reply.is_reply_kind());
        assert!(Command::Error.is_reply_kind());
        assert!(Command::Timeout.is_reply_kind());
        assert!(!Command::Auth.is_reply_kind());
    }
}
