//! Wire constants shared by the control and media planes.

pub const DEFAULT_PORT: u16 = 8888;

pub const MAX_ROOM_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CIPHERTEXT_LEN: usize = 65536;
pub const MAX_FILENAME_LEN: usize = 1024;
pub const FILE_CHUNK_SIZE: usize = 8192;

/// Control frame message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    FileStart,
    FileChunk,
    FileEnd,
    CallRequest,
    CallAccept,
    CallReject,
    CallEnd,
    UdpInfo,
    /// A type this build does not know. Receivers skip it.
    Unknown(u8),
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::FileStart => 1,
            Self::FileChunk => 2,
            Self::FileEnd => 3,
            Self::CallRequest => 10,
            Self::CallAccept => 11,
            Self::CallReject => 12,
            Self::CallEnd => 13,
            Self::UdpInfo => 14,
            Self::Unknown(v) => v,
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, Self::FileStart | Self::FileChunk | Self::FileEnd)
    }

    pub fn is_call_signal(self) -> bool {
        matches!(
            self,
            Self::CallRequest | Self::CallAccept | Self::CallReject | Self::CallEnd | Self::UdpInfo
        )
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Text,
            1 => Self::FileStart,
            2 => Self::FileChunk,
            3 => Self::FileEnd,
            10 => Self::CallRequest,
            11 => Self::CallAccept,
            12 => Self::CallReject,
            13 => Self::CallEnd,
            14 => Self::UdpInfo,
            other => Self::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value.as_u8()
    }
}
