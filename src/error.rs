/// Coarse classification of an [`Error`].
///
/// Every transaction failure falls into exactly one of these categories, which
/// allows callers to tell a noisy link apart from a device that rejected the
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request could not be encoded, nothing was sent.
    Encoding,
    /// The transport failed or returned fewer bytes than required.
    Transport,
    /// The response was not delimited or sized as the protocol requires.
    Frame,
    /// The response was well formed but its checksum did not match.
    Integrity,
    /// The device answered with a nonzero status code.
    Device,
    /// The response payload is too short for the requested record.
    Decode,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot encode request with {0} payload bytes")]
    Encoding(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid start byte {0:#04X}")]
    StartByte(u8),
    #[error("Invalid stop byte {0:#04X}")]
    StopByte(u8),
    #[error("Response length {0} exceeds the frame limit")]
    ResponseLength(u8),
    #[error("Invalid checksum - calculated={calculated:#06X} received={received:#06X}")]
    CheckSum { calculated: u16, received: u16 },
    #[error("Device returned error status {0:#04X}")]
    Device(u8),
    #[error("Invalid reply size - required={required} received={received}")]
    ReplySize { required: usize, received: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::Io(_) => ErrorKind::Transport,
            Error::StartByte(_) | Error::StopByte(_) | Error::ResponseLength(_) => ErrorKind::Frame,
            Error::CheckSum { .. } => ErrorKind::Integrity,
            Error::Device(_) => ErrorKind::Device,
            Error::ReplySize { .. } => ErrorKind::Decode,
        }
    }
}
