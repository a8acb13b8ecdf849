//! File attachments for multipart requests.

/// A file to upload alongside a JSON body.
///
/// When any files are attached, the engine switches to a multipart form with
/// the JSON body in a `payload_json` part and each file in a `files[n]` part,
/// per Discord's upload contract.
#[derive(Debug, Clone)]
pub struct AttachedFile {
    /// File name reported to Discord.
    pub filename: String,

    /// Raw file contents.
    pub data: Vec<u8>,
}

impl AttachedFile {
    /// Create an attachment from a name and raw bytes.
    #[must_use]
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }
}
