use std::fmt;

/// The stable identifier of a sync stage.
///
/// Stage ids double as the persistent key under which a stage's progress
/// watermarks are stored, so they must never change once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub &'static str);

impl StageId {
    /// Header download stage (upstream of this crate).
    pub const HEADERS: StageId = StageId("Headers");
    /// Block body download stage (upstream of this crate).
    pub const BODIES: StageId = StageId("Bodies");
    /// Hash to number index stage.
    pub const BLOCK_HASHES: StageId = StageId("BlockHashes");
    /// Transaction sender recovery stage.
    pub const SENDERS: StageId = StageId("Senders");

    /// The id as a string slice.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
