use thiserror::Error;

/// Failures `Packet::build_from_*` can report. None of these are fatal to
/// the process; a `Framing` error means the caller should treat the
/// connection as broken and close it, since a byte-stream decoder that
/// gets out of sync cannot recover.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("not enough bytes buffered yet")]
    Incomplete,
    #[error("payload length/id framing was inconsistent")]
    Framing,
}

/// Failures `LockFreeQueue::push` can report.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
}
