pub mod error;
mod lock_free_queue;
mod packet;
mod pipe;
mod ring_buffer;

pub use error::{PacketError, QueueError};
pub use lock_free_queue::LockFreeQueue;
pub use packet::{MIN_HEAD_SIZE, Packet};
pub use pipe::Pipe;
pub use ring_buffer::RingBuffer;
