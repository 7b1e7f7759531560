//! Background tasks driving a live session's socket.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
