use std::collections::VecDeque;

use crate::packet::Packet;

/// Control chunks awaiting transmission, drained in FIFO order at the top
/// of every gather pass.
pub(crate) type ControlQueue = VecDeque<Packet>;
