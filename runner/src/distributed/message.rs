use super::jobs::JobId;
use std::fmt;

/// Point-to-point messages of the master-worker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// master -> worker: compute the given job
    Work(JobId),
    /// worker -> master: the job's records are durable
    Done(JobId),
    /// master -> worker: the pass is complete
    Terminate,
    /// master -> worker: drained, join the resize collective
    AdaptSignal,
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Self::Work(_) => Tag::Work,
            Self::Done(_) => Tag::Done,
            Self::Terminate => Tag::Terminate,
            Self::AdaptSignal => Tag::AdaptSignal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Work,
    Done,
    Terminate,
    AdaptSignal,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Work => "WORK",
            Self::Done => "DONE",
            Self::Terminate => "TERMINATE",
            Self::AdaptSignal => "ADAPT_SIGNAL",
        };

        f.write_str(name)
    }
}

/// A message as it travels through a mailbox, tagged with the sender and the pool
/// generation the sender belonged to when sending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub source: usize,
    pub generation: u64,
    pub message: Message,
}
