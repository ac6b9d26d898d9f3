use super::message::{Message, Tag};
use thiserror::Error;

/// rank of the master in every pool generation
pub const MASTER: usize = 0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    #[error("Cluster was aborted by a failing rank")]
    Aborted,
    #[error("Mailbox of rank {0} is disconnected")]
    Disconnected(usize),
    #[error("Rank {0} panicked")]
    RankPanicked(usize),
    #[error("Failed to spawn rank {rank}: {reason}")]
    Spawn { rank: usize, reason: String },
    #[error("Rank {rank} is outside of the pool of size {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("Protocol violation on rank {rank}: {detail}")]
    ProtocolViolation { rank: usize, detail: String },
}

impl CommError {
    pub fn violation(rank: usize, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            rank,
            detail: detail.into(),
        }
    }

    pub fn unexpected(rank: usize, source: usize, tag: Tag) -> Self {
        Self::violation(rank, format!("unexpected {tag} from rank {source}"))
    }
}

/// Message primitives used by the master-worker protocol and the global reduction.
///
/// Ranks are single threaded, every call blocks the calling rank until it completes.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == MASTER
    }

    fn send(&self, dest: usize, message: Message) -> Result<(), CommError>;

    /// blocking receive from any source, returns the source rank and the message
    fn recv(&self) -> Result<(usize, Message), CommError>;

    fn barrier(&self) -> Result<(), CommError>;

    /// MAXLOC all-reduce: the largest value over all ranks and the lowest rank holding it
    fn all_reduce_max_loc(&self, value: f64) -> Result<(f64, usize), CommError>;

    /// every rank returns the value contributed by `root`
    fn broadcast(&self, root: usize, value: u64) -> Result<u64, CommError>;
}

/// Outcome of a membership change, as seen by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resized {
    pub generation: u64,
    pub previous_size: usize,
    pub size: usize,
    /// the calling rank is not part of the new generation
    pub departed: bool,
}

/// Process membership as exposed to the adaptation controller.
///
/// Membership only changes inside `request_resize`, a collective over every member of the
/// current generation. Only the master proposes a delta, everybody else passes `None`.
pub trait Membership {
    fn current_size(&self) -> usize;

    fn generation(&self) -> u64;

    /// `Some` if this rank was spawned by a resize and still has to bootstrap
    fn joined(&self) -> Option<Resized>;

    fn request_resize(&mut self, delta: Option<i64>) -> Result<Resized, CommError>;

    /// first collective of a new generation, joiners included
    fn join_barrier(&self) -> Result<(), CommError>;
}
