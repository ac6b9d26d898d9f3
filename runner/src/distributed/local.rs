//! In-process rank transport: every rank runs on its own OS thread and shares nothing with
//! the other ranks but its mailbox, the collective rendezvous and the shared-state files.

use super::{
    comm::{CommError, Communicator, Membership, Resized, MASTER},
    message::{Envelope, Message},
};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    mem::{discriminant, Discriminant},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, info_span};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Contribution {
    Barrier,
    MaxLoc(f64),
    Broadcast { root: usize, value: Option<u64> },
    Resize(Option<i64>),
}

#[derive(Debug, Default)]
struct Round {
    number: u64,
    expected: usize,
    arrived: usize,
    kind: Option<Discriminant<Contribution>>,
    slots: Vec<Option<Contribution>>,
    // results of finished rounds and how many ranks still have to pick them up
    completed: BTreeMap<u64, (Arc<Vec<Contribution>>, usize)>,
    aborted: bool,
}

/// All-gather of one contribution per rank, the building block of every collective.
#[derive(Debug, Default)]
struct Rendezvous {
    state: Mutex<Round>,
    ready: Condvar,
}

impl Rendezvous {
    fn exchange(
        &self,
        rank: usize,
        size: usize,
        contribution: Contribution,
    ) -> Result<Arc<Vec<Contribution>>, CommError> {
        let mut round = self.state.lock();

        if round.aborted {
            return Err(CommError::Aborted);
        }

        if round.arrived == 0 {
            round.expected = size;
            round.kind = Some(discriminant(&contribution));
            round.slots = vec![None; size];
        } else if round.expected != size {
            return Err(CommError::violation(
                rank,
                format!(
                    "collective over {size} ranks joined a round over {} ranks",
                    round.expected
                ),
            ));
        } else if round.kind != Some(discriminant(&contribution)) {
            return Err(CommError::violation(
                rank,
                format!("mismatched collective {contribution:?}"),
            ));
        }

        let Some(slot) = round.slots.get_mut(rank) else {
            return Err(CommError::InvalidRank { rank, size });
        };
        if slot.is_some() {
            return Err(CommError::violation(rank, "entered the same collective twice"));
        }
        *slot = Some(contribution);

        round.arrived += 1;
        let number = round.number;

        if round.arrived == round.expected {
            let results: Arc<Vec<Contribution>> =
                Arc::new(round.slots.iter_mut().filter_map(Option::take).collect());
            let readers = round.expected - 1;

            if readers > 0 {
                round.completed.insert(number, (Arc::clone(&results), readers));
            }
            round.arrived = 0;
            round.kind = None;
            round.number += 1;
            self.ready.notify_all();

            return Ok(results);
        }

        while !round.completed.contains_key(&number) && !round.aborted {
            self.ready.wait(&mut round);
        }

        let Some((results, readers)) = round.completed.get_mut(&number) else {
            return Err(CommError::Aborted);
        };
        let results = Arc::clone(results);
        *readers -= 1;
        let remaining = *readers;

        if remaining == 0 {
            round.completed.remove(&number);
        }

        Ok(results)
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.ready.notify_all();
    }
}

type Spawner = Box<dyn Fn(LocalComm) -> Result<(), CommError> + Send + Sync>;

struct ClusterInner {
    max_ranks: usize,
    mailboxes: Vec<(Sender<Envelope>, Receiver<Envelope>)>,
    collective: Rendezvous,
    aborted: AtomicBool,
    first_failure: Mutex<Option<usize>>,
    // dropping the sender wakes every rank blocked in `recv`
    abort_tx: Mutex<Option<Sender<()>>>,
    abort_rx: Receiver<()>,
    spawner: OnceCell<Spawner>,
}

impl ClusterInner {
    fn new(max_ranks: usize) -> Self {
        let (abort_tx, abort_rx) = unbounded();

        Self {
            max_ranks,
            mailboxes: (0..max_ranks).map(|_| unbounded()).collect(),
            collective: Rendezvous::default(),
            aborted: AtomicBool::new(false),
            first_failure: Mutex::new(None),
            abort_tx: Mutex::new(Some(abort_tx)),
            abort_rx,
            spawner: OnceCell::new(),
        }
    }

    fn abort(&self, rank: usize) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            *self.first_failure.lock() = Some(rank);
            error!(rank = rank, "Aborting cluster");
        }

        self.abort_tx.lock().take();
        self.collective.abort();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Handle of one rank on the in-process cluster.
pub struct LocalComm {
    rank: usize,
    size: usize,
    generation: u64,
    joined: Option<Resized>,
    inner: Arc<ClusterInner>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("generation", &self.generation)
            .field("joined", &self.joined)
            .finish()
    }
}

impl LocalComm {
    pub fn max_ranks(&self) -> usize {
        self.inner.max_ranks
    }

    fn check_aborted(&self) -> Result<(), CommError> {
        if self.inner.is_aborted() {
            Err(CommError::Aborted)
        } else {
            Ok(())
        }
    }

    fn exchange(&self, contribution: Contribution) -> Result<Arc<Vec<Contribution>>, CommError> {
        self.check_aborted()?;
        self.inner
            .collective
            .exchange(self.rank, self.size, contribution)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, message: Message) -> Result<(), CommError> {
        self.check_aborted()?;

        if dest >= self.size {
            return Err(CommError::InvalidRank {
                rank: dest,
                size: self.size,
            });
        }

        self.inner.mailboxes[dest]
            .0
            .send(Envelope {
                source: self.rank,
                generation: self.generation,
                message,
            })
            .map_err(|_| CommError::Disconnected(dest))
    }

    fn recv(&self) -> Result<(usize, Message), CommError> {
        self.check_aborted()?;

        let mailbox = &self.inner.mailboxes[self.rank].1;
        let envelope = select! {
            recv(mailbox) -> envelope => envelope.map_err(|_| CommError::Disconnected(self.rank))?,
            recv(self.inner.abort_rx) -> _ => return Err(CommError::Aborted),
        };

        if envelope.generation != self.generation {
            return Err(CommError::violation(
                self.rank,
                format!(
                    "{} from rank {} belongs to generation {}, pool is at generation {}",
                    envelope.message.tag(),
                    envelope.source,
                    envelope.generation,
                    self.generation
                ),
            ));
        }

        Ok((envelope.source, envelope.message))
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.exchange(Contribution::Barrier).map(|_| ())
    }

    fn all_reduce_max_loc(&self, value: f64) -> Result<(f64, usize), CommError> {
        let gathered = self.exchange(Contribution::MaxLoc(value))?;
        let mut best = (f64::NEG_INFINITY, MASTER);

        for (rank, contribution) in gathered.iter().enumerate() {
            match contribution {
                // strictly greater keeps ties on the lowest rank
                Contribution::MaxLoc(value) if *value > best.0 => best = (*value, rank),
                Contribution::MaxLoc(_) => {}
                other => {
                    return Err(CommError::violation(
                        self.rank,
                        format!("rank {rank} contributed {other:?} to a MAXLOC reduction"),
                    ))
                }
            }
        }

        Ok(best)
    }

    fn broadcast(&self, root: usize, value: u64) -> Result<u64, CommError> {
        if root >= self.size {
            return Err(CommError::InvalidRank {
                rank: root,
                size: self.size,
            });
        }

        let own = (self.rank == root).then_some(value);
        let gathered = self.exchange(Contribution::Broadcast { root, value: own })?;

        if gathered
            .iter()
            .any(|contribution| !matches!(contribution, Contribution::Broadcast { root: r, .. } if *r == root))
        {
            return Err(CommError::violation(
                self.rank,
                format!("ranks disagree on the broadcast root {root}"),
            ));
        }

        match gathered.get(root) {
            Some(Contribution::Broadcast {
                value: Some(value), ..
            }) => Ok(*value),
            _ => Err(CommError::violation(
                self.rank,
                format!("root {root} did not contribute a value"),
            )),
        }
    }
}

impl Membership for LocalComm {
    fn current_size(&self) -> usize {
        self.size
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn joined(&self) -> Option<Resized> {
        self.joined
    }

    fn request_resize(&mut self, delta: Option<i64>) -> Result<Resized, CommError> {
        if self.is_master() != delta.is_some() {
            return Err(CommError::violation(
                self.rank,
                "only the master proposes a resize delta",
            ));
        }

        let gathered = self.exchange(Contribution::Resize(delta))?;
        let delta = match gathered.get(MASTER) {
            Some(Contribution::Resize(Some(delta))) => *delta,
            other => {
                return Err(CommError::violation(
                    self.rank,
                    format!("master contributed {other:?} to a resize"),
                ))
            }
        };

        let previous_size = self.size;
        let size = (previous_size as i64)
            .saturating_add(delta)
            .clamp(1, self.inner.max_ranks as i64) as usize;
        let generation = self.generation + 1;

        if self.is_master() && size > previous_size {
            let spawner = self
                .inner
                .spawner
                .get()
                .ok_or_else(|| CommError::violation(self.rank, "cluster cannot spawn ranks"))?;

            for rank in previous_size..size {
                spawner(LocalComm {
                    rank,
                    size,
                    generation,
                    joined: Some(Resized {
                        generation,
                        previous_size,
                        size,
                        departed: false,
                    }),
                    inner: Arc::clone(&self.inner),
                })?;
            }
        }

        self.size = size;
        self.generation = generation;

        Ok(Resized {
            generation,
            previous_size,
            size,
            departed: self.rank >= size,
        })
    }

    fn join_barrier(&self) -> Result<(), CommError> {
        self.exchange(Contribution::Barrier).map(|_| ())
    }
}

type RankHandle<T, E> = (usize, JoinHandle<Result<T, E>>);

/// Launches a pool of ranks running the same entry point (SPMD) and collects their results.
pub struct LocalCluster;

impl LocalCluster {
    /// Run `entry` on `size` ranks, the pool may grow up to `max_ranks` at runtime.
    ///
    /// Returns the results of all ranks in spawn order (initial ranks first, then joiners). If
    /// any rank fails the cluster is aborted and the error of the first failing rank is
    /// returned.
    pub fn run<T, E, F>(size: usize, max_ranks: usize, entry: F) -> Result<Vec<T>, E>
    where
        T: Send + 'static,
        E: From<CommError> + fmt::Display + Send + 'static,
        F: Fn(LocalComm) -> Result<T, E> + Send + Sync + 'static,
    {
        let size = size.max(1);
        let inner = Arc::new(ClusterInner::new(max_ranks.max(size)));
        let handles: Arc<Mutex<VecDeque<RankHandle<T, E>>>> = Arc::default();
        let entry = Arc::new(entry);

        let spawner: Spawner = {
            let handles = Arc::clone(&handles);

            Box::new(move |comm: LocalComm| {
                let rank = comm.rank;
                let entry = Arc::clone(&entry);
                let inner = Arc::clone(&comm.inner);

                let handle = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn(move || {
                        let span = info_span!("rank", rank = rank);
                        let _guard = span.enter();

                        let result = match panic::catch_unwind(AssertUnwindSafe(|| (*entry)(comm))) {
                            Ok(result) => result,
                            Err(_) => Err(E::from(CommError::RankPanicked(rank))),
                        };

                        if let Err(error) = &result {
                            error!(error = %error, "Rank failed");
                            inner.abort(rank);
                        }

                        result
                    })
                    .map_err(|error| CommError::Spawn {
                        rank,
                        reason: error.to_string(),
                    })?;

                handles.lock().push_back((rank, handle));

                Ok(())
            })
        };

        if inner.spawner.set(spawner).is_err() {
            return Err(E::from(CommError::violation(MASTER, "spawner set twice")));
        }

        info!(size = size, max_ranks = inner.max_ranks, "Starting local cluster");

        for rank in 0..size {
            let comm = LocalComm {
                rank,
                size,
                generation: 0,
                joined: None,
                inner: Arc::clone(&inner),
            };

            if let Some(spawner) = inner.spawner.get() {
                if let Err(error) = spawner(comm) {
                    inner.abort(rank);

                    return Err(E::from(error));
                }
            }
        }

        let mut results = Vec::new();
        let mut failures = BTreeMap::new();

        loop {
            let next = handles.lock().pop_front();
            let Some((rank, handle)) = next else {
                break;
            };

            match handle.join() {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(error)) => {
                    failures.entry(rank).or_insert(error);
                }
                Err(_) => {
                    inner.abort(rank);
                    failures
                        .entry(rank)
                        .or_insert_with(|| E::from(CommError::RankPanicked(rank)));
                }
            }
        }

        let first = *inner.first_failure.lock();
        match first.and_then(|rank| failures.remove(&rank)) {
            Some(error) => Err(error),
            None => match failures.into_values().next() {
                Some(error) => Err(error),
                None => {
                    debug!(ranks = results.len(), "Local cluster finished");

                    Ok(results)
                }
            },
        }
    }
}
