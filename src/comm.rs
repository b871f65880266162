//! Process-parallel communication.
//!
//! All operations are collective unless stated otherwise: every rank must call them in the same
//! order. [`ThreadComm`] runs several ranks as threads inside one process.
use crate::error::{Result, SystemError};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use eyre::eyre;
use fenris_traits::Reduction;
use log::warn;
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub trait Communicator: Debug + Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    /// Gathers a variable-length slice from every rank, ordered by rank.
    fn all_gather_u64(&self, values: &[u64]) -> Result<Vec<Vec<u64>>>;

    fn all_gather_f64(&self, values: &[f64]) -> Result<Vec<Vec<f64>>>;

    /// Sends one message to each listed neighbor and receives one message from each of them.
    ///
    /// The neighbor relation must be symmetric. Received messages are returned in the order of
    /// `outgoing`.
    fn exchange_u64(&self, outgoing: &[(usize, Vec<u64>)]) -> Result<Vec<(usize, Vec<u64>)>>;

    fn exchange_f64(&self, outgoing: &[(usize, Vec<f64>)]) -> Result<Vec<(usize, Vec<f64>)>>;

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        // Summing in rank order keeps the result bit-identical on every rank
        Ok(self.all_gather_f64(&[value])?.iter().flatten().sum())
    }

    fn all_reduce_max(&self, value: f64) -> Result<f64> {
        Ok(self
            .all_gather_f64(&[value])?
            .iter()
            .flatten()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b)))
    }

    fn all_reduce_sum_u64(&self, value: u64) -> Result<u64> {
        Ok(self.all_gather_u64(&[value])?.iter().flatten().sum())
    }

    /// Sum of `value` over all ranks lower than this one.
    fn exclusive_scan_u64(&self, value: u64) -> Result<u64> {
        let gathered = self.all_gather_u64(&[value])?;
        Ok(gathered[..self.rank()].iter().flatten().sum())
    }

    fn all_reduce_sum_slice(&self, values: &mut [f64]) -> Result<()> {
        let gathered = self.all_gather_f64(values)?;
        values.iter_mut().for_each(|v| *v = 0.0);
        for contribution in &gathered {
            if contribution.len() != values.len() {
                return Err(SystemError::Communication(format!(
                    "slice reduction with mismatched lengths {} and {}",
                    values.len(),
                    contribution.len()
                )));
            }
            for (v, c) in values.iter_mut().zip(contribution) {
                *v += c;
            }
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather_u64(&[]).map(|_| ())
    }
}

/// The single-process communicator.
#[derive(Debug, Copy, Clone, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn all_gather_u64(&self, values: &[u64]) -> Result<Vec<Vec<u64>>> {
        Ok(vec![values.to_vec()])
    }

    fn all_gather_f64(&self, values: &[f64]) -> Result<Vec<Vec<f64>>> {
        Ok(vec![values.to_vec()])
    }

    fn exchange_u64(&self, outgoing: &[(usize, Vec<u64>)]) -> Result<Vec<(usize, Vec<u64>)>> {
        serial_exchange(outgoing)
    }

    fn exchange_f64(&self, outgoing: &[(usize, Vec<f64>)]) -> Result<Vec<(usize, Vec<f64>)>> {
        serial_exchange(outgoing)
    }
}

fn serial_exchange<T: Clone>(outgoing: &[(usize, Vec<T>)]) -> Result<Vec<(usize, Vec<T>)>> {
    match outgoing.iter().find(|(rank, _)| *rank != 0) {
        Some((rank, _)) => Err(SystemError::Communication(format!(
            "serial communicator cannot exchange with rank {}",
            rank
        ))),
        None => Ok(outgoing.to_vec()),
    }
}

#[derive(Debug)]
enum Message {
    U64(Vec<u64>),
    F64(Vec<f64>),
}

/// One rank of an in-process group of communicating threads.
///
/// Every ordered pair of ranks has a dedicated FIFO channel, so messages between two ranks are
/// matched by the order of the collective calls.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    senders: Vec<Sender<Message>>,
    receivers: Vec<Receiver<Message>>,
    timeout: Duration,
}

impl ThreadComm {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates the communicators of a group with `num_ranks` ranks, indexed by rank.
    pub fn create(num_ranks: usize) -> Vec<ThreadComm> {
        Self::create_with_timeout(num_ranks, Self::DEFAULT_TIMEOUT)
    }

    /// Same as [`ThreadComm::create`], but a receive waiting longer than `timeout` fails.
    pub fn create_with_timeout(num_ranks: usize, timeout: Duration) -> Vec<ThreadComm> {
        // channels[src][dst]
        let channels: Vec<Vec<_>> = (0..num_ranks)
            .map(|_| (0..num_ranks).map(|_| unbounded()).collect())
            .collect();
        (0..num_ranks)
            .map(|rank| ThreadComm {
                rank,
                senders: (0..num_ranks)
                    .map(|dst| channels[rank][dst].0.clone())
                    .collect(),
                receivers: (0..num_ranks)
                    .map(|src| channels[src][rank].1.clone())
                    .collect(),
                timeout,
            })
            .collect()
    }

    fn send(&self, dst: usize, message: Message) -> Result<()> {
        self.senders
            .get(dst)
            .ok_or_else(|| SystemError::Communication(format!("rank {} does not exist", dst)))?
            .send(message)
            .map_err(|_| SystemError::Communication(format!("rank {} has hung up", dst)))
    }

    fn receive(&self, src: usize) -> Result<Message> {
        let receiver = self
            .receivers
            .get(src)
            .ok_or_else(|| SystemError::Communication(format!("rank {} does not exist", src)))?;
        receiver.recv_timeout(self.timeout).map_err(|err| {
            let reason = match err {
                RecvTimeoutError::Timeout => "timed out",
                RecvTimeoutError::Disconnected => "hung up",
            };
            SystemError::Communication(format!(
                "rank {} waiting for rank {}: {}",
                self.rank, src, reason
            ))
        })
    }

    fn receive_u64(&self, src: usize) -> Result<Vec<u64>> {
        match self.receive(src)? {
            Message::U64(values) => Ok(values),
            Message::F64(_) => Err(self.mismatch(src)),
        }
    }

    fn receive_f64(&self, src: usize) -> Result<Vec<f64>> {
        match self.receive(src)? {
            Message::F64(values) => Ok(values),
            Message::U64(_) => Err(self.mismatch(src)),
        }
    }

    fn mismatch(&self, src: usize) -> SystemError {
        SystemError::Communication(format!(
            "rank {} received a message of unexpected type from rank {}",
            self.rank, src
        ))
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.senders.len()
    }

    fn all_gather_u64(&self, values: &[u64]) -> Result<Vec<Vec<u64>>> {
        for dst in 0..self.num_ranks() {
            self.send(dst, Message::U64(values.to_vec()))?;
        }
        (0..self.num_ranks())
            .map(|src| self.receive_u64(src))
            .collect()
    }

    fn all_gather_f64(&self, values: &[f64]) -> Result<Vec<Vec<f64>>> {
        for dst in 0..self.num_ranks() {
            self.send(dst, Message::F64(values.to_vec()))?;
        }
        (0..self.num_ranks())
            .map(|src| self.receive_f64(src))
            .collect()
    }

    fn exchange_u64(&self, outgoing: &[(usize, Vec<u64>)]) -> Result<Vec<(usize, Vec<u64>)>> {
        for (dst, values) in outgoing {
            self.send(*dst, Message::U64(values.clone()))?;
        }
        outgoing
            .iter()
            .map(|&(src, _)| Ok((src, self.receive_u64(src)?)))
            .collect()
    }

    fn exchange_f64(&self, outgoing: &[(usize, Vec<f64>)]) -> Result<Vec<(usize, Vec<f64>)>> {
        for (dst, values) in outgoing {
            self.send(*dst, Message::F64(values.clone()))?;
        }
        outgoing
            .iter()
            .map(|&(src, _)| Ok((src, self.receive_f64(src)?)))
            .collect()
    }
}

/// Runs `f` once per rank on its own scoped thread and returns the results ordered by rank.
pub fn run_ranks<R, F>(num_ranks: usize, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(Arc<dyn Communicator>) -> R + Sync,
{
    run_ranks_with(ThreadComm::create(num_ranks), f)
}

/// Same as [`run_ranks`], but with explicitly constructed communicators.
pub fn run_ranks_with<R, F>(comms: Vec<ThreadComm>, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(Arc<dyn Communicator>) -> R + Sync,
{
    let f = &f;
    crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move |_| f(Arc::new(comm))))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .map_err(|_| SystemError::Communication(format!("rank {} panicked", rank)))
            })
            .collect::<Result<Vec<R>>>()
    })
    .map_err(|_| SystemError::Communication("a rank thread panicked".to_string()))?
}

/// Makes the outcome of a local computation collective: if any rank failed, every rank fails.
///
/// Must be called before the next collective operation that depends on the local result, so
/// that a rank returning early never leaves the others blocked in a matching exchange. A rank
/// whose own computation succeeded reports the first failing rank, keeping recoverable failures
/// recoverable on every rank.
pub fn agree<R>(comm: &dyn Communicator, local: Result<R>) -> Result<R> {
    let flag = match &local {
        Ok(_) => 0.0,
        Err(err) if err.is_recoverable() => 1.0,
        Err(_) => 2.0,
    };
    let flags: Vec<f64> = comm.all_gather_f64(&[flag])?.into_iter().flatten().collect();
    match (local, flags.iter().position(|&f| f > 0.0)) {
        (Err(err), _) => Err(err),
        (Ok(value), None) => Ok(value),
        (Ok(_), Some(rank)) if flags[rank] == 1.0 => Err(SystemError::Kernel(eyre!(
            "equation kernel failed on rank {}",
            rank
        ))),
        (Ok(_), Some(rank)) => Err(SystemError::Communication(format!(
            "collective operation failed on rank {}",
            rank
        ))),
    }
}

/// Adapts a communicator to the [`Reduction`] used by the iterative solvers.
///
/// A failed reduction yields NaN, which convergence checks treat as divergence. The first
/// failure is recorded and should be escalated with [`CollectiveReduction::failure`] once the
/// iteration has returned.
#[derive(Debug)]
pub struct CollectiveReduction<'a> {
    comm: &'a dyn Communicator,
    failure: OnceLock<String>,
}

impl<'a> CollectiveReduction<'a> {
    pub fn new(comm: &'a dyn Communicator) -> Self {
        Self {
            comm,
            failure: OnceLock::new(),
        }
    }

    /// The first communication failure of any reduction, if there was one.
    pub fn failure(&self) -> Option<SystemError> {
        self.failure
            .get()
            .map(|message| SystemError::Communication(message.clone()))
    }
}

impl<'a> Reduction<f64> for CollectiveReduction<'a> {
    fn sum(&self, local: f64) -> f64 {
        match self.comm.all_reduce_sum(local) {
            Ok(sum) => sum,
            Err(err) => {
                warn!("Collective reduction failed on rank {}: {}", self.comm.rank(), err);
                let message = match err {
                    SystemError::Communication(message) => message,
                    other => other.to_string(),
                };
                let _ = self.failure.set(message);
                f64::NAN
            }
        }
    }
}
