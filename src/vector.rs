//! Distributed vectors addressed by adof global ID.
use crate::comm::Communicator;
use crate::error::{Result, SystemError};
use crate::mesh::AdofId;
use log::debug;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Layout of a distributed vector on one rank.
///
/// Owned adofs form the contiguous global range `[offset, offset + num_owned)` and occupy the
/// first local slots. Ghosts follow, in the order given at construction.
#[derive(Debug)]
pub struct DistributedMap {
    comm: Arc<dyn Communicator>,
    offset: AdofId,
    num_owned: usize,
    num_global: u64,
    ghosts: Vec<AdofId>,
    ghost_index: FxHashMap<AdofId, usize>,
    neighbors: Vec<usize>,
    /// Per neighbor: ghost slots whose owner is that neighbor.
    imports: Vec<Vec<usize>>,
    /// Per neighbor: owned local indices that the neighbor holds as ghosts.
    exports: Vec<Vec<usize>>,
}

impl DistributedMap {
    /// Builds the map collectively.
    ///
    /// `ghosts` lists `(global id, owner rank)` pairs. Every owner must be among `neighbors`,
    /// and the neighbor relation must be symmetric.
    pub fn new(
        comm: Arc<dyn Communicator>,
        offset: AdofId,
        num_owned: usize,
        ghosts: &[(AdofId, usize)],
        neighbors: &[usize],
    ) -> Result<Self> {
        let num_global = comm.all_reduce_sum_u64(num_owned as u64)?;
        let owned_range = offset..offset + num_owned as u64;

        let mut ghost_index = FxHashMap::default();
        let mut imports = vec![Vec::new(); neighbors.len()];
        for (slot, &(id, owner)) in ghosts.iter().enumerate() {
            if owned_range.contains(&id) || ghost_index.insert(id, slot).is_some() {
                return Err(SystemError::precondition(format!(
                    "ghost adof {} is owned locally or listed twice",
                    id
                )));
            }
            let neighbor = neighbors.iter().position(|&n| n == owner).ok_or_else(|| {
                SystemError::ParallelInconsistency(format!(
                    "owner {} of ghost adof {} is not in the communication table",
                    owner, id
                ))
            })?;
            imports[neighbor].push(slot);
        }

        // Tell each owner which of its adofs we hold as ghosts
        let requests: Vec<_> = neighbors
            .iter()
            .zip(&imports)
            .map(|(&n, slots)| (n, slots.iter().map(|&s| ghosts[s].0).collect()))
            .collect();
        let received = comm.exchange_u64(&requests)?;
        let exports = received
            .into_iter()
            .map(|(neighbor, ids)| {
                ids.into_iter()
                    .map(|id| {
                        if owned_range.contains(&id) {
                            Ok((id - offset) as usize)
                        } else {
                            Err(SystemError::ParallelInconsistency(format!(
                                "rank {} holds adof {} as a ghost of rank {}, which does not own it",
                                neighbor,
                                id,
                                comm.rank()
                            )))
                        }
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            offset,
            num_owned,
            num_global,
            ghosts: ghosts.iter().map(|&(id, _)| id).collect(),
            ghost_index,
            neighbors: neighbors.to_vec(),
            imports,
            exports,
            comm,
        })
    }

    /// A map without ghosts on a single process.
    pub fn serial(comm: Arc<dyn Communicator>, num_owned: usize) -> Result<Self> {
        Self::new(comm, 0, num_owned, &[], &[])
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn num_owned(&self) -> usize {
        self.num_owned
    }

    pub fn num_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    pub fn num_local(&self) -> usize {
        self.num_owned + self.ghosts.len()
    }

    pub fn num_global(&self) -> u64 {
        self.num_global
    }

    pub fn owned_range(&self) -> Range<AdofId> {
        self.offset..self.offset + self.num_owned as u64
    }

    pub fn ghosts(&self) -> &[AdofId] {
        &self.ghosts
    }

    pub fn is_owned(&self, id: AdofId) -> bool {
        self.owned_range().contains(&id)
    }

    pub fn local_index(&self, id: AdofId) -> Option<usize> {
        if self.is_owned(id) {
            Some((id - self.offset) as usize)
        } else {
            self.ghost_index.get(&id).map(|slot| self.num_owned + slot)
        }
    }

    pub fn global_id(&self, local_index: usize) -> Option<AdofId> {
        if local_index < self.num_owned {
            Some(self.offset + local_index as u64)
        } else {
            self.ghosts.get(local_index - self.num_owned).copied()
        }
    }
}

/// Owned and ghost values of a distributed vector.
#[derive(Debug, Clone)]
pub struct DistributedVector {
    map: Arc<DistributedMap>,
    values: DVector<f64>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    num_global: u64,
    values: Vec<f64>,
}

impl DistributedVector {
    pub fn zeros(map: Arc<DistributedMap>) -> Self {
        let values = DVector::zeros(map.num_local());
        Self { map, values }
    }

    /// Takes the owned entries from a full vector of length `num_global`, ghosts included.
    pub fn from_full(map: Arc<DistributedMap>, full: &DVector<f64>) -> Result<Self> {
        if full.len() as u64 != map.num_global() {
            return Err(SystemError::precondition(format!(
                "full vector has length {}, the map has {} global entries",
                full.len(),
                map.num_global()
            )));
        }
        let values = DVector::from_iterator(
            map.num_local(),
            (0..map.num_local()).map(|i| {
                let id = map.global_id(i).unwrap_or_default();
                full[id as usize]
            }),
        );
        Ok(Self { map, values })
    }

    pub fn map(&self) -> &Arc<DistributedMap> {
        &self.map
    }

    fn index(&self, id: AdofId) -> Result<usize> {
        self.map.local_index(id).ok_or_else(|| {
            SystemError::precondition(format!(
                "adof {} is neither owned nor a ghost on rank {}",
                id,
                self.map.comm().rank()
            ))
        })
    }

    pub fn get(&self, id: AdofId) -> Result<f64> {
        Ok(self.values[self.index(id)?])
    }

    pub fn set(&mut self, id: AdofId, value: f64) -> Result<()> {
        let i = self.index(id)?;
        self.values[i] = value;
        Ok(())
    }

    /// Adds a local contribution. Contributions to ghosts reach the owner in [`Self::global_assemble`].
    pub fn add(&mut self, id: AdofId, value: f64) -> Result<()> {
        let i = self.index(id)?;
        self.values[i] += value;
        Ok(())
    }

    pub fn fill(&mut self, value: f64) {
        self.values.fill(value);
    }

    pub fn owned_values(&self) -> DVectorView<f64> {
        self.values.rows(0, self.map.num_owned())
    }

    pub fn owned_values_mut(&mut self) -> DVectorViewMut<f64> {
        let n = self.map.num_owned();
        self.values.rows_mut(0, n)
    }

    /// Owned values followed by ghost values.
    pub fn local_values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Refreshes ghost values from their owners.
    pub fn import_ghosts(&mut self) -> Result<()> {
        let map = Arc::clone(&self.map);
        let outgoing: Vec<_> = map
            .neighbors
            .iter()
            .zip(&map.exports)
            .map(|(&n, owned)| (n, owned.iter().map(|&i| self.values[i]).collect()))
            .collect();
        let received = map.comm.exchange_f64(&outgoing)?;
        for ((neighbor, values), slots) in received.into_iter().zip(&map.imports) {
            if values.len() != slots.len() {
                return Err(SystemError::Communication(format!(
                    "expected {} ghost values from rank {}, received {}",
                    slots.len(),
                    neighbor,
                    values.len()
                )));
            }
            for (&slot, value) in slots.iter().zip(values) {
                self.values[map.num_owned + slot] = value;
            }
        }
        Ok(())
    }

    /// Sends ghost contributions to their owners, adds them to the owned entries and refreshes
    /// the ghosts, so that every ghost matches its owner afterwards.
    pub fn global_assemble(&mut self) -> Result<()> {
        let map = Arc::clone(&self.map);
        let outgoing: Vec<_> = map
            .neighbors
            .iter()
            .zip(&map.imports)
            .map(|(&n, slots)| (n, slots.iter().map(|&s| self.values[map.num_owned + s]).collect()))
            .collect();
        let received = map.comm.exchange_f64(&outgoing)?;
        for ((neighbor, values), owned) in received.into_iter().zip(&map.exports) {
            if values.len() != owned.len() {
                return Err(SystemError::Communication(format!(
                    "expected {} ghost contributions from rank {}, received {}",
                    owned.len(),
                    neighbor,
                    values.len()
                )));
            }
            for (&i, value) in owned.iter().zip(values) {
                self.values[i] += value;
            }
        }
        self.import_ghosts()
    }

    pub fn dot(&self, other: &DistributedVector) -> Result<f64> {
        self.map.comm().all_reduce_sum(self.owned_values().dot(&other.owned_values()))
    }

    /// Collective Euclidean norm over the owned entries of all ranks.
    pub fn norm(&self) -> Result<f64> {
        Ok(self
            .map
            .comm()
            .all_reduce_sum(self.owned_values().norm_squared())?
            .sqrt())
    }

    /// Gathers the complete vector on every rank, indexed by global ID.
    pub fn gather_full(&self) -> Result<DVector<f64>> {
        let owned: Vec<f64> = self.owned_values().iter().copied().collect();
        let gathered = self.map.comm().all_gather_f64(&owned)?;
        let full: Vec<f64> = gathered.into_iter().flatten().collect();
        if full.len() as u64 != self.map.num_global() {
            return Err(SystemError::ParallelInconsistency(format!(
                "gathered {} entries, expected {}",
                full.len(),
                self.map.num_global()
            )));
        }
        Ok(DVector::from_vec(full))
    }

    /// Collectively writes the full vector to `path`.
    ///
    /// Rank 0 writes to a temporary file in the target directory and persists it over `path`,
    /// so readers never observe a partially written checkpoint.
    pub fn write_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let full = self.gather_full()?;
        let comm = self.map.comm();
        let mut result = Ok(());
        if comm.rank() == 0 {
            result = write_atomically(path, &Checkpoint {
                num_global: self.map.num_global(),
                values: full.as_slice().to_vec(),
            });
            if result.is_ok() {
                debug!("Wrote checkpoint with {} entries to {}", full.len(), path.display());
            }
        }
        // Every rank learns whether the file exists, and may read it afterwards
        let failed = comm.all_reduce_max(if result.is_err() { 1.0 } else { 0.0 })?;
        match result {
            Ok(()) if failed > 0.0 => Err(SystemError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("rank 0 failed to write checkpoint {}", path.display()),
            ))),
            result => result,
        }
    }

    /// Reads a checkpoint written by [`Self::write_checkpoint`] on every rank.
    pub fn read_checkpoint(map: Arc<DistributedMap>, path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let checkpoint: Checkpoint = bincode::deserialize_from(reader)?;
        if checkpoint.num_global != checkpoint.values.len() as u64 {
            return Err(SystemError::precondition("corrupt checkpoint: length mismatch"));
        }
        Self::from_full(map, &DVector::from_vec(checkpoint.values))
    }
}

fn write_atomically(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file = NamedTempFile::new_in(directory)?;
    {
        let mut writer = BufWriter::new(file.as_file());
        bincode::serialize_into(&mut writer, checkpoint)?;
        std::io::Write::flush(&mut writer)?;
    }
    file.persist(path).map_err(|err| SystemError::Io(err.error))?;
    Ok(())
}
