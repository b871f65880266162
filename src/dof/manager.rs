use crate::comm::Communicator;
use crate::dof::{Adof, AdofKey, DofTypeMap, PdofHost};
use crate::equation::{EquationObject, LocalLayout, LocalRow, Side};
use crate::error::{Result, SystemError};
use crate::mesh::{AdofId, BasisHierarchy, EntityId, EntityMesh};
use crate::multigrid::{LevelDof, LevelMap};
use crate::settings::{AdofStrategy, DofSettings};
use crate::vector::DistributedMap;
use itertools::Itertools;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Build stages of the [`DofManager`]. Each build step requires the previous stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DofManagerState {
    Created,
    TypesInitialized,
    HostsInitialized,
    AdofsCreated,
    TMatrixSet,
}

/// Marker for adof IDs not yet resolved, and for keys an owner does not know.
const UNRESOLVED: u64 = u64::MAX;

/// Builds pdof hosts for all equation objects and the globally consistent adof numbering.
#[derive(Debug)]
pub struct DofManager {
    mesh: Arc<EntityMesh>,
    comm: Arc<dyn Communicator>,
    settings: DofSettings,
    state: DofManagerState,
    dof_types: DofTypeMap,
    hosts: Vec<PdofHost>,
    host_registry: FxHashMap<EntityId, usize>,
    /// Owned adofs in discovery order, followed by ghosts in discovery order.
    adofs: Vec<Adof>,
    num_owned: usize,
    offset: AdofId,
    num_global: u64,
    by_global_id: FxHashMap<AdofId, usize>,
    by_key: FxHashMap<AdofKey, usize>,
}

/// One basis function a pdof depends on.
struct Dependency {
    basis_id: u64,
    owner: usize,
    weight: f64,
}

impl DofManager {
    pub fn new(mesh: Arc<EntityMesh>, comm: Arc<dyn Communicator>, settings: DofSettings) -> Self {
        Self {
            mesh,
            comm,
            settings,
            state: DofManagerState::Created,
            dof_types: DofTypeMap::default(),
            hosts: Vec::new(),
            host_registry: FxHashMap::default(),
            adofs: Vec::new(),
            num_owned: 0,
            offset: 0,
            num_global: 0,
            by_global_id: FxHashMap::default(),
            by_key: FxHashMap::default(),
        }
    }

    pub fn state(&self) -> DofManagerState {
        self.state
    }

    pub fn mesh(&self) -> &EntityMesh {
        &self.mesh
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn settings(&self) -> &DofSettings {
        &self.settings
    }

    pub fn dof_types(&self) -> &DofTypeMap {
        &self.dof_types
    }

    fn require(&self, state: DofManagerState, step: &str) -> Result<()> {
        if self.state != state {
            Err(SystemError::precondition(format!(
                "{} called in dof manager state {:?}, requires {:?}",
                step, self.state, state
            )))
        } else {
            Ok(())
        }
    }

    /// Builds the ordered union of the dof types declared by all objects.
    ///
    /// The order must agree on every rank. This is the caller's responsibility; with
    /// `check_dof_type_consistency` enabled, disagreement is reported as an error.
    pub fn initialize_pdof_type_list<'a>(
        &mut self,
        objects: impl IntoIterator<Item = &'a EquationObject>,
    ) -> Result<()> {
        self.require(DofManagerState::Created, "initialize_pdof_type_list")?;
        let dof_types = DofTypeMap::from_declarations(objects.into_iter().map(EquationObject::dof_types));
        if self.settings.check_dof_type_consistency {
            dof_types.check_consistency(self.comm.as_ref())?;
        }
        debug!("Dof types: {:?}", dof_types.types());
        self.dof_types = dof_types;
        self.state = DofManagerState::TypesInitialized;
        Ok(())
    }

    fn get_or_create_host(&mut self, entity: EntityId) -> Result<usize> {
        if let Some(&index) = self.host_registry.get(&entity) {
            return Ok(index);
        }
        if self.mesh.entity(entity).is_none() {
            return Err(SystemError::precondition(format!(
                "equation object references entity {}, which is not in the local mesh",
                entity
            )));
        }
        let index = self.hosts.len();
        self.hosts.push(PdofHost::new(entity, self.dof_types.len()));
        self.host_registry.insert(entity, index);
        Ok(index)
    }

    /// Creates one pdof host per referenced entity and the pdofs each object requests.
    ///
    /// Each object receives its host indices and local row layout.
    pub fn initialize_pdof_host_list<'a>(
        &mut self,
        objects: impl IntoIterator<Item = &'a mut EquationObject>,
    ) -> Result<()> {
        self.require(DofManagerState::TypesInitialized, "initialize_pdof_host_list")?;
        for object in objects {
            let sides: Vec<(Side, usize, usize)> = {
                let mut sides = Vec::new();
                for (side, entities) in [(Side::Master, object.master()), (Side::Slave, object.slave())] {
                    for (position, &entity) in entities.iter().enumerate() {
                        sides.push((side, position, self.get_or_create_host(entity)?));
                    }
                }
                sides
            };

            let mut requested = object
                .dof_types()
                .iter()
                .map(|&t| {
                    self.dof_types
                        .index_of(t)
                        .map(|index| (index, t))
                        .ok_or_else(|| SystemError::precondition(format!("dof type {} was not declared", t)))
                })
                .collect::<Result<Vec<_>>>()?;
            requested.sort_unstable_by_key(|&(index, _)| index);
            requested.dedup();

            let mut rows = Vec::new();
            for &(dof_type_index, dof_type) in &requested {
                let time_levels = self.settings.time_levels_for(dof_type);
                for &(_, _, host) in &sides {
                    self.hosts[host].get_or_create_pdofs(dof_type_index, time_levels)?;
                }
                for time_level in 0..time_levels {
                    rows.extend(sides.iter().map(|&(side, position, host)| LocalRow {
                        dof_type,
                        dof_type_index,
                        time_level,
                        side,
                        position,
                        host,
                    }));
                }
            }
            object.set_pdof_layout(LocalLayout::new(rows));
        }
        debug!("Created {} pdof hosts", self.hosts.len());
        self.state = DofManagerState::HostsInitialized;
        Ok(())
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn host(&self, index: usize) -> Result<&PdofHost> {
        self.hosts
            .get(index)
            .ok_or_else(|| SystemError::precondition(format!("no pdof host with index {}", index)))
    }

    pub fn hosts(&self) -> &[PdofHost] {
        &self.hosts
    }

    pub fn host_of_entity(&self, entity: EntityId) -> Option<&PdofHost> {
        self.host_registry.get(&entity).map(|&i| &self.hosts[i])
    }

    /// The basis functions the pdofs of an entity depend on, according to the adof strategy.
    fn dependencies(&self, entity: EntityId) -> Result<Vec<Dependency>> {
        let entity = self
            .mesh
            .entity(entity)
            .ok_or_else(|| SystemError::precondition(format!("entity {} is not in the mesh", entity)))?;
        match self.settings.strategy {
            AdofStrategy::Nodal => Ok(vec![Dependency {
                basis_id: entity.id,
                owner: entity.owner,
                weight: 1.0,
            }]),
            AdofStrategy::ExistingBasis if entity.basis.is_empty() => Err(SystemError::precondition(format!(
                "entity {} has no basis coefficients",
                entity.id
            ))),
            AdofStrategy::ExistingBasis => Ok(entity
                .basis
                .iter()
                .map(|c| Dependency {
                    basis_id: c.basis_id,
                    owner: c.owner,
                    weight: c.weight,
                })
                .collect()),
        }
    }

    /// Discovers the adofs, numbers the owned ones and resolves ghost IDs from their owners.
    ///
    /// Collective. Owned adofs are numbered contiguously in discovery order, offset by the
    /// number of adofs owned by lower ranks. Ghost resolution does not change owned numbers.
    pub fn create_adofs(&mut self) -> Result<()> {
        self.require(DofManagerState::HostsInitialized, "create_adofs")?;
        let rank = self.comm.rank();

        // Discovery: hosts in creation order, pdofs in [type][time level] order
        let mut owned: Vec<(AdofKey, usize)> = Vec::new();
        let mut ghosts: Vec<(AdofKey, usize)> = Vec::new();
        let mut seen = FxHashMap::default();
        let mut pdof_keys: Vec<Vec<Vec<AdofKey>>> = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let dependencies = self.dependencies(host.entity())?;
            let mut host_keys = Vec::new();
            for pdof in host.pdofs() {
                let keys: Vec<AdofKey> = dependencies
                    .iter()
                    .map(|d| AdofKey {
                        basis_id: d.basis_id,
                        dof_type: pdof.dof_type,
                        time_level: pdof.time_level,
                    })
                    .collect();
                for (key, dependency) in keys.iter().zip(&dependencies) {
                    if seen.insert(*key, dependency.owner).is_none() {
                        if dependency.owner == rank {
                            owned.push((*key, dependency.owner));
                        } else {
                            ghosts.push((*key, dependency.owner));
                        }
                    }
                }
                host_keys.push(keys);
            }
            pdof_keys.push(host_keys);
        }

        let num_owned = owned.len();
        let offset = self.comm.exclusive_scan_u64(num_owned as u64)?;
        let num_global = self.comm.all_reduce_sum_u64(num_owned as u64)?;

        let mut adofs: Vec<Adof> = owned
            .iter()
            .enumerate()
            .map(|(i, &(key, owner))| Adof {
                global_id: offset + i as u64,
                owner,
                key,
            })
            .collect();
        let by_key_owned: FxHashMap<AdofKey, AdofId> = adofs.iter().map(|a| (a.key, a.global_id)).collect();

        let ghost_ids = self.resolve_ghosts(&ghosts, &by_key_owned)?;
        adofs.extend(ghosts.iter().zip(ghost_ids).map(|(&(key, owner), global_id)| Adof {
            global_id,
            owner,
            key,
        }));

        self.by_key = adofs.iter().enumerate().map(|(i, a)| (a.key, i)).collect();
        self.by_global_id = adofs.iter().enumerate().map(|(i, a)| (a.global_id, i)).collect();

        for (host, keys) in self.hosts.iter_mut().zip(pdof_keys) {
            for (pdof, keys) in host.pdofs_mut().zip(keys) {
                pdof.adof_ids = keys
                    .iter()
                    .map(|key| adofs[self.by_key[key]].global_id)
                    .collect();
            }
        }

        info!(
            "Rank {}: {} owned and {} ghost adofs, {} global, offset {}",
            rank,
            num_owned,
            adofs.len() - num_owned,
            num_global,
            offset
        );
        self.adofs = adofs;
        self.num_owned = num_owned;
        self.offset = offset;
        self.num_global = num_global;
        self.state = DofManagerState::AdofsCreated;
        Ok(())
    }

    /// One request/response round with each neighbor resolving ghost keys to global IDs.
    fn resolve_ghosts(
        &self,
        ghosts: &[(AdofKey, usize)],
        owned: &FxHashMap<AdofKey, AdofId>,
    ) -> Result<Vec<AdofId>> {
        let neighbors = self.mesh.neighbors();
        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); neighbors.len()];
        for (i, (key, owner)) in ghosts.iter().enumerate() {
            let neighbor = neighbors.binary_search(owner).map_err(|_| {
                SystemError::ParallelInconsistency(format!(
                    "adof {:?} is owned by rank {}, which is not in the communication table of rank {}",
                    key,
                    owner,
                    self.comm.rank()
                ))
            })?;
            requests[neighbor].push(i);
        }

        let encode = |key: &AdofKey| [key.basis_id, key.dof_type as u64, key.time_level as u64];
        let outgoing: Vec<_> = neighbors
            .iter()
            .zip(&requests)
            .map(|(&n, indices)| (n, indices.iter().flat_map(|&i| encode(&ghosts[i].0)).collect()))
            .collect();
        let incoming = self.comm.exchange_u64(&outgoing)?;

        let responses: Vec<_> = incoming
            .into_iter()
            .map(|(n, keys)| {
                let ids = keys
                    .chunks_exact(3)
                    .map(|chunk| {
                        let key = AdofKey {
                            basis_id: chunk[0],
                            dof_type: chunk[1] as usize,
                            time_level: chunk[2] as usize,
                        };
                        owned.get(&key).copied().unwrap_or(UNRESOLVED)
                    })
                    .collect();
                (n, ids)
            })
            .collect();
        let answers = self.comm.exchange_u64(&responses)?;

        let mut ids = vec![UNRESOLVED; ghosts.len()];
        for ((owner, answer), indices) in answers.into_iter().zip(&requests) {
            if answer.len() != indices.len() {
                return Err(SystemError::Communication(format!(
                    "rank {} answered {} of {} adof requests",
                    owner,
                    answer.len(),
                    indices.len()
                )));
            }
            for (&i, id) in indices.iter().zip(answer) {
                if id == UNRESOLVED {
                    return Err(SystemError::ParallelInconsistency(format!(
                        "rank {} does not know adof {:?} that rank {} refers to",
                        owner,
                        ghosts[i].0,
                        self.comm.rank()
                    )));
                }
                ids[i] = id;
            }
        }
        Ok(ids)
    }

    /// Propagates T-matrix coefficients from each basis-providing entity to its pdofs.
    pub fn set_pdof_t_matrix(&mut self) -> Result<()> {
        self.require(DofManagerState::AdofsCreated, "set_pdof_t_matrix")?;
        for i in 0..self.hosts.len() {
            let dependencies = self.dependencies(self.hosts[i].entity())?;
            let host = &mut self.hosts[i];
            for pdof in host.pdofs_mut() {
                pdof.t_matrix = dependencies.iter().map(|d| d.weight).collect();
            }
            host.mark_t_matrix_built();
        }
        self.state = DofManagerState::TMatrixSet;
        Ok(())
    }

    fn require_adofs(&self) -> Result<()> {
        if self.state < DofManagerState::AdofsCreated {
            Err(SystemError::precondition("adofs have not been created"))
        } else {
            Ok(())
        }
    }

    pub fn num_owned_adofs(&self) -> usize {
        self.num_owned
    }

    pub fn num_local_adofs(&self) -> usize {
        self.adofs.len()
    }

    pub fn num_global_adofs(&self) -> u64 {
        self.num_global
    }

    /// Global ID of the first owned adof.
    pub fn owned_offset(&self) -> AdofId {
        self.offset
    }

    pub fn owned_adofs(&self) -> &[Adof] {
        &self.adofs[..self.num_owned]
    }

    pub fn ghost_adofs(&self) -> &[Adof] {
        &self.adofs[self.num_owned..]
    }

    pub fn adof(&self, global_id: AdofId) -> Option<&Adof> {
        self.by_global_id.get(&global_id).map(|&i| &self.adofs[i])
    }

    pub fn adof_by_key(&self, key: &AdofKey) -> Option<&Adof> {
        self.by_key.get(key).map(|&i| &self.adofs[i])
    }

    /// Collectively builds the owned/ghost layout of distributed vectors over the adofs.
    pub fn distributed_map(&self) -> Result<DistributedMap> {
        self.require_adofs()?;
        let ghosts: Vec<_> = self
            .ghost_adofs()
            .iter()
            .map(|a| (a.global_id, a.owner))
            .collect();
        DistributedMap::new(
            Arc::clone(&self.comm),
            self.offset,
            self.num_owned,
            &ghosts,
            self.mesh.neighbors(),
        )
    }

    /// Collectively derives the per-level dof maps of a basis hierarchy.
    ///
    /// Level 0 enumerates all adofs by global ID. On coarser levels, a dof exists for each coarse
    /// basis function and each (dof type, time level) pair present among its children.
    pub fn multigrid_levels(&self, hierarchy: &BasisHierarchy) -> Result<Vec<LevelMap>> {
        self.require_adofs()?;
        let local: Vec<u64> = self
            .owned_adofs()
            .iter()
            .flat_map(|a| [a.key.basis_id, a.key.dof_type as u64, a.key.time_level as u64])
            .collect();
        let gathered = self.comm.all_gather_u64(&local)?;
        // Ranks own contiguous, increasing ID ranges, so concatenation is in global ID order
        let finest: Vec<LevelDof> = gathered
            .iter()
            .flat_map(|chunk| chunk.chunks_exact(3))
            .map(|c| LevelDof {
                basis_id: c[0],
                dof_type: c[1] as usize,
                time_level: c[2] as usize,
            })
            .collect();
        if finest.len() as u64 != self.num_global {
            return Err(SystemError::ParallelInconsistency(format!(
                "gathered {} adofs for the finest multigrid level, expected {}",
                finest.len(),
                self.num_global
            )));
        }

        let mut levels = vec![LevelMap::new(finest)];
        for l in 0..hierarchy.num_levels() - 1 {
            let fine = &levels[l];
            let coarse: Vec<LevelDof> = hierarchy
                .coarse_basis(l)
                .iter()
                .flat_map(|basis| {
                    basis
                        .children
                        .iter()
                        .flat_map(|&(child, _)| fine.type_time_pairs(child))
                        .sorted()
                        .dedup()
                        .map(move |(dof_type, time_level)| LevelDof {
                            basis_id: basis.id,
                            dof_type,
                            time_level,
                        })
                })
                .collect();
            levels.push(LevelMap::new(coarse));
        }
        Ok(levels)
    }
}
