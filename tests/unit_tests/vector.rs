use super::fixtures::{chain_model, ReactionDiffusion};
use crate::serial_comm;
use fenris_system::comm::{run_ranks, Communicator};
use fenris_system::dof::DofType;
use fenris_system::error::SystemError;
use fenris_system::vector::{DistributedMap, DistributedVector};
use nalgebra::DVector;
use std::sync::Arc;

fn two_rank_model(comm: Arc<dyn Communicator>) -> fenris_system::model::EquationModel {
    chain_model(
        comm,
        7,
        Arc::new(ReactionDiffusion::linear()),
        &[DofType::Temp],
        DVector::from_vec(vec![1.0, 1.0]),
    )
}

#[test]
fn ghosts_match_owner_after_import_and_assembly() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let model = two_rank_model(comm);
        let map = Arc::clone(model.map().unwrap());
        assert_eq!(map.num_owned(), if rank == 0 { 5 } else { 3 });
        assert_eq!(map.num_ghosts(), if rank == 0 { 0 } else { 1 });

        // Owned entries hold their global ID, ghosts are stale
        let mut v = DistributedVector::zeros(Arc::clone(&map));
        for id in map.owned_range() {
            v.set(id, id as f64).unwrap();
        }
        let stale = if rank == 1 { v.get(4).unwrap() } else { 0.0 };
        v.import_ghosts().unwrap();
        let imported = if rank == 1 { v.get(4).unwrap() } else { 4.0 };

        // Every rank adds one to the shared node
        let mut w = DistributedVector::zeros(Arc::clone(&map));
        w.add(4, 1.0).unwrap();
        w.global_assemble().unwrap();
        let shared = w.get(4).unwrap();

        let full = v.gather_full().unwrap();
        let norm = w.norm().unwrap();
        (stale, imported, shared, full, norm)
    })
    .unwrap();

    for (stale, imported, shared, full, norm) in results {
        assert_eq!(stale, 0.0);
        assert_eq!(imported, 4.0);
        assert_eq!(shared, 2.0);
        assert_eq!(full, DVector::from_fn(8, |i, _| i as f64));
        assert_eq!(norm, 2.0);
    }
}

#[test]
fn access_outside_local_layout_is_rejected() {
    let map = Arc::new(DistributedMap::serial(serial_comm(), 3).unwrap());
    let mut v = DistributedVector::zeros(map);
    assert!(matches!(v.get(3), Err(SystemError::Precondition(_))));
    assert!(matches!(v.add(7, 1.0), Err(SystemError::Precondition(_))));
    v.set(2, 1.5).unwrap();
    assert_eq!(v.owned_values().as_slice(), &[0.0, 0.0, 1.5]);
}

#[test]
fn from_full_requires_global_length() {
    let map = Arc::new(DistributedMap::serial(serial_comm(), 3).unwrap());
    let result = DistributedVector::from_full(map, &DVector::zeros(2));
    assert!(matches!(result, Err(SystemError::Precondition(_))));
}

#[test]
fn checkpoint_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("solution.bin");
    let path = &path;
    let results = run_ranks(2, |comm| {
        let model = two_rank_model(comm);
        let map = Arc::clone(model.map().unwrap());
        let full = DVector::from_fn(8, |i, _| (i as f64).sin());
        let v = DistributedVector::from_full(Arc::clone(&map), &full).unwrap();
        v.write_checkpoint(path).unwrap();
        let restored = DistributedVector::read_checkpoint(map, path).unwrap();
        (v.local_values().clone(), restored.local_values().clone())
    })
    .unwrap();

    for (original, restored) in results {
        assert_eq!(original, restored);
    }
}

#[test]
fn failed_checkpoint_write_fails_on_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("solution.bin");
    let path = &path;
    let results = run_ranks(2, |comm| {
        let model = two_rank_model(comm);
        let v = DistributedVector::zeros(Arc::clone(model.map().unwrap()));
        v.write_checkpoint(path)
    })
    .unwrap();

    for result in results {
        assert!(matches!(result, Err(SystemError::Io(_))));
    }
    assert!(!path.exists());
}

#[test]
fn corrupt_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.bin");
    std::fs::write(&path, [1u8, 2, 3]).unwrap();
    let map = Arc::new(DistributedMap::serial(serial_comm(), 3).unwrap());
    assert!(DistributedVector::read_checkpoint(map, &path).is_err());
}
