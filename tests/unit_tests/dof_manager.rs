use super::fixtures::chain_partition;
use crate::serial_comm;
use fenris_system::comm::run_ranks;
use fenris_system::dof::manager::DofManagerState;
use fenris_system::dof::{DofManager, DofType};
use fenris_system::equation::EquationObject;
use fenris_system::error::SystemError;
use fenris_system::mesh::{BasisCoefficient, Entity, EntityMesh};
use fenris_system::proptest::{chain_basis_problem, chain_problem};
use fenris_system::settings::{AdofStrategy, DofSettings};
use fenris_system::vector::DistributedVector;
use itertools::Itertools;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;
use std::sync::Arc;

fn build(dofs: &mut DofManager, objects: &mut [EquationObject]) -> Result<(), SystemError> {
    dofs.initialize_pdof_type_list(objects.iter())?;
    dofs.initialize_pdof_host_list(objects.iter_mut())?;
    dofs.create_adofs()?;
    dofs.set_pdof_t_matrix()?;
    for object in objects.iter_mut() {
        object.build_adof_list(dofs)?;
        object.build_local_to_global_map(dofs)?;
    }
    Ok(())
}

fn existing_basis_settings() -> DofSettings {
    DofSettings {
        strategy: AdofStrategy::ExistingBasis,
        ..DofSettings::default()
    }
}

/// Two entities whose values are expanded in the same two basis functions.
fn two_entity_basis_mesh() -> EntityMesh {
    let a = Entity::new(0, 0).with_basis(vec![BasisCoefficient::new(0, 0, 1.0), BasisCoefficient::new(1, 0, 1.0)]);
    let b = Entity::new(1, 0).with_basis(vec![BasisCoefficient::new(0, 0, 1.0), BasisCoefficient::new(1, 0, -2.0)]);
    EntityMesh::new(vec![a, b], vec![]).unwrap()
}

#[test]
fn existing_basis_two_entities_share_two_adofs() {
    let mut dofs = DofManager::new(Arc::new(two_entity_basis_mesh()), serial_comm(), existing_basis_settings());
    let mut objects = vec![EquationObject::element(vec![0, 1], vec![DofType::Temp])];
    build(&mut dofs, &mut objects).unwrap();

    assert_eq!(dofs.state(), DofManagerState::TMatrixSet);
    assert_eq!(dofs.num_owned_adofs(), 2);
    assert_eq!(dofs.num_global_adofs(), 2);
    assert_eq!(objects[0].unique_adofs(), &[0, 1]);

    let a = dofs.host_of_entity(0).unwrap();
    let b = dofs.host_of_entity(1).unwrap();
    assert_eq!(a.t_matrix(0, 0).unwrap(), (&[0u64, 1][..], &[1.0, 1.0][..]));
    assert_eq!(b.t_matrix(0, 0).unwrap(), (&[0u64, 1][..], &[1.0, -2.0][..]));

    let expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, -2.0]);
    assert_matrix_eq!(objects[0].local_to_global_map().unwrap().clone(), expected);
}

#[test]
fn existing_basis_residual_round_trip() {
    let mut dofs = DofManager::new(Arc::new(two_entity_basis_mesh()), serial_comm(), existing_basis_settings());
    let mut objects = vec![EquationObject::element(vec![0, 1], vec![DofType::Temp])];
    build(&mut dofs, &mut objects).unwrap();

    let t = objects[0].local_to_global_map().unwrap();
    let residual = DVector::from_vec(vec![0.3, -0.7]);
    let pushed = t.tr_mul(&residual);
    let pulled = t.transpose().lu().solve(&pushed).unwrap();
    assert_matrix_eq!(pulled, residual, comp = abs, tol = 1e-12);
}

#[test]
fn nodal_adofs_follow_discovery_order() {
    let (mesh, mut objects) = chain_partition(0, 1, 3, &[DofType::Temp, DofType::P]);
    let mut dofs = DofManager::new(Arc::new(mesh), serial_comm(), DofSettings::default());
    build(&mut dofs, &mut objects).unwrap();

    // Hosts are discovered along the chain, pdofs per host in type order
    let keys: Vec<_> = dofs
        .owned_adofs()
        .iter()
        .map(|a| (a.key.basis_id, a.dof_type()))
        .collect();
    let expected: Vec<_> = (0..4).flat_map(|e| [(e, 0), (e, 1)]).collect();
    assert_eq!(keys, expected);
    assert!(dofs
        .owned_adofs()
        .iter()
        .tuple_windows()
        .all(|(a, b)| a.global_id < b.global_id));

    let adof = dofs.adof(5).unwrap();
    assert_eq!(adof.owner, 0);
    assert_eq!(adof.key.basis_id, 2);
    assert_eq!(dofs.dof_types().dof_type(adof.dof_type()), Some(DofType::P));
}

#[test]
fn two_ranks_agree_on_shared_adof() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let (mesh, mut objects) = chain_partition(rank, 2, 7, &[DofType::Temp]);
        let mut dofs = DofManager::new(Arc::new(mesh), comm, DofSettings::default());
        build(&mut dofs, &mut objects).unwrap();
        let shared = dofs.host_of_entity(4).unwrap().pdof(0, 0).unwrap().adof_ids.clone();
        let owned: Vec<u64> = dofs.owned_adofs().iter().map(|a| a.global_id).collect();
        let ghosts: Vec<(u64, usize)> = dofs.ghost_adofs().iter().map(|a| (a.global_id, a.owner)).collect();
        (dofs.num_local_adofs(), shared, owned, ghosts)
    })
    .unwrap();

    let (local_0, shared_0, owned_0, ghosts_0) = &results[0];
    let (local_1, shared_1, owned_1, ghosts_1) = &results[1];
    assert_eq!(*local_0, 5);
    assert_eq!(*local_1, 4);
    assert_eq!(shared_0, shared_1);
    assert_eq!(shared_0, &vec![4]);
    assert_eq!(owned_0, &vec![0, 1, 2, 3, 4]);
    assert_eq!(owned_1, &vec![5, 6, 7]);
    assert!(ghosts_0.is_empty());
    assert_eq!(ghosts_1, &vec![(4, 0)]);
}

#[test]
fn ghost_owner_outside_communication_table_is_inconsistent() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let (mesh, mut objects) = chain_partition(rank, 2, 4, &[DofType::Temp]);
        let mesh = EntityMesh::new(mesh.entities().to_vec(), vec![]).unwrap();
        let mut dofs = DofManager::new(Arc::new(mesh), comm, DofSettings::default());
        build(&mut dofs, &mut objects)
    })
    .unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(SystemError::ParallelInconsistency(_))));
}

#[test]
fn dof_type_consistency_check_is_opt_in() {
    for check in [false, true] {
        let results = run_ranks(2, |comm| {
            let dof_type = if comm.rank() == 0 { DofType::Temp } else { DofType::P };
            let mesh = EntityMesh::new(vec![Entity::new(comm.rank() as u64, comm.rank())], vec![]).unwrap();
            let objects = [EquationObject::element(vec![comm.rank() as u64], vec![dof_type])];
            let settings = DofSettings {
                check_dof_type_consistency: check,
                ..DofSettings::default()
            };
            let mut dofs = DofManager::new(Arc::new(mesh), comm, settings);
            dofs.initialize_pdof_type_list(objects.iter())
        })
        .unwrap();
        for result in results {
            if check {
                assert!(matches!(result, Err(SystemError::ParallelInconsistency(_))));
            } else {
                assert!(result.is_ok());
            }
        }
    }
}

#[test]
fn build_steps_out_of_order_are_rejected() {
    let (mesh, mut objects) = chain_partition(0, 1, 2, &[DofType::Temp]);
    let mut dofs = DofManager::new(Arc::new(mesh), serial_comm(), DofSettings::default());
    assert!(matches!(dofs.create_adofs(), Err(SystemError::Precondition(_))));
    assert!(matches!(
        dofs.initialize_pdof_host_list(objects.iter_mut()),
        Err(SystemError::Precondition(_))
    ));
    assert!(matches!(dofs.distributed_map(), Err(SystemError::Precondition(_))));

    dofs.initialize_pdof_type_list(objects.iter()).unwrap();
    dofs.initialize_pdof_host_list(objects.iter_mut()).unwrap();
    assert!(matches!(objects[0].build_adof_list(&dofs), Err(SystemError::Precondition(_))));
    dofs.create_adofs().unwrap();

    // T-matrix requested before it is set
    let host = dofs.host(0).unwrap();
    assert!(!host.is_t_matrix_built());
    assert!(matches!(host.t_matrix(0, 0), Err(SystemError::Precondition(_))));
    assert!(matches!(objects[0].local_to_global_map(), Err(SystemError::Precondition(_))));
}

#[test]
fn zero_time_levels_are_rejected() {
    let (mesh, mut objects) = chain_partition(0, 1, 2, &[DofType::Temp]);
    let settings = DofSettings {
        time_levels: vec![(DofType::Temp, 0)],
        ..DofSettings::default()
    };
    let mut dofs = DofManager::new(Arc::new(mesh), serial_comm(), settings);
    dofs.initialize_pdof_type_list(objects.iter()).unwrap();
    assert!(matches!(
        dofs.initialize_pdof_host_list(objects.iter_mut()),
        Err(SystemError::Precondition(_))
    ));
}

#[test]
fn unknown_entities_are_rejected() {
    let (mesh, _) = chain_partition(0, 1, 2, &[DofType::Temp]);
    let mut objects = vec![EquationObject::element(vec![1, 17], vec![DofType::Temp])];
    let mut dofs = DofManager::new(Arc::new(mesh), serial_comm(), DofSettings::default());
    dofs.initialize_pdof_type_list(objects.iter()).unwrap();
    assert!(matches!(
        dofs.initialize_pdof_host_list(objects.iter_mut()),
        Err(SystemError::Precondition(_))
    ));
}

#[test]
fn multiple_time_levels_create_separate_adofs() {
    let (mesh, mut objects) = chain_partition(0, 1, 1, &[DofType::Temp]);
    let settings = DofSettings {
        time_levels: vec![(DofType::Temp, 2)],
        ..DofSettings::default()
    };
    let mut dofs = DofManager::new(Arc::new(mesh), serial_comm(), settings);
    build(&mut dofs, &mut objects).unwrap();
    assert_eq!(dofs.num_owned_adofs(), 4);

    let layout = objects[0].layout();
    assert_eq!(layout.len(), 4);
    let levels: Vec<_> = layout.rows().iter().map(|row| (row.time_level, row.position)).collect();
    assert_eq!(levels, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    assert_eq!(dofs.host(0).unwrap().num_time_levels(0), 2);
}

proptest! {
    #[test]
    fn nodal_numbering_is_unique_and_monotonic(problem in chain_problem(8)) {
        let mut objects = problem.objects.clone();
        let mut dofs = DofManager::new(Arc::new(problem.mesh.clone()), serial_comm(), DofSettings::default());
        build(&mut dofs, &mut objects).unwrap();

        let ids: Vec<u64> = dofs.owned_adofs().iter().map(|a| a.global_id).collect();
        prop_assert_eq!(ids.clone(), (0..ids.len() as u64).collect::<Vec<_>>());

        // One adof per (entity, dof type) referenced by some element
        let expected = objects
            .iter()
            .flat_map(|o| o.master().iter().flat_map(move |&e| o.dof_types().iter().map(move |&t| (e, t))))
            .unique()
            .count();
        prop_assert_eq!(dofs.num_owned_adofs(), expected);

        for adof in dofs.owned_adofs() {
            prop_assert_eq!(dofs.adof_by_key(&adof.key).map(|a| a.global_id), Some(adof.global_id));
        }
    }

    #[test]
    fn pulled_pdof_values_follow_basis_expansion(problem in chain_basis_problem(6)) {
        let mut objects = problem.objects.clone();
        let mesh = Arc::new(problem.mesh.clone());
        let mut dofs = DofManager::new(Arc::clone(&mesh), serial_comm(), existing_basis_settings());
        build(&mut dofs, &mut objects).unwrap();
        let map = Arc::new(dofs.distributed_map().unwrap());

        let full = DVector::from_fn(dofs.num_global_adofs() as usize, |i, _| 1.0 + 0.5 * i as f64);
        let v = DistributedVector::from_full(Arc::clone(&map), &full).unwrap();
        for object in &objects {
            let pulled = object.get_local_values(&v).unwrap();
            for (row, &entity) in object.master().iter().enumerate() {
                let expected: f64 = mesh
                    .entity(entity)
                    .unwrap()
                    .basis
                    .iter()
                    .map(|c| {
                        let key = fenris_system::dof::AdofKey { basis_id: c.basis_id, dof_type: 0, time_level: 0 };
                        c.weight * full[dofs.adof_by_key(&key).unwrap().global_id as usize]
                    })
                    .sum();
                prop_assert!((pulled[row] - expected).abs() <= 1e-12 * expected.abs().max(1.0));
            }
        }
    }
}
