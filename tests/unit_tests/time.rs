use super::fixtures::{chain_model, CoupledFields, LocalFailure, ReactionDiffusion, RecordingKernel};
use crate::serial_comm;
use fenris_system::comm::{run_ranks, run_ranks_with, Communicator, ThreadComm};
use fenris_system::dof::{DofManager, DofType};
use fenris_system::error::SystemError;
use fenris_system::model::{EquationModel, EquationSet};
use fenris_system::settings::{Algorithm, NewtonConfig, SystemSettings, TimeScheme};
use fenris_system::solve::{OutputEvent, OutputRule, TimeSolver};
use fenris_system::vector::DistributedVector;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DVector, DVectorView};
use std::sync::Arc;
use std::time::Duration;

fn parameters() -> DVector<f64> {
    DVector::from_vec(vec![0.7, 1.3])
}

fn reaction_diffusion(comm: Arc<dyn Communicator>) -> EquationModel {
    chain_model(
        comm,
        4,
        Arc::new(ReactionDiffusion::nonlinear(0.5)),
        &[DofType::Temp],
        parameters(),
    )
}

fn settings(time_frames: &[f64]) -> SystemSettings {
    let mut settings = SystemSettings::default();
    settings.time.time_frames = time_frames.to_vec();
    settings
}

fn accurate_settings(time_frames: &[f64]) -> SystemSettings {
    let mut settings = settings(time_frames);
    let newton = NewtonConfig {
        relative_tolerance: 1e-14,
        absolute_tolerance: 1e-13,
        ..NewtonConfig::default()
    };
    settings.nonlinear.algorithms = vec![Algorithm::Newton(newton)];
    settings.nonlinear.adjoint = newton;
    settings
}

/// A non-uniform initial state, so that diffusion contributes to the sensitivities.
fn set_wavy_initial_solution(solver: &mut TimeSolver) {
    let full = DVector::from_vec(vec![0.0, 0.3, -0.2, 0.5, 0.1]);
    let map = Arc::clone(solver.model().map().unwrap());
    let initial = DistributedVector::from_full(map, &full).unwrap();
    solver.set_initial_solution(initial).unwrap();
}

fn failing_newton() -> Algorithm {
    Algorithm::Newton(NewtonConfig {
        max_iterations: 0,
        ..NewtonConfig::default()
    })
}

#[test]
fn steps_are_solved_in_order_from_the_previous_solution() {
    let recorder = Arc::new(RecordingKernel::new(ReactionDiffusion::nonlinear(0.5)));
    let model = chain_model(serial_comm(), 3, recorder.clone(), &[DofType::Temp], parameters());
    let mut solver = TimeSolver::new(model, &settings(&[0.0, 0.5, 1.0])).unwrap();
    solver.solve().unwrap();

    let observations = recorder.observations.lock().unwrap();
    let times: Vec<f64> = observations.iter().map(|o| o.time).collect();
    let first_late = times.iter().position(|&t| t == 1.0).unwrap();
    assert!(times[..first_late].iter().all(|&t| t == 0.5));
    assert!(times[first_late..].iter().all(|&t| t == 1.0));

    let step_one = solver.get_full_solution(1).unwrap();
    for observation in &observations[first_late..] {
        for (i, &entity) in observation.master.iter().enumerate() {
            assert_eq!(observation.previous_values[i], step_one[entity as usize]);
        }
    }
    // The first evaluation of a step starts from the previous solution
    assert_eq!(observations[first_late].values, observations[first_late].previous_values);

    assert_eq!(solver.history().len(), 3);
    assert_eq!(solver.reports().len(), 2);
    assert_eq!(solver.reports()[1].step, 2);
    assert_eq!(solver.reports()[1].time, 1.0);
}

#[test]
fn adjoint_sweep_visits_steps_backward_and_keeps_forward_history() {
    let mut solver = TimeSolver::new(reaction_diffusion(serial_comm()), &settings(&[0.0, 0.2, 0.5, 1.0])).unwrap();
    solver.solve().unwrap();
    let forward: Vec<_> = (0..=3).map(|k| solver.get_full_solution(k).unwrap()).collect();

    let sensitivities = solver.solve_sensitivity().unwrap();
    assert_eq!(sensitivities.len(), 1);
    assert_eq!(sensitivities[0].visited_steps, vec![3, 2, 1]);
    assert_eq!(sensitivities[0].value, solver.quantities_of_interest().unwrap()[0]);
    assert_matrix_eq!(sensitivities[0].explicit, DVector::from_vec(vec![0.0, 0.4]), comp = abs, tol = 1e-14);

    for (k, before) in forward.iter().enumerate() {
        assert_eq!(&solver.get_full_solution(k).unwrap(), before);
    }
}

#[test]
fn adjoint_sensitivity_matches_finite_differences() {
    let frames = [0.0, 0.2, 0.5, 1.0];
    let mut solver = TimeSolver::new(reaction_diffusion(serial_comm()), &accurate_settings(&frames)).unwrap();
    set_wavy_initial_solution(&mut solver);
    solver.solve().unwrap();
    let sensitivity = solver.solve_sensitivity().unwrap().remove(0).total();

    let h = 1e-4;
    let mut quantity = |p: DVectorView<f64>| {
        solver.model_mut().set_parameters(p.clone_owned());
        solver.solve().unwrap();
        solver.quantities_of_interest().unwrap()[0]
    };
    let mut fd = DVector::zeros(2);
    for j in 0..2 {
        let mut p = parameters();
        p[j] += h;
        let plus = quantity(DVectorView::from(&p));
        p[j] -= 2.0 * h;
        let minus = quantity(DVectorView::from(&p));
        fd[j] = (plus - minus) / (2.0 * h);
    }

    assert!(sensitivity.iter().all(|v| v.abs() > 1e-3));
    assert_matrix_eq!(sensitivity, fd, comp = abs, tol = 1e-6);
}

#[test]
fn distributed_time_solve_matches_serial() {
    let settings = accurate_settings(&[0.0, 0.25, 0.5]);
    let mut serial = TimeSolver::new(reaction_diffusion(serial_comm()), &settings).unwrap();
    set_wavy_initial_solution(&mut serial);
    serial.solve().unwrap();
    let expected_solution = serial.get_full_solution(2).unwrap();
    let expected_sensitivity = serial.solve_sensitivity().unwrap().remove(0).total();

    let results = run_ranks(2, |comm| {
        let mut solver = TimeSolver::new(reaction_diffusion(comm), &settings).unwrap();
        set_wavy_initial_solution(&mut solver);
        solver.solve().unwrap();
        let sensitivity = solver.solve_sensitivity().unwrap().remove(0).total();
        (solver.get_full_solution(2).unwrap(), sensitivity)
    })
    .unwrap();

    for (solution, sensitivity) in results {
        assert_matrix_eq!(solution, expected_solution, comp = abs, tol = 1e-10);
        assert_matrix_eq!(sensitivity, expected_sensitivity, comp = abs, tol = 1e-10);
    }
}

#[test]
fn staggered_scheme_solves_each_group_per_step() {
    let model = |comm: Arc<dyn Communicator>| {
        chain_model(
            comm,
            3,
            Arc::new(CoupledFields::default()),
            &[DofType::Temp, DofType::P],
            DVector::zeros(0),
        )
    };
    let mut staggered_settings = settings(&[0.0, 1.0, 2.0]);
    staggered_settings.time.scheme = TimeScheme::Staggered {
        groups: vec![vec![DofType::Temp], vec![DofType::P]],
    };
    let mut staggered = TimeSolver::new(model(serial_comm()), &staggered_settings).unwrap();
    staggered.solve().unwrap();
    for report in staggered.reports() {
        assert_eq!(report.solves.len(), 2);
        assert!(report.solves.iter().all(|(name, _)| name == "Newton"));
    }

    let mut monolithic = TimeSolver::new(model(serial_comm()), &settings(&[0.0, 1.0, 2.0])).unwrap();
    monolithic.solve().unwrap();
    assert!(monolithic.reports().iter().all(|r| r.solves.len() == 1));

    // Repeated staggered steps approach the coupled steady state
    let first = staggered.get_full_solution(1).unwrap();
    let second = staggered.get_full_solution(2).unwrap();
    let coupled = monolithic.get_full_solution(2).unwrap();
    assert!((&second - &coupled).norm() < (&first - &coupled).norm());
}

#[test]
fn failed_attempt_is_retried_with_the_next_algorithm() {
    let mut settings = settings(&[0.0, 0.5, 1.0]);
    settings.nonlinear.algorithms = vec![failing_newton(), Algorithm::Newton(NewtonConfig::default())];
    let mut solver = TimeSolver::new(reaction_diffusion(serial_comm()), &settings).unwrap();
    solver.solve().unwrap();

    for report in solver.reports() {
        assert_eq!(report.failed_attempts.len(), 1);
        assert_eq!(report.failed_attempts[0].iterations, 0);
        assert_eq!(report.solves.len(), 1);
        assert!(report.solves[0].1 > 0);
    }
}

#[test]
fn exhausted_attempts_stop_the_time_loop() {
    let mut settings = settings(&[0.0, 0.5, 1.0]);
    settings.nonlinear.algorithms = vec![failing_newton()];
    settings.time.max_restarts = 1;
    let mut solver = TimeSolver::new(reaction_diffusion(serial_comm()), &settings).unwrap();

    match solver.solve() {
        Err(SystemError::NotConverged { step, attempts }) => {
            assert_eq!(step, 1);
            assert_eq!(attempts.len(), 2);
        }
        other => panic!("expected NotConverged, got {:?}", other),
    }
    assert!(solver.quantities_of_interest().is_err());
    assert!(solver.solve_sensitivity().is_err());
}

/// Entity 4 lies only in the last element, which rank 1 owns.
fn failing_on_last_rank(comm: Arc<dyn Communicator>, failures: usize) -> EquationModel {
    let kernel = LocalFailure::new(ReactionDiffusion::nonlinear(0.5), 4, failures);
    chain_model(comm, 4, Arc::new(kernel), &[DofType::Temp], parameters())
}

#[test]
fn kernel_failure_on_one_rank_is_retried_on_every_rank() {
    let settings = accurate_settings(&[0.0, 0.5]);
    let comms = ThreadComm::create_with_timeout(2, Duration::from_secs(2));
    let results = run_ranks_with(comms, |comm| {
        let mut solver = TimeSolver::new(failing_on_last_rank(comm, 1), &settings).unwrap();
        solver.solve().unwrap();
        (solver.reports()[0].clone(), solver.get_full_solution(1).unwrap())
    })
    .unwrap();

    let mut reference = TimeSolver::new(reaction_diffusion(serial_comm()), &settings).unwrap();
    reference.solve().unwrap();
    let expected = reference.get_full_solution(1).unwrap();
    for (rank, (report, solution)) in results.into_iter().enumerate() {
        assert_eq!(report.failed_attempts.len(), 1);
        let reason = &report.failed_attempts[0].reason;
        let cause = if rank == 0 { "rank 1" } else { "entity 4" };
        assert!(reason.contains(cause), "{}", reason);
        assert_eq!(report.solves.len(), 1);
        assert_matrix_eq!(solution, expected, comp = abs, tol = 1e-10);
    }
}

#[test]
fn persistent_kernel_failure_on_one_rank_stops_every_rank() {
    let comms = ThreadComm::create_with_timeout(2, Duration::from_secs(2));
    let results = run_ranks_with(comms, |comm| {
        let model = failing_on_last_rank(comm, usize::MAX);
        let mut settings = settings(&[0.0, 0.5]);
        settings.time.max_restarts = 1;
        let mut solver = TimeSolver::new(model, &settings).unwrap();
        solver.solve()
    })
    .unwrap();

    for result in results {
        match result {
            Err(SystemError::NotConverged { step, attempts }) => {
                assert_eq!(step, 1);
                assert_eq!(attempts.len(), 2);
            }
            other => panic!("expected NotConverged, got {:?}", other),
        }
    }
}

#[test]
fn output_rules_trigger_after_matching_steps() {
    let frames = [0.0, 0.25, 0.5, 0.75, 1.0, 1.25];
    let mut solver = TimeSolver::new(reaction_diffusion(serial_comm()), &settings(&frames)).unwrap();
    solver.add_output(OutputRule::every("field", 2));
    solver.add_output(OutputRule::new("late", |info| info.time > 1.0));
    solver.solve().unwrap();

    let event = |name: &str, step: usize| OutputEvent {
        name: name.to_string(),
        step,
        time: frames[step],
    };
    assert_eq!(
        solver.output_events(),
        &[event("field", 2), event("field", 4), event("field", 5), event("late", 5)]
    );
}

#[test]
fn restart_from_checkpoint_continues_the_solve() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("step1.bin");

    let mut full = TimeSolver::new(reaction_diffusion(serial_comm()), &settings(&[0.0, 0.5, 1.0])).unwrap();
    full.solve().unwrap();
    full.write_checkpoint(1, &path).unwrap();

    let mut restarted = TimeSolver::new(reaction_diffusion(serial_comm()), &settings(&[0.5, 1.0])).unwrap();
    restarted.load_initial_solution(&path).unwrap();
    restarted.solve().unwrap();

    assert_eq!(restarted.get_full_solution(0).unwrap(), full.get_full_solution(1).unwrap());
    assert_matrix_eq!(
        restarted.get_full_solution(1).unwrap(),
        full.get_full_solution(2).unwrap(),
        comp = abs,
        tol = 1e-12
    );
}

#[test]
fn initial_solution_must_share_the_model_map() {
    let mut solver = TimeSolver::new(reaction_diffusion(serial_comm()), &settings(&[0.0, 1.0])).unwrap();
    let foreign = reaction_diffusion(serial_comm()).zeros().unwrap();
    assert!(matches!(
        solver.set_initial_solution(foreign),
        Err(SystemError::Precondition(_))
    ));
}

#[test]
fn invalid_configurations_are_rejected() {
    for frames in [vec![0.0], vec![0.0, 1.0, 1.0], vec![1.0, 0.5]] {
        let result = TimeSolver::new(reaction_diffusion(serial_comm()), &settings(&frames));
        assert!(matches!(result, Err(SystemError::Precondition(_))));
    }

    let mut staggered = settings(&[0.0, 1.0]);
    staggered.time.scheme = TimeScheme::Staggered { groups: vec![] };
    let result = TimeSolver::new(reaction_diffusion(serial_comm()), &staggered);
    assert!(matches!(result, Err(SystemError::Precondition(_))));

    let (mesh, objects) = super::fixtures::chain_partition(0, 1, 2, &[DofType::Temp]);
    let dofs = DofManager::new(Arc::new(mesh), serial_comm(), Default::default());
    let uninitialized = EquationModel::new(
        dofs,
        vec![EquationSet::new("chain", Arc::new(ReactionDiffusion::linear()), objects)],
    );
    let result = TimeSolver::new(uninitialized, &settings(&[0.0, 1.0]));
    assert!(matches!(result, Err(SystemError::Precondition(_))));
}
