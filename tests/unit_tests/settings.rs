use fenris_system::dof::DofType;
use fenris_system::error::SystemError;
use fenris_system::settings::{
    AdofStrategy, Algorithm, LinearSolverKind, NewtonConfig, NlbgsConfig, PreconditionerKind, SystemSettings,
    TimeScheme,
};

#[test]
fn empty_json_gives_defaults() {
    let settings = SystemSettings::from_json_str("{}").unwrap();
    assert_eq!(settings, SystemSettings::default());
    assert_eq!(settings.dofs.strategy, AdofStrategy::Nodal);
    assert_eq!(settings.nonlinear.algorithms, vec![Algorithm::Newton(NewtonConfig::default())]);
    assert_eq!(settings.linear.kind, LinearSolverKind::Direct);
    assert_eq!(settings.time.time_frames, vec![0.0, 1.0]);
}

#[test]
fn partial_json_overrides_only_given_fields() {
    let json = r#"{
        "dofs": { "time_levels": [["Temp", 2]] },
        "nonlinear": {
            "algorithms": [
                { "type": "Newton", "max_iterations": 5, "line_search": true },
                { "type": "Nlbgs", "groups": [["Temp"], ["P"]] }
            ]
        },
        "linear": { "kind": "Cg", "preconditioner": "Jacobi" },
        "time": {
            "time_frames": [0.0, 0.1, 0.3],
            "scheme": { "Staggered": { "groups": [["Temp", "P"]] } }
        }
    }"#;
    let settings = SystemSettings::from_json_str(json).unwrap();

    assert_eq!(settings.dofs.time_levels_for(DofType::Temp), 2);
    assert_eq!(settings.dofs.time_levels_for(DofType::P), 1);

    let newton = NewtonConfig {
        max_iterations: 5,
        line_search: true,
        ..NewtonConfig::default()
    };
    let nlbgs = NlbgsConfig {
        groups: vec![vec![DofType::Temp], vec![DofType::P]],
        ..NlbgsConfig::default()
    };
    assert_eq!(
        settings.nonlinear.algorithms,
        vec![Algorithm::Newton(newton), Algorithm::Nlbgs(nlbgs)]
    );
    assert_eq!(settings.nonlinear.algorithms[1].name(), "NLBGS");
    assert_eq!(settings.linear.kind, LinearSolverKind::Cg);
    assert_eq!(settings.linear.preconditioner, PreconditionerKind::Jacobi);
    assert_eq!(settings.time.time_frames, vec![0.0, 0.1, 0.3]);
    assert_eq!(
        settings.time.scheme,
        TimeScheme::Staggered {
            groups: vec![vec![DofType::Temp, DofType::P]]
        }
    );
}

#[test]
fn settings_survive_serialization() {
    let mut settings = SystemSettings::default();
    settings.time.max_restarts = 7;
    settings.nonlinear.adjoint.relative_tolerance = 1e-10;
    let json = serde_json::to_string(&settings).unwrap();
    assert_eq!(SystemSettings::from_json_str(&json).unwrap(), settings);
}

#[test]
fn invalid_json_is_a_settings_error() {
    assert!(matches!(
        SystemSettings::from_json_str(r#"{ "linear": { "kind": "Multifrontal" } }"#),
        Err(SystemError::Settings(_))
    ));
    assert!(matches!(SystemSettings::from_json_str("{"), Err(SystemError::Settings(_))));
}
