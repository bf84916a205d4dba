use deploy_gate::pipeline::{capitalize, digest_of, DEFAULT_MESSAGE, DEFAULT_OK};
use deploy_gate::prelude::*;

#[test]
fn test_derived_id_is_deterministic() {
    let a = DeployStep::new("Release to production?");
    let b = DeployStep::new("Release to production?");
    assert_eq!(a.id(), b.id());
    assert_eq!(a.id(), capitalize(&digest_of("Release to production?")));
    assert_ne!(a.id(), DeployStep::new("Release to staging?").id());
}

#[test]
fn test_explicit_id_is_capitalized() {
    assert_eq!(DeployStep::new("m").with_id("x").id(), "X");
    assert_eq!(DeployStep::new("m").with_id("prod-release").id(), "Prod-release");
    assert_eq!(DeployStep::new("m").with_id("Prod").id(), "Prod");
}

#[test]
fn test_step_from_yaml() {
    let yaml = r#"
message: "Release to production?"
id: prod
submitter: " alice, release-managers "
submitterParameter: approver
ok: Ship it
parameters:
  - type: choice
    name: region
    choices: [eu, us]
  - type: boolean
    name: dryRun
"#;
    let step: DeployStep = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(step.id(), "Prod");
    assert_eq!(step.message(), "Release to production?");
    assert_eq!(step.submitter(), Some("alice, release-managers"));
    assert_eq!(step.submitter_parameter(), Some("approver"));
    assert_eq!(step.ok(), "Ship it");
    assert_eq!(step.parameters().len(), 2);
    assert_eq!(step.parameters()[0].name(), "region");
}

#[test]
fn test_minimal_yaml_uses_defaults() {
    let step: DeployStep = serde_yaml::from_str("{}").unwrap();
    assert_eq!(step.message(), DEFAULT_MESSAGE);
    assert_eq!(step.ok(), DEFAULT_OK);
    assert_eq!(step.submitter(), None);
    assert!(step.parameters().is_empty());
    assert_eq!(step, DeployStep::default());
}

#[test]
fn test_yaml_round_trip_keeps_id() {
    let step = DeployStep::new("Release?")
        .with_id("prod")
        .with_submitter("alice")
        .with_parameters(vec![ParameterDefinition::string("env")]);
    let yaml = serde_yaml::to_string(&step).unwrap();
    let parsed: DeployStep = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed, step);
    assert_eq!(parsed.id(), "Prod");
}

#[test]
fn test_display_name() {
    assert_eq!(DeployStep::new("Release?").display_name(), "Release?");

    let long = DeployStep::new("Please confirm the production release of the app");
    assert!(long.display_name().ends_with("..."));
    assert_eq!(long.display_name().chars().count(), 35);
}
