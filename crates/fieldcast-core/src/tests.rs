use crate::{
    failure, failure_code, is_generator_default, CancelToken, FailureCode, UpdateConfig,
};

#[test]
fn failure_code_round_trips_through_as_str() {
    let codes = [
        FailureCode::Locked,
        FailureCode::BadRepositoryState,
        FailureCode::NotFound,
        FailureCode::NetworkError,
        FailureCode::PermissionError,
        FailureCode::CheckoutVerificationFailed,
        FailureCode::ServiceStopFailed,
        FailureCode::ServiceStartFailed,
        FailureCode::ArtifactValidationFailed,
        FailureCode::ProcessReplacementFailed,
        FailureCode::Interrupted,
    ];
    for code in codes {
        assert_eq!(FailureCode::parse(code.as_str()), Some(code));
    }
    assert_eq!(FailureCode::parse("no-such-code"), None);
}

#[test]
fn failure_code_is_recovered_from_wrapped_error() {
    let err = failure(FailureCode::NotFound, "tag v9.9.9 does not exist")
        .context("resolving switch target");
    assert_eq!(failure_code(&err), Some(FailureCode::NotFound));
}

#[test]
fn failure_code_is_none_for_plain_errors() {
    let err = anyhow::anyhow!("something else went wrong");
    assert_eq!(failure_code(&err), None);
}

#[test]
fn exit_codes_are_distinct() {
    let codes = [
        FailureCode::Locked,
        FailureCode::BadRepositoryState,
        FailureCode::NotFound,
        FailureCode::NetworkError,
        FailureCode::PermissionError,
        FailureCode::CheckoutVerificationFailed,
        FailureCode::ServiceStopFailed,
        FailureCode::ServiceStartFailed,
        FailureCode::ArtifactValidationFailed,
        FailureCode::ProcessReplacementFailed,
        FailureCode::Interrupted,
    ];
    let mut seen = Vec::new();
    for code in codes {
        let exit = code.exit_code();
        assert!(!seen.contains(&exit), "duplicate exit code {exit}");
        seen.push(exit);
    }
}

#[test]
fn generator_default_requires_key_and_value_match() {
    assert!(is_generator_default("FIELDCAST_SAMPLE_RATE", "48000"));
    assert!(!is_generator_default("FIELDCAST_SAMPLE_RATE", "44100"));
    assert!(!is_generator_default("FIELDCAST_EXTRA_ARGS", "--mono"));
}

#[test]
fn config_defaults_parse_from_empty_toml() {
    let config = UpdateConfig::from_toml_str("").expect("must parse empty config");
    assert_eq!(config, UpdateConfig::default());
    assert_eq!(config.remote_name, "origin");
    assert_eq!(
        config.self_artifact_abs(),
        config.repo_root.join("scripts/fieldcast-update")
    );
}

#[test]
fn config_accepts_partial_override() {
    let config = UpdateConfig::from_toml_str(
        "development_branch = \"develop\"\n\n[timeouts]\nfetch_retries = 5\n",
    )
    .expect("must parse partial config");
    assert_eq!(config.development_branch, "develop");
    assert_eq!(config.timeouts.fetch_retries, 5);
    assert_eq!(config.timeouts.fetch_timeout_secs, 60);
}

#[test]
fn config_rejects_absolute_self_artifact() {
    let err = UpdateConfig::from_toml_str("self_artifact = \"/usr/bin/update\"\n")
        .expect_err("must reject absolute self_artifact");
    assert!(err.to_string().contains("relative"));
}

#[test]
fn config_rejects_empty_validator() {
    let err = UpdateConfig::from_toml_str("artifact_validator = []\n")
        .expect_err("must reject empty validator");
    assert!(err.to_string().contains("artifact_validator"));
}

#[test]
fn cancel_token_checks_fail_after_cancel() {
    let token = CancelToken::new();
    token.check("fetch").expect("must pass before cancel");

    token.cancel();
    let err = token.check("fetch").expect_err("must fail after cancel");
    assert!(err.to_string().starts_with("interrupted: "));
}

#[test]
fn disarmed_token_ignores_cancellation() {
    let token = CancelToken::new();
    token.cancel();
    token.disarm();
    assert!(!token.is_cancelled());
    token.check("rollback").expect("disarmed token must pass");

    token.rearm();
    assert!(token.is_cancelled());
}
