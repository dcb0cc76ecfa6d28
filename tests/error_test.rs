//! Tests for error types

use oal_relax::Error;

#[test]
fn test_shape_mismatch_error() {
    let error = Error::shape_mismatch("member 2", "12 force vectors", 11);
    let error_str = format!("{error}");
    assert!(error_str.contains("Shape mismatch at member 2"));
    assert!(error_str.contains("expected 12 force vectors"));
    assert!(error_str.contains("got 11"));
}

#[test]
fn test_oracle_failure_error() {
    let error = Error::OracleFailure("SCF did not converge".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Oracle failure"));
    assert!(error_str.contains("SCF did not converge"));
    assert!(error_str.contains("training set was left untouched"));
}

#[test]
fn test_retrain_divergence_error() {
    let error = Error::RetrainDivergence {
        member: 3,
        reason: "loss is NaN".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("member 3"));
    assert!(error_str.contains("loss is NaN"));
}

#[test]
fn test_for_member_retags_divergence_only() {
    let error = Error::RetrainDivergence {
        member: 0,
        reason: "loss is NaN".to_string(),
    }
    .for_member(4);
    assert!(matches!(error, Error::RetrainDivergence { member: 4, .. }));
    assert!(format!("{error}").contains("member 4"));

    let error = Error::InvalidInput("bad".to_string()).for_member(4);
    assert!(matches!(error, Error::InvalidInput(ref m) if m == "bad"));
}

#[test]
fn test_configuration_error() {
    let error = Error::Configuration("cyclic delta composition: a -> b -> a".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Configuration error"));
    assert!(error_str.contains("a -> b -> a"));
}

#[test]
fn test_chain_corruption_error() {
    let error = Error::ChainCorruption("record x points across runs".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Provenance chain corruption"));
    assert!(error_str.contains("Already committed records remain valid"));
}

#[test]
fn test_storage_error() {
    let error = Error::StorageError("disk full".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Storage error"));
    assert!(error_str.contains("disk full"));
}

#[test]
fn test_invalid_input_error() {
    let error = Error::InvalidInput("atoms 0 and 1 overlap".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid input"));
    assert!(error_str.contains("overlap"));
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint.json");
    let error: Error = io.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_err.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_recoverable_classification() {
    assert!(Error::OracleFailure(String::new()).is_recoverable());
    assert!(Error::RetrainDivergence {
        member: 0,
        reason: String::new()
    }
    .is_recoverable());
    assert!(!Error::Configuration(String::new()).is_recoverable());
    assert!(!Error::shape_mismatch("run layout", 2, 3).is_recoverable());
}

#[test]
fn test_error_debug() {
    let error = Error::InvalidInput("test".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("InvalidInput"));
}
