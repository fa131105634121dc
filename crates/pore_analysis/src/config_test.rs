use super::*;

#[test]
fn test_default_is_valid() {
  assert!(AnalysisConfig::default().validate().is_ok());
}

#[test]
fn test_zero_interval_rejected() {
  let config = AnalysisConfig::new(100, 0, 5);
  let err = config.validate().unwrap_err();
  assert!(err.to_string().contains("analysis_interval"));
}

#[test]
fn test_negative_beta_rejected() {
  let mut config = AnalysisConfig::new(100, 20, 5);
  config.beta = -1.0;
  assert!(config.validate().is_err());
}

#[test]
fn test_restart_path_is_per_rank() {
  let config = AnalysisConfig::new(100, 20, 5).with_output_dir("/tmp/run");
  assert_eq!(
    config.restart_path(3),
    std::path::PathBuf::from("/tmp/run/Restart.00003")
  );
}

#[test]
fn test_parse_affinity() {
  assert_eq!(ThreadAffinity::parse("none").unwrap(), ThreadAffinity::None);
  assert_eq!(
    ThreadAffinity::parse("independent").unwrap(),
    ThreadAffinity::Independent
  );
  assert!(ThreadAffinity::parse("pinned").is_err());
}
