//! Version manager tests: single active revision, conflicts, upgrades.

use std::io::Write;

use gg_cache::models::{sha256_file, ModelVersion, VersionError, VersionManager};

fn version(id: &str, ver: &str) -> ModelVersion {
    ModelVersion::new(id, ver, &format!("models/{id}-{ver}.bin"))
}

#[test]
fn test_activating_unknown_version_keeps_current_active() {
    let versions = VersionManager::new();
    versions.register(version("m", "v1").active()).unwrap();
    versions.register(version("m", "v2")).unwrap();

    versions.set_active_version("m", "v2").unwrap();
    assert_eq!(versions.get_active_version("m").unwrap().version, "v2");

    let err = versions.set_active_version("m", "v3").unwrap_err();
    assert_eq!(
        err,
        VersionError::VersionNotFound {
            model_id: "m".into(),
            version: "v3".into()
        }
    );
    assert_eq!(versions.get_active_version("m").unwrap().version, "v2");
}

#[test]
fn test_at_most_one_version_is_active() {
    let versions = VersionManager::new();
    versions.register(version("m", "1.0").active()).unwrap();
    versions.register(version("m", "1.1").active()).unwrap();
    versions.register(version("m", "1.2")).unwrap();

    let all = versions.get_all_versions("m");
    assert_eq!(all.len(), 3);
    assert_eq!(all.iter().filter(|v| v.is_active).count(), 1);
    assert_eq!(versions.get_active_version("m").unwrap().version, "1.1");
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let versions = VersionManager::new();
    let original = version("m", "v1").with_size_mb(100);
    versions.register(original).unwrap();

    let err = versions.register(version("m", "v1").with_size_mb(999)).unwrap_err();
    assert!(matches!(err, VersionError::VersionConflict { .. }));
    assert_eq!(versions.get_all_versions("m")[0].size_mb, 100);
}

#[test]
fn test_versions_are_listed_oldest_first() {
    let versions = VersionManager::new();
    for ver in ["v1", "v2", "v3"] {
        versions.register(version("m", ver)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    let listed: Vec<String> = versions.get_all_versions("m").into_iter().map(|v| v.version).collect();
    assert_eq!(listed, vec!["v1", "v2", "v3"]);
    assert!(versions.get_all_versions("unknown").is_empty());
}

#[test]
fn test_active_version_cannot_be_removed() {
    let versions = VersionManager::new();
    versions.register(version("m", "v1").active()).unwrap();
    versions.register(version("m", "v2")).unwrap();

    assert!(matches!(
        versions.remove_version("m", "v1"),
        Err(VersionError::ActiveVersion { .. })
    ));
    let removed = versions.remove_version("m", "v2").unwrap();
    assert_eq!(removed.version, "v2");
    assert!(matches!(
        versions.remove_version("m", "v2"),
        Err(VersionError::VersionNotFound { .. })
    ));
}

#[test]
fn test_compatibility_follows_major_version() {
    let versions = VersionManager::new();
    assert!(versions.check_version_compatibility("m", "9.0"), "nothing active accepts anything");

    versions.register(version("m", "v1.4.2").active()).unwrap();
    assert!(versions.check_version_compatibility("m", "1.9"));
    assert!(versions.check_version_compatibility("m", "v1.0.0-rc1"));
    assert!(!versions.check_version_compatibility("m", "2.0"));
    assert!(!versions.check_version_compatibility("m", "nightly"));
}

#[test]
fn test_upgrade_recommendations() {
    let versions = VersionManager::new();
    versions.register(version("old", "1.0").active()).unwrap();
    versions.register(version("old", "1.10")).unwrap();
    versions.register(version("current", "2.0")).unwrap();
    versions.register(version("current", "2.1").active()).unwrap();
    versions.register(version("inactive", "1.0")).unwrap();

    assert_eq!(versions.get_upgrade_recommendations(), vec!["old".to_string()]);
    assert_eq!(
        versions.model_ids(),
        vec!["current".to_string(), "inactive".to_string(), "old".to_string()]
    );
}

#[test]
fn test_sha256_file_matches_known_digest() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"abc").unwrap();
    file.flush().unwrap();

    assert_eq!(
        sha256_file(file.path()).unwrap(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert!(sha256_file("/nonexistent/model.bin").is_err());
}

#[test]
fn test_version_round_trips_through_json() {
    let v = version("m", "v1").with_checksum("deadbeef").active();
    let json = serde_json::to_string(&v).unwrap();
    let back: ModelVersion = serde_json::from_str(&json).unwrap();
    assert_eq!(back, v);
}
