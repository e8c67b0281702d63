use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use neurobatch::batch::{discover_units, DiscoverySpec};
use neurobatch::recipes::{DtifitRecipe, Recipe, RegistrationRecipe};
use neurobatch::NeuroBatchError;

fn mkdirs(root: &Path, dirs: &[&str]) {
    for dir in dirs {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
}

fn ids(root: &Path, spec: &DiscoverySpec) -> Vec<String> {
    discover_units(root, spec).unwrap().into_iter().map(|u| u.id).collect()
}

#[test]
fn test_subject_layout_sorted_and_excluding_template() {
    let dir = TempDir::new().unwrap();
    mkdirs(dir.path(), &["1000043", "1000037", "fsaverage", ".snapshots"]);
    fs::write(dir.path().join("notes.txt"), "not a subject").unwrap();

    assert_eq!(ids(dir.path(), &DiscoverySpec::subjects()), vec!["1000037", "1000043"]);
}

#[test]
fn test_custom_exclusions_replace_defaults() {
    let dir = TempDir::new().unwrap();
    mkdirs(dir.path(), &["AD01", "fsaverage", "code"]);

    let spec = DiscoverySpec::subjects().with_exclusions(["code"]);
    assert_eq!(ids(dir.path(), &spec), vec!["AD01", "fsaverage"]);
}

#[test]
fn test_session_layout() {
    let dir = TempDir::new().unwrap();
    mkdirs(
        dir.path(),
        &["sub_02/ses-1", "sub_01/ses-2", "sub_01/ses-1", "sub_01/anat", "derivatives/ses-1"],
    );

    let units = discover_units(dir.path(), &DiscoverySpec::sessions("sub_", "ses-")).unwrap();
    let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["sub_01/ses-1", "sub_01/ses-2", "sub_02/ses-1"]);
    assert_eq!(units[0].subject(), "sub_01");
    assert_eq!(units[0].root, dir.path().join("sub_01/ses-1"));
}

#[test]
fn test_required_subdirectory_filters_subjects() {
    let dir = TempDir::new().unwrap();
    mkdirs(dir.path(), &["AD01/dwi/dtifit", "AD02/dwi", "NC01/t1"]);

    assert_eq!(ids(dir.path(), &DtifitRecipe::new().discovery()), vec!["AD01", "AD02"]);
    assert_eq!(
        ids(dir.path(), &RegistrationRecipe::new("/ref", true).discovery()),
        vec!["AD01"]
    );
}

#[test]
fn test_prefix_filter() {
    let dir = TempDir::new().unwrap();
    mkdirs(dir.path(), &["sub_01", "sub_02", "pilot"]);

    let spec = DiscoverySpec::subjects().with_prefix("sub_");
    assert_eq!(ids(dir.path(), &spec), vec!["sub_01", "sub_02"]);
}

#[test]
fn test_missing_root_is_empty() {
    let dir = TempDir::new().unwrap();
    let units = discover_units(dir.path().join("nope"), &DiscoverySpec::subjects()).unwrap();
    assert!(units.is_empty());
}

#[test]
fn test_root_that_is_a_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("data");
    fs::write(&file, "").unwrap();

    let err = discover_units(&file, &DiscoverySpec::subjects()).unwrap_err();
    assert!(matches!(err, NeuroBatchError::Discovery { .. }));
}
