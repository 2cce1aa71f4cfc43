//! End-to-end discovery + filter-intersection test over a real directory
//! tree (spec.md §8 boundary scenario: filter intersection).

use camino::Utf8PathBuf;
use stratum::discover::{self, DiscoveredKind};

fn write_unit(dir: &std::path::Path, rel: &str) {
    let unit_dir = dir.join(rel);
    std::fs::create_dir_all(&unit_dir).unwrap();
    std::fs::write(unit_dir.join("stratum.hcl"), "locals {\n  name = \"x\"\n}\n").unwrap();
}

#[test]
fn discovers_nested_units_bounded_by_max_folders() {
    let tmp = tempfile::tempdir().unwrap();
    write_unit(tmp.path(), "units/vpc");
    write_unit(tmp.path(), "units/vpc/subnet");
    write_unit(tmp.path(), "units/legacy/old-vpc");

    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    let found = discover::discover(&root, 1_000).unwrap();

    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|e| e.kind == DiscoveredKind::Unit));
}

#[test]
fn discovery_limit_exceeded_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..10 {
        write_unit(tmp.path(), &format!("units/u{i}"));
    }
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    let err = discover::discover(&root, 2).unwrap_err();
    assert!(err.to_string().to_lowercase().contains("limit") || err.to_string().contains("STRATUM"));
}

#[test]
fn filter_intersection_over_discovered_paths() {
    // "units/** | name=vpc*" requires discovery for the name= token; a
    // path-only command should reject it outright (spec.md §4.4).
    let tmp = tempfile::tempdir().unwrap();
    write_unit(tmp.path(), "units/vpc");
    write_unit(tmp.path(), "units/legacy/old-vpc");

    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    let found = discover::discover(&root, 1_000).unwrap();

    let tokens = discover::parse_filter_query("units/vpc").unwrap();
    assert!(discover::reject_attribute_filters_for_path_only(&tokens, "units/vpc").is_ok());
    let glob_set = discover::compile_path_globs(&tokens).unwrap();
    let matched: Vec<_> = found
        .iter()
        .filter(|e| {
            let rel = e.path.strip_prefix(&root).unwrap_or(&e.path);
            glob_set.is_match(rel.as_str())
        })
        .collect();
    assert_eq!(matched.len(), 1);
    assert!(matched[0].path.as_str().ends_with("units/vpc"));

    let mixed = discover::parse_filter_query("units/** | name=vpc*").unwrap();
    assert!(discover::reject_attribute_filters_for_path_only(&mixed, "units/** | name=vpc*").is_err());
}
