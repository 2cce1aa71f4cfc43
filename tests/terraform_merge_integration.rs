//! End-to-end include + merge test over real `stratum.hcl` files
//! (spec.md §8 boundary scenario 4: shallow merge copy filters).

use stratum::hcl::load_unit;

#[tokio::test]
async fn child_unit_inherits_parent_terraform_source_but_overrides_copy_filters() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    std::fs::write(
        root.join("common.hcl"),
        r#"
terraform {
  source = "./modules/example"
}
"#,
    )
    .unwrap();

    let unit_dir = root.join("units").join("vpc");
    std::fs::create_dir_all(&unit_dir).unwrap();
    std::fs::write(
        unit_dir.join("stratum.hcl"),
        r#"
include "root" {
  path           = "../../common.hcl"
  merge_strategy = "shallow"
}

terraform {
  include_in_copy   = ["special-file.txt"]
  exclude_from_copy = ["**/_*"]
}
"#,
    )
    .unwrap();

    let config_path = camino::Utf8PathBuf::from_path_buf(unit_dir.join("stratum.hcl")).unwrap();
    let unit = load_unit(&config_path, false).await.unwrap();

    let tf = unit.terraform.expect("merged terraform block");
    assert_eq!(tf.source.as_ref().map(|p| p.as_str()), Some("./modules/example"));
    assert_eq!(tf.exclude_from_copy, vec!["**/_*".to_string()]);
    assert_eq!(tf.include_in_copy, vec!["special-file.txt".to_string()]);
}
