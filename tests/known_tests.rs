use slug_scan_rs::known::{load_slug_list, parse_slug_list};
use std::fs;

#[test]
fn parse_retry_file_with_comments() {
    let input = r#"
        # 3 slugs with fetch errors
        aab3k
        MTAwMA==   # base64 id 1000
        aab3k      # duplicate
        # blank line follows

    "#;

    let slugs = parse_slug_list(input).expect("parse ok");
    // Dedup, preserve order of first appearance
    assert_eq!(slugs, vec!["aab3k", "MTAwMA=="]);
}

#[test]
fn slug_with_space_rejected() {
    assert!(parse_slug_list("ab cd\n").is_err());
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retry.txt");
    fs::write(&path, "zb74k\nym99l\n").unwrap();
    assert_eq!(load_slug_list(&path).unwrap(), vec!["zb74k", "ym99l"]);
    assert!(load_slug_list(dir.path().join("missing.txt")).is_err());
}
