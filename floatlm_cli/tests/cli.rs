use assert_cmd::Command;
use floatlm::count::{write_int_counts, write_single_integer, IntCount, Word};
use floatlm::metaparams::Metaparams;
use predicates::str::contains;
use std::path::Path;

fn bigram(h: Word, w: Word, count: u64) -> IntCount {
    IntCount { hist: vec![h], word: w, count }
}

fn trigram(h0: Word, h1: Word, w: Word, count: u64) -> IntCount {
    IntCount { hist: vec![h0, h1], word: w, count }
}

/// Lays out a minimal count directory with one training source.
fn write_count_dir(dir: &Path) {
    write_single_integer(&dir.join("ngram_order"), 3).unwrap();
    write_single_integer(&dir.join("num_train_sets"), 1).unwrap();
    write_single_integer(&dir.join("num_words"), 6).unwrap();
    write_int_counts(
        &dir.join("int.1.2"),
        2,
        1,
        &[
            bigram(1, 4, 3),
            bigram(4, 2, 1),
            bigram(4, 5, 4),
            bigram(5, 2, 2),
            bigram(5, 4, 2),
        ],
    )
    .unwrap();
    write_int_counts(
        &dir.join("int.1.3"),
        3,
        1,
        &[
            trigram(4, 1, 5, 3),
            trigram(5, 4, 2, 1),
            trigram(5, 4, 5, 1),
        ],
    )
    .unwrap();
    write_int_counts(
        &dir.join("int.dev"),
        3,
        0,
        &[trigram(4, 1, 5, 2), trigram(5, 4, 2, 1), trigram(6, 5, 4, 1)],
    )
    .unwrap();
}

#[test]
fn estimate_then_info() {
    let dir = tempfile::tempdir().unwrap();
    write_count_dir(dir.path());
    let metaparams = Metaparams::initialize(1, 3, None);
    metaparams.write(&dir.path().join("metaparams")).unwrap();
    Command::cargo_bin("floatlm")
        .unwrap()
        .args([
            "estimate",
            dir.path().to_str().unwrap(),
            dir.path().join("metaparams").to_str().unwrap(),
            dir.path().join("objf").to_str().unwrap(),
            "--lm-dir-out",
            dir.path().join("lm").to_str().unwrap(),
        ])
        .assert()
        .success();
    let objf: f64 = std::fs::read_to_string(dir.path().join("objf"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(objf < 0.0);
    Command::cargo_bin("floatlm")
        .unwrap()
        .args(["info", dir.path().join("lm").to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("ngram_order 3"))
        .stdout(contains("num_words 6"));
}

#[test]
fn prune_requires_a_threshold_or_a_target() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("floatlm")
        .unwrap()
        .args([
            "prune",
            dir.path().join("in").to_str().unwrap(),
            dir.path().join("out").to_str().unwrap(),
        ])
        .assert()
        .failure();
}

#[test]
fn init_metaparams_writes_a_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("0.metaparams");
    Command::cargo_bin("floatlm")
        .unwrap()
        .args([
            "init-metaparams",
            "--ngram-order",
            "4",
            "--num-train-sets",
            "2",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();
    let params = Metaparams::read_validated(&out, 2, 4).unwrap();
    assert!(params.is_feasible());
}
