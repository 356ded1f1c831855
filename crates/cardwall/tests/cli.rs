use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn cardwall(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cardwall"))
        .env("CARDWALL_CONFIG_DIR", root.join("config"))
        .env("CARDWALL_DATA_DIR", root.join("data"))
        .env_remove("CARDWALL_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run cardwall")
}

fn report(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "cardwall failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("report is valid JSON")
}

#[test]
fn simulation_reports_bounded_pool_usage() {
    let root = TempDir::new().unwrap();
    let output = cardwall(
        root.path(),
        &["--cards", "16", "--ticks", "300", "--seed", "7", "--json"],
    );
    let report = report(&output);

    assert_eq!(report["cards"], 16);
    assert_eq!(report["pool_size"], 8);
    assert!(report["peak_in_use"].as_u64().unwrap() <= 8);
    let states = report["states"].as_object().unwrap();
    let total: u64 = states.values().map(|count| count.as_u64().unwrap()).sum();
    assert_eq!(total, 16);
}

#[test]
fn config_file_in_config_dir_is_picked_up() {
    let root = TempDir::new().unwrap();
    let config_dir = root.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("cardwall.toml"),
        "version = 1\n[pool]\nsize = 3\n[static_render]\nmode = \"batched\"\nbatch_size = 8\n",
    )
    .unwrap();

    let report = report(&cardwall(
        root.path(),
        &["--cards", "10", "--ticks", "120", "--json"],
    ));
    assert_eq!(report["pool_size"], 3);
    assert_eq!(report["batch_limit"], 3);
    assert!(report["peak_in_use"].as_u64().unwrap() <= 3);
}

#[test]
fn identical_seeds_produce_identical_reports() {
    let root = TempDir::new().unwrap();
    let args = ["--cards", "12", "--ticks", "200", "--seed", "42", "--json"];
    let first = report(&cardwall(root.path(), &args));
    let second = report(&cardwall(root.path(), &args));
    assert_eq!(first, second);
}

#[test]
fn snapshots_are_written_as_png() {
    let root = TempDir::new().unwrap();
    let out = root.path().join("stills");
    let report = report(&cardwall(
        root.path(),
        &[
            "--cards",
            "4",
            "--ticks",
            "60",
            "--json",
            "--snapshots",
            out.to_str().unwrap(),
        ],
    ));
    let written = report["snapshots_written"].as_u64().unwrap();
    assert!(written > 0);
    let pngs = fs::read_dir(&out)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
        .count() as u64;
    assert_eq!(pngs, written);
}

#[test]
fn config_init_then_check() {
    let root = TempDir::new().unwrap();
    let init = cardwall(root.path(), &["config", "init"]);
    assert!(init.status.success());
    assert!(root.path().join("config/cardwall.toml").exists());

    let again = cardwall(root.path(), &["config", "init"]);
    assert!(!again.status.success());

    let check = cardwall(root.path(), &["config", "check"]);
    assert!(check.status.success());
    let printed = String::from_utf8_lossy(&check.stdout);
    assert!(printed.contains("[pool]"));
    assert!(printed.contains("deactivate_debounce = \"150ms\""));
}

#[test]
fn invalid_config_is_rejected() {
    let root = TempDir::new().unwrap();
    let bad = root.path().join("bad.toml");
    fs::write(&bad, "version = 1\n[pool]\nsize = 0\n").unwrap();

    let check = cardwall(root.path(), &["config", "check", bad.to_str().unwrap()]);
    assert!(!check.status.success());

    let run = cardwall(root.path(), &["--config", bad.to_str().unwrap()]);
    assert!(!run.status.success());
}
