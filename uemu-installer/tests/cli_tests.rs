use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;
use uemu_core::config::{Arch, DEFAULT_CHANNEL};
use uemu_installer::cli::{Cli, Command};

fn create_args(argv: &[&str]) -> uemu_installer::cli::CreateArgs {
    let mut full = vec!["uemu", "create"];
    full.extend_from_slice(argv);
    match Cli::try_parse_from(full).expect("parse").command {
        Command::Create(args) => args,
    }
}

#[test]
fn create_requires_a_name() {
    assert!(Cli::try_parse_from(["uemu", "create"]).is_err());
}

#[test]
fn flags_map_onto_config() {
    let args = create_args(&[
        "x86",
        "--channel",
        "ubports-touch/16.04/devel",
        "--revision",
        "-2",
        "--use-raw-disk",
        "--with-sdcard",
        "--arch",
        "armhf",
        "--password",
        "1234",
        "--locale",
        "es_AR.utf8",
    ]);
    assert_eq!(args.name, "x86");

    let cfg = args.config().expect("config");
    assert_eq!(cfg.channel, "ubports-touch/16.04/devel");
    assert_eq!(cfg.revision, -2);
    assert!(cfg.raw_disk);
    assert!(cfg.with_sdcard);
    assert_eq!(cfg.arch, Arch::Armhf);
    assert_eq!(cfg.password, "1234");
    assert_eq!(cfg.locale.as_deref(), Some("es_AR.utf8"));
}

#[test]
fn unsupported_arch_is_rejected_at_parse_time() {
    assert!(Cli::try_parse_from(["uemu", "create", "x", "--arch", "arm64"]).is_err());
}

#[test]
fn flags_override_config_file() {
    let tmp = tempdir().expect("tempdir");
    let file = tmp.path().join("uemu.toml");
    fs::write(
        &file,
        "arch = \"armhf\"\nrevision = 40\ndata_root = \"/srv/emulators\"\n",
    )
    .expect("write config");

    let args = create_args(&["x86", "--config", file.to_str().unwrap(), "--revision", "41"]);
    let cfg = args.config().expect("config");
    assert_eq!(cfg.arch, Arch::Armhf);
    assert_eq!(cfg.revision, 41);
    assert_eq!(cfg.data_root, PathBuf::from("/srv/emulators"));
    assert_eq!(cfg.channel, DEFAULT_CHANNEL);
}

#[test]
fn missing_config_file_is_an_error() {
    let tmp = tempdir().expect("tempdir");
    let args = create_args(&[
        "x86",
        "--config",
        tmp.path().join("absent.toml").to_str().unwrap(),
    ]);
    assert!(args.config().is_err());
}
