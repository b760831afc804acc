use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

#[test]
fn vault_store_get_hosts_delete_roundtrip() {
    let dir = TempDir::new().unwrap();
    let vault_path = dir.path().join("vault.json");
    let bin = assert_cmd::cargo::cargo_bin!("broker-control");

    Command::new(&bin)
        .args([
            "--vault-path",
            vault_path.to_str().unwrap(),
            "--passphrase",
            "correct horse battery staple",
            "vault-store",
            "--protocol",
            "http",
            "--target",
            "api.openai.com",
            "--credential-json",
            r#"{"type":"api_key","header":"Authorization","token":"sk-test-XYZ"}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("stored http:api.openai.com"));

    Command::new(&bin)
        .args(["--vault-path", vault_path.to_str().unwrap(), "--passphrase", "correct horse battery staple", "hosts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api.openai.com"))
        .stdout(predicate::str::contains("api_key"))
        .stdout(predicate::str::contains("sk-test-XYZ").not());

    Command::new(&bin)
        .args([
            "--vault-path",
            vault_path.to_str().unwrap(),
            "--passphrase",
            "correct horse battery staple",
            "vault-get",
            "--protocol",
            "http",
            "--target",
            "api.openai.com",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("sk-test-XYZ"));

    Command::new(&bin)
        .args([
            "--vault-path",
            vault_path.to_str().unwrap(),
            "--passphrase",
            "correct horse battery staple",
            "vault-delete",
            "--protocol",
            "http",
            "--target",
            "api.openai.com",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\":true"));
}

#[test]
fn vault_store_requires_a_passphrase() {
    let dir = TempDir::new().unwrap();
    let vault_path = dir.path().join("vault.json");
    let bin = assert_cmd::cargo::cargo_bin!("broker-control");

    Command::new(&bin)
        .env_remove("VAULT_PASSPHRASE")
        .args([
            "--vault-path",
            vault_path.to_str().unwrap(),
            "vault-store",
            "--protocol",
            "http",
            "--target",
            "x.com",
            "--credential-json",
            r#"{"type":"bearer","token":"t"}"#,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("VAULT_PASSPHRASE"));
}

#[test]
fn check_host_rejects_metadata_address_in_strict_mode() {
    let bin = assert_cmd::cargo::cargo_bin!("broker-control");
    Command::new(&bin)
        .args([
            "--vault-path",
            "/tmp/unused.json",
            "--passphrase",
            "unused",
            "check-host",
            "--host",
            "169.254.169.254",
            "--network-mode",
            "strict",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"allowed\":false"));
}

#[test]
fn check_path_flags_an_ssh_key() {
    let bin = assert_cmd::cargo::cargo_bin!("broker-control");
    Command::new(&bin)
        .args([
            "--vault-path",
            "/tmp/unused.json",
            "--passphrase",
            "unused",
            "check-path",
            "--path",
            "/home/user/.ssh/id_rsa",
            "--broker-data-dir",
            "/broker/data",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sensitive\":true"));
}
