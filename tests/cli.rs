use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("magebox");
    Command::new(path)
}

fn magebox(data_dir: &Path) -> Command {
    let mut cmd = bin();
    cmd.env("MAGEBOX_HOME", data_dir);
    cmd.arg("--json");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

#[test]
fn paths_reports_the_data_dir_layout() {
    let dir = tempdir().unwrap();
    let output = magebox(dir.path()).arg("paths").output().unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    let registry = json["result"]["registry_path"].as_str().unwrap();
    assert!(registry.starts_with(dir.path().to_str().unwrap()));
    assert!(registry.ends_with("isolated-projects.json"));
    assert_eq!(json["result"]["registry_exists"], false);
}

#[test]
fn isolate_list_starts_empty() {
    let dir = tempdir().unwrap();
    let output = magebox(dir.path())
        .args(["isolate", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"].as_array().unwrap().len(), 0);
}

#[test]
fn disable_without_isolation_fails() {
    let dir = tempdir().unwrap();
    bin()
        .env("MAGEBOX_HOME", dir.path())
        .args(["isolate", "disable", "ghost"])
        .assert()
        .failure()
        .stderr(contains("ghost"));
}

#[test]
fn restart_without_isolation_fails_with_json_error() {
    let dir = tempdir().unwrap();
    let output = magebox(dir.path())
        .args(["isolate", "restart", "ghost"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert!(json["error"].as_str().unwrap().contains("ghost"));
}

#[test]
fn stop_without_isolation_is_a_no_op() {
    let dir = tempdir().unwrap();
    magebox(dir.path())
        .args(["isolate", "stop", "ghost"])
        .assert()
        .success();
}

// Full isolation lifecycle against a stand-in php-fpm binary. /bin/true
// accepts the arguments and exits 0 without ever binding the socket, so the
// master is registered but reported as not running.
#[cfg(unix)]
#[test]
fn isolate_lifecycle_with_stubbed_php_fpm() {
    let dir = tempdir().unwrap();
    let project_dir = tempdir().unwrap();

    let output = magebox(dir.path())
        .env("MAGEBOX_PHP_FPM_BIN", "/bin/true")
        .args(["isolate", "enable", "shop"])
        .arg("--path")
        .arg(project_dir.path())
        .args(["--php", "8.3", "--setting", "opcache.jit=tracing"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "enable failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["php_version"], "8.3");
    let config_path = json["result"]["config_path"].as_str().unwrap().to_string();
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("php_admin_value[opcache.jit] = tracing"));

    let output = magebox(dir.path())
        .args(["isolate", "status", "shop"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["project_name"], "shop");
    assert_eq!(json["result"]["running"], false);

    let output = magebox(dir.path())
        .args(["isolate", "list"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"].as_array().unwrap().len(), 1);
    assert_eq!(json["result"][0]["project"], "shop");

    magebox(dir.path())
        .args(["isolate", "disable", "shop"])
        .assert()
        .success();
    assert!(!Path::new(&config_path).exists());

    let output = magebox(dir.path())
        .args(["isolate", "list"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"].as_array().unwrap().len(), 0);
}

#[test]
fn system_ini_ownership_lifecycle() {
    let dir = tempdir().unwrap();
    let shop = tempdir().unwrap();
    let blog = tempdir().unwrap();

    let output = magebox(dir.path())
        .args(["system-ini", "apply", "shop"])
        .arg("--path")
        .arg(shop.path())
        .args(["--php", "8.3", "--setting", "opcache.jit=tracing", "--yes"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["owner"], "shop");
    assert!(json["result"]["previous_owner"].is_null());
    let ini_path = json["result"]["ini_path"].as_str().unwrap().to_string();
    let ini = fs::read_to_string(&ini_path).unwrap();
    assert!(ini.contains("opcache.jit = tracing"));

    // Another project takes the version over.
    let output = magebox(dir.path())
        .args(["system-ini", "apply", "blog"])
        .arg("--path")
        .arg(blog.path())
        .args(["--php", "8.3", "--setting", "opcache.jit=off", "--yes"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["previous_owner"], "shop");

    let output = magebox(dir.path())
        .args(["system-ini", "show", "--php", "8.3"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["owner"], "blog");
    assert_eq!(json["result"]["settings"]["opcache.jit"], "off");

    // The stale owner cannot clear what it no longer owns.
    let output = magebox(dir.path())
        .args(["system-ini", "clear", "shop", "--php", "8.3"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["cleared"], false);
    assert!(Path::new(&ini_path).exists());

    let output = magebox(dir.path())
        .args(["system-ini", "clear", "blog", "--php", "8.3"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["cleared"], true);
    assert!(!Path::new(&ini_path).exists());

    let output = magebox(dir.path())
        .args(["system-ini", "show", "--php", "8.3"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert!(json["result"]["owner"].is_null());
}

#[test]
fn system_ini_apply_rejects_pool_only_settings() {
    let dir = tempdir().unwrap();
    let project = tempdir().unwrap();
    bin()
        .env("MAGEBOX_HOME", dir.path())
        .args(["system-ini", "apply", "shop"])
        .arg("--path")
        .arg(project.path())
        .args(["--php", "8.3", "--setting", "memory_limit=2G", "--yes"])
        .assert()
        .failure()
        .stderr(contains("memory_limit"));
}

#[test]
fn pool_generate_list_remove_cycle() {
    let dir = tempdir().unwrap();
    let project = tempdir().unwrap();

    let output = magebox(dir.path())
        .args(["pool", "generate", "shop"])
        .arg("--path")
        .arg(project.path())
        .args([
            "--php",
            "8.3",
            "--env",
            "APP_ENV=developer",
            "--setting",
            "memory_limit=2G",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    let config_path = json["result"]["config_path"].as_str().unwrap().to_string();
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[shop]"));
    assert!(content.contains("env[APP_ENV] = developer"));
    assert!(content.contains("php_value[memory_limit] = 2G"));

    let output = magebox(dir.path()).args(["pool", "list"]).output().unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"].as_array().unwrap().len(), 1);
    assert_eq!(json["result"][0]["project_name"], "shop");
    assert_eq!(json["result"][0]["php_version"], "8.3");

    let output = magebox(dir.path())
        .args(["pool", "remove", "shop"])
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["removed"], 1);
    assert!(!Path::new(&config_path).exists());

    let output = magebox(dir.path()).args(["pool", "list"]).output().unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"].as_array().unwrap().len(), 0);
}

#[test]
fn manifest_supplies_defaults_for_pool_generate() {
    let dir = tempdir().unwrap();
    let project = tempdir().unwrap();
    fs::write(
        project.path().join(".magebox.yml"),
        "php: \"8.2\"\nsettings:\n  memory_limit: 4G\n",
    )
    .unwrap();

    let output = magebox(dir.path())
        .args(["pool", "generate", "shop"])
        .arg("--path")
        .arg(project.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["php_version"], "8.2");
    let config_path = json["result"]["config_path"].as_str().unwrap().to_string();
    let content = fs::read_to_string(config_path).unwrap();
    assert!(content.contains("php_value[memory_limit] = 4G"));
}

#[test]
fn invalid_setting_flag_is_rejected() {
    let dir = tempdir().unwrap();
    let project = tempdir().unwrap();
    bin()
        .env("MAGEBOX_HOME", dir.path())
        .args(["pool", "generate", "shop"])
        .arg("--path")
        .arg(project.path())
        .args(["--setting", "notakeyvalue"])
        .assert()
        .failure()
        .stderr(contains("KEY=VALUE"));
}
