#![allow(dead_code)]

use tempfile::TempDir;
use toolgate::config::Config;
use toolgate::gateway::Gateway;

/// Build a gateway rooted in a fresh temp directory, with the given secrets
/// file contents. `mutate` can adjust the config (policies, TTLs) before
/// wiring.
pub fn test_gateway(secrets: &str, mutate: impl FnOnce(&mut Config)) -> (TempDir, Gateway) {
    let tmp = TempDir::new().expect("create temp dir");
    std::fs::write(tmp.path().join("secrets.env"), secrets).expect("write secrets file");

    let mut config = Config::default();
    config.workspace.root = tmp.path().join("ws");
    config.database.path = tmp.path().join("gate.sqlite3");
    config.secrets.file = tmp.path().join("secrets.env");
    mutate(&mut config);

    let gateway = Gateway::new(&config).expect("build gateway");
    (tmp, gateway)
}
