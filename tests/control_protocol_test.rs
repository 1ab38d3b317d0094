//! Integration tests for the control protocol, in-process and against the
//! built binary's `worker` subcommand.

use std::io::Write;
use std::os::unix::net::UnixStream;

use tempfile::TempDir;
use tsnet_bridge::control::{
    opcode, ControlClient, ProcessSpawner, ThreadSpawner, WorkerSpawner,
};
use tsnet_bridge::{Bridge, BridgeError, Config, LocalNet};

fn process_spawner(config_dir: &TempDir) -> ProcessSpawner {
    ProcessSpawner::new(env!("CARGO_BIN_EXE_tsnet-bridge"))
        .env("TSNET_BRIDGE_CONFIG_DIR", config_dir.path())
        .env("RUST_LOG", "warn")
}

#[test]
fn test_thread_worker_lifecycle() {
    let mut client = ControlClient::spawn(&ThreadSpawner::new(LocalNet::new())).unwrap();

    let a = client.create_server().unwrap();
    let b = client.create_server().unwrap();
    assert_ne!(a, b);

    assert!(client.start_server(a).is_ok());
    assert!(matches!(client.up(b), Err(BridgeError::Fatal(_))));
    let why = client.fetch_error_message(b).unwrap();
    assert!(why.contains("needs login"), "got {why:?}");

    client.close_server(a).unwrap();
    assert!(matches!(client.create_server(), Err(BridgeError::SessionBroken(_))));
}

#[test]
fn test_thread_worker_shares_tailnet_with_consumer() {
    let net = LocalNet::new();
    let local = Bridge::with_runtime(net.clone());

    let spawner = ThreadSpawner::new(net).with_config(Config {
        authkey: Some("tskey-shared".into()),
        hostname: Some("remote".into()),
        ..Config::default()
    });
    let mut client = ControlClient::spawn(&spawner).unwrap();
    let remote = client.create_server().unwrap();
    client.up(remote).unwrap();

    // The remote node took 100.64.0.1; ours comes up second.
    let me = local.new_server();
    local.set_authkey(me, "tskey-local").unwrap();
    local.up(me).unwrap();
    assert_eq!(local.getips(me, 64).unwrap(), "100.64.0.2,fd7a:115c:a1e0::2");

    client.close_server(remote).unwrap();
}

#[test]
fn test_process_worker_lifecycle() {
    let config_dir = TempDir::new().unwrap();
    let mut client = ControlClient::spawn(&process_spawner(&config_dir)).unwrap();

    let server = client.create_server().unwrap();
    let other = client.create_server().unwrap();
    assert_ne!(server, other);

    assert!(client.up(server).is_err());
    assert!(client.fetch_error_message(server).unwrap().contains("needs login"));

    client.close_server(server).unwrap();
    assert!(!client.is_open());
    assert!(matches!(client.start_server(other), Err(BridgeError::SessionBroken(_))));
}

#[test]
fn test_process_worker_uses_config_file() {
    let config_dir = TempDir::new().unwrap();
    Config {
        authkey: Some("tskey-from-file".into()),
        ..Config::default()
    }
    .save_to_dir(config_dir.path())
    .unwrap();

    let mut client = ControlClient::spawn(&process_spawner(&config_dir)).unwrap();
    let server = client.create_server().unwrap();
    client.up(server).unwrap();
    client.close_server(server).unwrap();
}

#[test]
fn test_process_worker_exits_on_unknown_opcode() {
    let config_dir = TempDir::new().unwrap();
    let (mut pipe, worker) = process_spawner(&config_dir).spawn().unwrap();

    pipe.write_all(&[0x42]).unwrap();
    assert!(worker.wait().is_err(), "worker should fail on an unknown opcode");

    // The session is gone: a well-formed request now gets no answer.
    let mut client = ControlClient::new(pipe);
    assert!(matches!(client.create_server(), Err(BridgeError::SessionBroken(_))));
}

#[test]
fn test_worker_exits_when_consumer_hangs_up() {
    let config_dir = TempDir::new().unwrap();
    let (pipe, worker) = process_spawner(&config_dir).spawn().unwrap();
    drop(pipe);
    worker.wait().unwrap();
}

#[test]
fn test_raw_wire_create_and_close() {
    let (ours, worker) = ThreadSpawner::new(LocalNet::new()).spawn().unwrap();
    let mut client = ControlClient::new(ours.try_clone().unwrap());

    let server = client.create_server().unwrap();

    // Bypass the client and speak the frozen wire format directly.
    let mut raw: UnixStream = ours;
    raw.write_all(&[opcode::CLOSE_SERVER]).unwrap();
    raw.write_all(&server.as_raw().to_le_bytes()).unwrap();
    let status = tsnet_bridge::control::protocol::read_status(&mut raw).unwrap();
    assert_eq!(status, 0);
    worker.wait().unwrap();
}
