use std::env;
use std::fs;
use std::sync::{mpsc, Arc, RwLock};

use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use tracing_subscriber::EnvFilter;

use roadchain::exec::NullBackend;
use roadchain::node::config::NodeSettings;
use roadchain::node::engine::{Node, NodeSnapshot};
use roadchain::node::gossip::Network;
use roadchain::node::http::start_http_server;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config_path: Option<String> = None;
    let mut key_hex: Option<String> = None;
    let mut key_file: Option<String> = None;
    let mut listen_override: Option<String> = None;
    let mut http_override: Option<String> = None;
    let mut data_dir_override: Option<String> = None;
    let mut extra_peers: Vec<String> = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--key-hex" => key_hex = args.next(),
            "--key-file" => key_file = args.next(),
            "--listen" => listen_override = args.next(),
            "--http" => http_override = args.next(),
            "--data-dir" => data_dir_override = args.next(),
            "--peer" => {
                if let Some(peer) = args.next() {
                    extra_peers.push(peer);
                }
            }
            _ => {
                eprintln!("unknown arg {}", arg);
                return;
            }
        }
    }

    let config_path = config_path.expect("missing --config");
    let config_bytes = fs::read_to_string(&config_path).expect("read config");
    let mut settings: NodeSettings =
        serde_json::from_str(&config_bytes).expect("parse config json");
    if let Some(listen) = listen_override {
        settings.listen_addr = listen;
    }
    if let Some(http) = http_override {
        settings.http_addr = http;
    }
    if let Some(dir) = data_dir_override {
        settings.data_dir = Some(dir);
    }
    settings.peers.extend(extra_peers);

    let secret_hex = if let Some(h) = key_hex {
        h
    } else if let Some(path) = key_file {
        fs::read_to_string(path)
            .expect("read key file")
            .trim()
            .to_string()
    } else {
        panic!("missing --key-hex or --key-file");
    };
    let secret_bytes = hex::decode(secret_hex.trim()).expect("bad secret hex");
    if secret_bytes.len() != 32 {
        panic!("secret key must be 32 bytes hex");
    }
    let mut sk = [0u8; 32];
    sk.copy_from_slice(&secret_bytes);
    let secret = SecretKey::from_bytes(&sk).expect("secret key");
    let public: PublicKey = (&secret).into();
    let keypair = Arc::new(Keypair { secret, public });

    let snapshot = Arc::new(RwLock::new(NodeSnapshot::new()));
    let (tx_net, rx_net) = mpsc::channel();
    let (tx_cmd, rx_cmd) = mpsc::channel();

    let net = Network::start(&settings.listen_addr, tx_net).expect("network start");
    net.connect_peers(&settings.peers);

    start_http_server(
        settings.http_addr.clone(),
        Arc::clone(&snapshot),
        tx_cmd.clone(),
    );

    let node = Node::new(
        settings,
        Arc::clone(&keypair),
        Box::new(NullBackend),
        Arc::clone(&snapshot),
        net,
    )
    .expect("node init");

    tracing::info!(address = %node.address(), "node starting");
    node.run(rx_net, rx_cmd);
}
