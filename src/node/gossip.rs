// Peer gossip over persistent TCP links. One reader/writer thread per peer,
// all inbound messages funneled through a single mpsc channel into the node
// loop; outbound delivery is best-effort and never blocks block production.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Block, BlockHash, Transaction};

const MAX_MESSAGE_BYTES: usize = 8_000_000;

/// Wire messages, JSON with a `type` discriminator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    ChainInfo { height: u64, tip_hash: BlockHash },
    NewTransaction { transaction: Transaction },
    NewBlock { block: Block },
    RequestChain,
    Chain { blocks: Vec<Block> },
}

/// An inbound message tagged with the connection it arrived on, so the node
/// can answer a `request-chain` to that peer alone.
pub struct PeerEvent {
    pub peer: u64,
    pub message: Message,
}

pub struct Network {
    peers: Arc<Mutex<HashMap<u64, mpsc::Sender<Message>>>>,
    next_peer: Arc<AtomicU64>,
    tx_in: mpsc::Sender<PeerEvent>,
    shutdown: Arc<AtomicBool>,
}

impl Network {
    /// Binds the gossip listener and starts the accept loop. Inbound frames
    /// from every peer are delivered on `tx_in`.
    pub fn start(listen_addr: &str, tx_in: mpsc::Sender<PeerEvent>) -> Result<Network, String> {
        let listener = TcpListener::bind(listen_addr).map_err(|e| format!("bind gossip: {}", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("set nonblocking: {}", e))?;

        let peers = Arc::new(Mutex::new(HashMap::new()));
        let next_peer = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let peers_in = Arc::clone(&peers);
        let next_in = Arc::clone(&next_peer);
        let tx_accept = tx_in.clone();
        let shutdown_in = Arc::clone(&shutdown);
        thread::spawn(move || {
            use std::io::ErrorKind;
            loop {
                if shutdown_in.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "inbound peer connection");
                        attach_peer(
                            stream,
                            &peers_in,
                            &next_in,
                            tx_accept.clone(),
                            Arc::clone(&shutdown_in),
                        );
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Network {
            peers,
            next_peer,
            tx_in,
            shutdown,
        })
    }

    /// Dials each address on its own thread, retrying until connected and
    /// redialing whenever the link drops.
    pub fn connect_peers(&self, addrs: &[String]) {
        for addr in addrs {
            let addr = addr.clone();
            let peers = Arc::clone(&self.peers);
            let next_peer = Arc::clone(&self.next_peer);
            let tx_in = self.tx_in.clone();
            let shutdown = Arc::clone(&self.shutdown);
            thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match TcpStream::connect(&addr) {
                    Ok(stream) => {
                        tracing::debug!(%addr, "connected to peer");
                        let peer_id = attach_peer(
                            stream,
                            &peers,
                            &next_peer,
                            tx_in.clone(),
                            Arc::clone(&shutdown),
                        );
                        // Hold until this link is torn down, then dial again.
                        while !shutdown.load(Ordering::Relaxed)
                            && peers.lock().unwrap().contains_key(&peer_id)
                        {
                            thread::sleep(Duration::from_millis(500));
                        }
                    }
                    Err(_) => thread::sleep(Duration::from_millis(500)),
                }
            });
        }
    }

    /// Best-effort fan-out; a dead peer's send failure is ignored.
    pub fn broadcast(&self, msg: Message) {
        let peers = self.peers.lock().unwrap();
        for sender in peers.values() {
            let _ = sender.send(msg.clone());
        }
    }

    /// Best-effort delivery to one peer; false when the peer is gone.
    pub fn send_to(&self, peer: u64, msg: Message) -> bool {
        let peers = self.peers.lock().unwrap();
        match peers.get(&peer) {
            Some(sender) => sender.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.peers.lock().unwrap().clear();
    }
}

fn attach_peer(
    stream: TcpStream,
    peers: &Arc<Mutex<HashMap<u64, mpsc::Sender<Message>>>>,
    next_peer: &Arc<AtomicU64>,
    tx_in: mpsc::Sender<PeerEvent>,
    shutdown: Arc<AtomicBool>,
) -> u64 {
    let peer_id = next_peer.fetch_add(1, Ordering::Relaxed);
    let sender = spawn_peer(stream, peer_id, tx_in, Arc::clone(peers), shutdown);
    peers.lock().unwrap().insert(peer_id, sender);
    peer_id
}

fn spawn_peer(
    mut stream: TcpStream,
    peer_id: u64,
    tx_in: mpsc::Sender<PeerEvent>,
    peers: Arc<Mutex<HashMap<u64, mpsc::Sender<Message>>>>,
    shutdown: Arc<AtomicBool>,
) -> mpsc::Sender<Message> {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    let (tx_out, rx_out) = mpsc::channel::<Message>();
    thread::spawn(move || {
        let mut buf = Vec::new();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            loop {
                match rx_out.try_recv() {
                    Ok(msg) => {
                        if write_message(&mut stream, &msg).is_err() {
                            drop_peer(&peers, peer_id);
                            return;
                        }
                    }
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => break,
                }
            }

            match read_into_buffer(&mut stream, &mut buf) {
                Ok(()) => loop {
                    match try_decode_message(&mut buf) {
                        Ok(Some(message)) => {
                            let _ = tx_in.send(PeerEvent {
                                peer: peer_id,
                                message,
                            });
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(peer = peer_id, %err, "dropping malformed peer");
                            drop_peer(&peers, peer_id);
                            return;
                        }
                    }
                },
                Err(_) => {
                    drop_peer(&peers, peer_id);
                    return;
                }
            }

            thread::sleep(Duration::from_millis(5));
        }
    });
    tx_out
}

fn drop_peer(peers: &Arc<Mutex<HashMap<u64, mpsc::Sender<Message>>>>, peer_id: u64) {
    peers.lock().unwrap().remove(&peer_id);
    tracing::debug!(peer = peer_id, "peer disconnected");
}

fn read_into_buffer(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), String> {
    let mut tmp = [0u8; 4096];
    match stream.read(&mut tmp) {
        Ok(0) => Err("connection closed".into()),
        Ok(n) => {
            buf.extend_from_slice(&tmp[..n]);
            Ok(())
        }
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Ok(())
        }
        Err(err) => Err(format!("{}", err)),
    }
}

/// Frames are a 4-byte LE length prefix followed by the JSON body.
fn try_decode_message(buf: &mut Vec<u8>) -> Result<Option<Message>, String> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_MESSAGE_BYTES {
        return Err("invalid message length".into());
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let data = buf[4..4 + len].to_vec();
    buf.drain(0..4 + len);
    let msg = serde_json::from_slice(&data).map_err(|e| format!("{}", e))?;
    Ok(Some(msg))
}

fn write_message<W: Write>(stream: &mut W, msg: &Message) -> Result<(), String> {
    let data = serde_json::to_vec(msg).map_err(|e| format!("{}", e))?;
    let len = data.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .map_err(|e| format!("{}", e))?;
    stream.write_all(&data).map_err(|e| format!("{}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_type_discriminator_is_kebab_case() {
        let json = serde_json::to_string(&Message::RequestChain).expect("encode");
        assert_eq!(json, r#"{"type":"request-chain"}"#);

        let info = serde_json::to_string(&Message::ChainInfo {
            height: 3,
            tip_hash: "ab".to_string(),
        })
        .expect("encode");
        assert!(info.contains(r#""type":"chain-info""#));

        let decoded: Message =
            serde_json::from_str(r#"{"type":"chain-info","height":3,"tip_hash":"ab"}"#)
                .expect("decode");
        assert!(matches!(decoded, Message::ChainInfo { height: 3, .. }));
    }

    #[test]
    fn framing_round_trip_and_partial_reads() {
        let msg = Message::ChainInfo {
            height: 9,
            tip_hash: "cd".to_string(),
        };
        let mut framed = Vec::new();
        write_message(&mut framed, &msg).expect("write");

        // Partial prefix decodes to nothing.
        let mut partial = framed[..3].to_vec();
        assert!(try_decode_message(&mut partial).expect("decode").is_none());

        let mut buf = framed.clone();
        let decoded = try_decode_message(&mut buf).expect("decode").expect("some");
        assert!(matches!(decoded, Message::ChainInfo { height: 9, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn dialer_redials_after_the_link_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();

        // Accept, sever the first link immediately, then wait for the redial.
        let (accepted_tx, accepted_rx) = mpsc::channel();
        thread::spawn(move || {
            let (first, _) = listener.accept().expect("first dial");
            drop(first);
            let (_second, _) = listener.accept().expect("second dial");
            let _ = accepted_tx.send(());
        });

        let (tx_in, _rx_in) = mpsc::channel();
        let net = Network::start("127.0.0.1:0", tx_in).expect("start");
        net.connect_peers(&[addr]);

        accepted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no redial after the peer dropped");
        net.shutdown();
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut buf = ((MAX_MESSAGE_BYTES + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(try_decode_message(&mut buf).is_err());
    }
}
