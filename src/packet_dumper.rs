//! Raw-traffic capture behind the `capture_packets` config switch. Each
//! buffer lands in its own file under `./captures`, named by transaction
//! leg, peer and id, with a hexdump at debug level alongside.

use crate::utils::hexdump;
use log::{debug, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Which leg of a transaction a buffer was captured on.
#[derive(Clone, Copy, Debug)]
pub enum Leg {
    /// Client to server
    Query,
    /// Server back to the client
    Reply,
    /// An upstream resolver's answer to the forwarder
    Upstream,
}

impl Leg {
    fn tag(&self) -> &'static str {
        match self {
            Leg::Query => "query",
            Leg::Reply => "reply",
            Leg::Upstream => "upstream",
        }
    }
}

/// Write one captured buffer to disk. Capture failures are logged and
/// swallowed; the data path never notices them.
pub async fn capture(bytes: Vec<u8>, leg: Leg, peer: SocketAddr, id: u16) {
    hexdump(&bytes);
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    // v6 addresses carry colons, which some filesystems hate
    let peer_tag = peer.ip().to_string().replace(':', "-");
    let path = PathBuf::from(format!(
        "./captures/{stamp}-{}-{peer_tag}-{id:04x}.bin",
        leg.tag()
    ));

    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent).await {
            warn!("Couldn't create capture directory {parent:?}: {err:?}");
            return;
        }
    }
    match fs::File::create(&path).await {
        Ok(mut fh) => match fh.write_all(&bytes).await {
            Ok(_) => debug!("Captured {} bytes of {} to {path:?}", bytes.len(), leg.tag()),
            Err(err) => warn!("Failed to write capture {path:?}: {err:?}"),
        },
        Err(err) => warn!("Couldn't open capture file {path:?}: {err:?}"),
    }
}
