use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MsgKind {
    Ping,
    Pong,
    Announce,
    FindPeers,
    Peers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgPeer {
    pub id: String,
    pub addr: String,
}

/// Flat, human-readable wire record shared by all five message kinds;
/// fields unused by a given `t` are simply absent from the JSON.
/// Packets are single UDP datagrams, capped at 1024 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub t: MsgKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tcp_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dht_peers: Option<Vec<MsgPeer>>,
}

impl Msg {
    pub fn ping(id: [u8; 20]) -> Self {
        Self { t: MsgKind::Ping, id: hex::encode(id), info: None, addr: None, tcp_list: None, dht_peers: None }
    }

    pub fn pong(id: [u8; 20], dht_peers: Vec<MsgPeer>) -> Self {
        Self {
            t: MsgKind::Pong,
            id: hex::encode(id),
            info: None,
            addr: None,
            tcp_list: None,
            dht_peers: Some(dht_peers),
        }
    }

    pub fn announce(id: [u8; 20], info_hash_hex: String, tcp_addr: String) -> Self {
        Self {
            t: MsgKind::Announce,
            id: hex::encode(id),
            info: Some(info_hash_hex),
            addr: Some(tcp_addr),
            tcp_list: None,
            dht_peers: None,
        }
    }

    pub fn find_peers(id: [u8; 20], info_hash_hex: String) -> Self {
        Self {
            t: MsgKind::FindPeers,
            id: hex::encode(id),
            info: Some(info_hash_hex),
            addr: None,
            tcp_list: None,
            dht_peers: None,
        }
    }

    pub fn peers(id: [u8; 20], info_hash_hex: String, tcp_list: Vec<String>) -> Self {
        Self {
            t: MsgKind::Peers,
            id: hex::encode(id),
            info: Some(info_hash_hex),
            addr: None,
            tcp_list: Some(tcp_list),
            dht_peers: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_to_lowercase_or_camel_case() {
        assert_eq!(serde_json::to_string(&MsgKind::FindPeers).unwrap(), "\"findPeers\"");
        assert_eq!(serde_json::to_string(&MsgKind::Ping).unwrap(), "\"ping\"");
    }

    #[test]
    fn announce_roundtrips_through_json() {
        let msg = Msg::announce([3u8; 20], "deadbeef".into(), "1.2.3.4:5".into());
        let encoded = serde_json::to_vec(&msg).unwrap();
        assert!(encoded.len() <= 1024);
        let decoded: Msg = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.t, MsgKind::Announce);
        assert_eq!(decoded.addr.as_deref(), Some("1.2.3.4:5"));
    }

    #[test]
    fn optional_fields_absent_from_ping() {
        let msg = Msg::ping([1u8; 20]);
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("tcp_list"));
        assert!(!encoded.contains("dht_peers"));
    }
}
