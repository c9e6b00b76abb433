use crate::protocol::{ClientId, PublicKey, SymmetricKey};

/// One peer as the client knows it. The keys fill in strictly in order:
/// the public key arrives before a session key may be sent, and a session
/// key must exist before text or files can move either way.
#[derive(Clone)]
pub struct Peer {
    pub id: ClientId,
    pub username: String,
    pub public_key: Option<PublicKey>,
    pub session_key: Option<SymmetricKey>,
}

/// In-memory roster of peers, rebuilt from the relay on demand. The local
/// user is never a member.
#[derive(Default)]
pub struct PeerDirectory {
    peers: Vec<Peer>,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory::default()
    }

    /// Replace the whole roster. Keys already negotiated carry over for ids
    /// present in both the old and the new lists, so a list refresh doesn't
    /// cost an established session.
    pub fn replace_all(&mut self, roster: Vec<(ClientId, String)>) {
        let old = std::mem::take(&mut self.peers);
        self.peers = roster
            .into_iter()
            .map(|(id, username)| {
                let prior = old.iter().find(|peer| peer.id == id);
                Peer {
                    id,
                    username,
                    public_key: prior.and_then(|peer| peer.public_key.clone()),
                    session_key: prior.and_then(|peer| peer.session_key),
                }
            })
            .collect();
    }

    pub fn find_by_username(&self, username: &str) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.username == username)
    }

    pub fn find_by_id(&self, id: &ClientId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id == *id)
    }

    /// Returns false when the id is not in the roster.
    pub fn set_public_key(&mut self, id: &ClientId, key: PublicKey) -> bool {
        match self.peers.iter_mut().find(|peer| peer.id == *id) {
            Some(peer) => {
                peer.public_key = Some(key);
                true
            }
            None => false,
        }
    }

    /// Returns false when the id is not in the roster.
    pub fn set_session_key(&mut self, id: &ClientId, key: SymmetricKey) -> bool {
        match self.peers.iter_mut().find(|peer| peer.id == *id) {
            Some(peer) => {
                peer.session_key = Some(key);
                true
            }
            None => false,
        }
    }

    pub fn sorted_usernames(&self) -> Vec<String> {
        let mut usernames: Vec<String> =
            self.peers.iter().map(|peer| peer.username.clone()).collect();
        usernames.sort();
        usernames
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
