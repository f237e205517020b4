use futures::{SinkExt, StreamExt};
use hkdf::Hkdf;
use log::{debug, trace};
use rand::rngs::OsRng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::ProtocolError;

use super::{
    cipher::KEY_LEN,
    proto::{Packet, PROTOCOL_VERSION},
    transport::{enable_encryption, Connection},
};

const KDF_INFO: &[u8] = b"tileworld stream key v1";
pub const MAX_NAME_LEN: usize = 32;

/// Identity a viewer presented during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub uuid: Uuid,
    pub name: String,
    pub encrypted: bool,
}

/// What the viewer learned about the authority.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHello {
    pub offline: bool,
    pub encrypted: bool,
}

pub fn derive_key(secret: EphemeralSecret, their_public: [u8; 32]) -> Result<Vec<u8>, ProtocolError> {
    let shared = secret.diffie_hellman(&PublicKey::from(their_public));
    if !shared.was_contributory() {
        return Err(ProtocolError::Malformed("low-order public key"));
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = vec![0u8; KEY_LEN];
    hk.expand(KDF_INFO, &mut key)
        .map_err(|_| ProtocolError::Malformed("key derivation failed"))?;
    Ok(key)
}

async fn next_packet<S>(conn: &mut Connection<S>) -> Result<Packet, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match conn.next().await {
        Some(Ok(Packet::Disconnect { reason })) => Err(ProtocolError::Disconnected(reason)),
        Some(Ok(packet)) => {
            trace!("Handshake received {}", packet.name());
            Ok(packet)
        }
        Some(Err(e)) => Err(e),
        None => Err(ProtocolError::Disconnected("closed during handshake".to_string())),
    }
}

/// Authority side. Returns the connection, encrypted if `encrypt` and the
/// viewer authenticated in offline mode, and the viewer's identity.
pub async fn accept<S>(
    mut conn: Connection<S>,
    offline: bool,
    encrypt: bool,
) -> Result<(Connection<S>, Identity), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match next_packet(&mut conn).await? {
        Packet::ClientRequest { protocol_version } if protocol_version == PROTOCOL_VERSION => {}
        Packet::ClientRequest { protocol_version } => {
            conn.send(Packet::disconnect(format!(
                "unsupported protocol version {}",
                protocol_version
            )))
            .await?;
            return Err(ProtocolError::VersionMismatch {
                got: protocol_version,
                expected: PROTOCOL_VERSION,
            });
        }
        other => return Err(ProtocolError::UnexpectedPacket(other.name())),
    }

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public_key = PublicKey::from(&secret).to_bytes();
    conn.send(Packet::ServerInfo {
        offline,
        public_key,
    })
    .await?;

    let mut encrypted = false;
    if offline {
        let their_public = match next_packet(&mut conn).await? {
            Packet::BasicAuth { public_key } => <[u8; 32]>::try_from(public_key.as_slice())
                .map_err(|_| ProtocolError::Malformed("public key must be 32 bytes"))?,
            other => return Err(ProtocolError::UnexpectedPacket(other.name())),
        };
        if encrypt {
            let key = derive_key(secret, their_public)?;
            conn = enable_encryption(conn, &key);
            encrypted = true;
            debug!("Stream encryption enabled");
        }
    }

    let (uuid, name) = match next_packet(&mut conn).await? {
        Packet::PlayerInfo { uuid, name } => (uuid, name),
        other => return Err(ProtocolError::UnexpectedPacket(other.name())),
    };
    let name = name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        conn.send(Packet::disconnect("invalid player name")).await?;
        return Err(ProtocolError::Malformed("invalid player name"));
    }

    Ok((
        conn,
        Identity {
            uuid,
            name,
            encrypted,
        },
    ))
}

/// Viewer side of the handshake.
pub async fn connect<S>(
    mut conn: Connection<S>,
    uuid: Uuid,
    name: &str,
    encrypt: bool,
) -> Result<(Connection<S>, ServerHello), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(Packet::ClientRequest {
        protocol_version: PROTOCOL_VERSION,
    })
    .await?;

    let (offline, server_public) = match next_packet(&mut conn).await? {
        Packet::ServerInfo {
            offline,
            public_key,
        } => (offline, public_key),
        other => return Err(ProtocolError::UnexpectedPacket(other.name())),
    };

    let mut encrypted = false;
    if offline {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        conn.send(Packet::BasicAuth {
            public_key: PublicKey::from(&secret).to_bytes().to_vec(),
        })
        .await?;
        if encrypt {
            let key = derive_key(secret, server_public)?;
            conn = enable_encryption(conn, &key);
            encrypted = true;
        }
    }

    conn.send(Packet::PlayerInfo {
        uuid,
        name: name.to_string(),
    })
    .await?;

    Ok((conn, ServerHello { offline, encrypted }))
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::net::framed;

    type Duplex = Connection<tokio::io::DuplexStream>;

    async fn run(offline: bool, encrypt: bool) -> (Duplex, Duplex, Identity, ServerHello) {
        let (a, b) = duplex(1024);
        let server = tokio::spawn(accept(framed(a), offline, encrypt));
        let (client, hello) = connect(framed(b), Uuid::from_u128(5), "viewer", encrypt)
            .await
            .unwrap();
        let (server, identity) = server.await.unwrap().unwrap();
        (server, client, identity, hello)
    }

    #[tokio::test]
    async fn encrypted_handshake_then_traffic() {
        let (mut server, mut client, identity, hello) = run(true, true).await;
        assert_eq!(identity.uuid, Uuid::from_u128(5));
        assert_eq!(identity.name, "viewer");
        assert!(identity.encrypted);
        assert!(hello.encrypted && hello.offline);
        assert!(server.get_ref().is_encrypted());

        server.send(Packet::PlayerPosition { x: 1.0, y: 2.0 }).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Packet::PlayerPosition { x: 1.0, y: 2.0 }
        );
        client.send(Packet::Ping).await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), Packet::Ping);
    }

    #[tokio::test]
    async fn loopback_skips_encryption() {
        let (server, _client, identity, hello) = run(true, false).await;
        assert!(!identity.encrypted);
        assert!(!hello.encrypted);
        assert!(!server.get_ref().is_encrypted());
    }

    #[tokio::test]
    async fn online_mode_has_no_basic_auth() {
        let (_server, _client, identity, hello) = run(false, true).await;
        assert!(!hello.offline);
        assert!(!identity.encrypted);
    }

    #[tokio::test]
    async fn wrong_version_is_refused() {
        let (a, b) = duplex(1024);
        let server = tokio::spawn(accept(framed(a), true, false));
        let mut client = framed(b);
        client
            .send(Packet::ClientRequest {
                protocol_version: PROTOCOL_VERSION + 1,
            })
            .await
            .unwrap();
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Packet::Disconnect { .. }
        ));
        assert!(matches!(
            server.await.unwrap(),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let a = EphemeralSecret::random_from_rng(OsRng);
        let b = EphemeralSecret::random_from_rng(OsRng);
        let a_pub = PublicKey::from(&a).to_bytes();
        let b_pub = PublicKey::from(&b).to_bytes();
        let ka = derive_key(a, b_pub).unwrap();
        let kb = derive_key(b, a_pub).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.len(), KEY_LEN);
    }
}
