use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::RwLock;

const SECRET_SIZE: usize = 16;

/// 16-byte opaque tenant identifier. Doubles as the authentication token
/// and the routing key on the relay. Compared byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionSecret([u8; SECRET_SIZE]);

impl ConnectionSecret {
    pub const SIZE: usize = SECRET_SIZE;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Decode a base64-encoded secret as given on the command line.
    pub fn from_base64(s: &str) -> anyhow::Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| anyhow::anyhow!("failed to decode connection secret: {}", e))?;
        if bytes.len() != Self::SIZE {
            anyhow::bail!(
                "invalid connection secret length: {}, must be {}",
                bytes.len(),
                Self::SIZE
            );
        }
        let mut secret = [0u8; Self::SIZE];
        secret.copy_from_slice(&bytes);
        Ok(Self(secret))
    }
}

// Log lines carry only a short fingerprint, never the full secret.
impl fmt::Debug for ConnectionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}..",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Parse one `base64secret:port` entry of the relay's `--conf` flag.
pub fn parse_conf_entry(value: &str) -> anyhow::Result<(ConnectionSecret, u16)> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 {
        anyhow::bail!("invalid secret port entry: {:?}", value);
    }

    let secret = ConnectionSecret::from_base64(parts[0])?;
    let port = parts[1]
        .parse::<u16>()
        .map_err(|e| anyhow::anyhow!("invalid port {:?}: {}", parts[1], e))?;

    Ok((secret, port))
}

/// Secret to public-port mapping. Populated at startup, read-mostly after;
/// writes stay serialized behind the lock.
pub struct SecretPortMap {
    map: RwLock<HashMap<ConnectionSecret, u16>>,
}

impl SecretPortMap {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, secret: &ConnectionSecret) -> Option<u16> {
        self.map.read().await.get(secret).copied()
    }

    pub async fn set(&self, secret: ConnectionSecret, port: u16) {
        self.map.write().await.insert(secret, port);
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }
}

impl Default for SecretPortMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let encoded = BASE64.encode([0xABu8; 16]);
        let secret = ConnectionSecret::from_base64(&encoded).unwrap();
        assert_eq!(secret.as_bytes(), &[0xABu8; 16]);
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(ConnectionSecret::from_base64("not/valid/base64!!!").is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        let short = BASE64.encode([1u8; 8]);
        assert!(ConnectionSecret::from_base64(&short).is_err());
        let long = BASE64.encode([1u8; 24]);
        assert!(ConnectionSecret::from_base64(&long).is_err());
    }

    #[test]
    fn conf_entry_parses() {
        let encoded = BASE64.encode([3u8; 16]);
        let (secret, port) = parse_conf_entry(&format!("{}:18080", encoded)).unwrap();
        assert_eq!(secret.as_bytes(), &[3u8; 16]);
        assert_eq!(port, 18080);
    }

    #[test]
    fn conf_entry_rejects_malformed() {
        let encoded = BASE64.encode([3u8; 16]);
        assert!(parse_conf_entry("no-colon-here").is_err());
        assert!(parse_conf_entry(&format!("{}:18080:extra", encoded)).is_err());
        assert!(parse_conf_entry(&format!("{}:70000", encoded)).is_err());
        assert!(parse_conf_entry(&format!("{}:port", encoded)).is_err());
        assert!(parse_conf_entry("bad base64:1000").is_err());
    }

    #[test]
    fn debug_does_not_leak_full_secret() {
        let secret = ConnectionSecret::from_bytes([0xEFu8; 16]);
        let printed = format!("{:?}", secret);
        assert_eq!(printed, "efefefef..");
    }

    #[tokio::test]
    async fn secret_port_map_lookup() {
        let map = SecretPortMap::new();
        let s1 = ConnectionSecret::from_bytes([1u8; 16]);
        let s2 = ConnectionSecret::from_bytes([2u8; 16]);

        map.set(s1, 18080).await;
        assert_eq!(map.get(&s1).await, Some(18080));
        assert_eq!(map.get(&s2).await, None);
        assert_eq!(map.len().await, 1);
    }
}
