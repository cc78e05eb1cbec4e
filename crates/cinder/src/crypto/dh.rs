use num_bigint::BigUint;
use rand::Rng;

use crate::error::Error;

/// Length in bytes of public keys and of the shared secret.
pub const KEY_LEN: usize = 96;

const PRIME: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B57\
6625E7EC6F44C42E9A63A36210000000000090563";

fn prime() -> BigUint {
    // the literal is a valid hex number
    BigUint::parse_bytes(PRIME, 16).unwrap_or_default()
}

/// A Diffie-Hellman key pair over the 768 bit group, generator 2.
pub struct KeyPair {
    private: BigUint,
    public: [u8; KEY_LEN],
}

impl KeyPair {
    /// A fresh pair with a random 160 bit private exponent.
    pub fn generate() -> Self {
        let secret: [u8; 20] = rand::thread_rng().gen();
        Self::from_private(&secret)
    }

    pub fn from_private(secret: &[u8]) -> Self {
        let private = BigUint::from_bytes_be(secret);
        let public = BigUint::from(2u32).modpow(&private, &prime());
        Self { private, public: to_fixed(&public) }
    }

    pub fn public(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// `S = remote ^ private mod P`, big endian and left padded to 96 bytes.
    ///
    /// Degenerate remote keys (0, 1, P-1 and anything >= P) are rejected.
    pub fn shared_secret(&self, remote: &[u8]) -> Result<[u8; KEY_LEN], Error> {
        let p = prime();
        let y = BigUint::from_bytes_be(remote);
        let one = BigUint::from(1u32);

        if y <= one || y >= &p - &one {
            return Err(Error::CryptoHandshake("degenerate public key"));
        }

        Ok(to_fixed(&y.modpow(&self.private, &p)))
    }
}

fn to_fixed(n: &BigUint) -> [u8; KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; KEY_LEN];
    out[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}
