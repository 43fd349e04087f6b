//! Message encryption: key agreement plus the legacy and current schemes

use secp256k1::ecdh::shared_secret_point;
use zeroize::Zeroize;

use crate::event::{PublicKey, SecretKey};

pub mod codec;
pub(crate) mod nip04;
pub mod nip44;

pub use self::codec::{
    decrypt_with, encrypt_with, CodecError, DirectMessage, DirectMessageOptions,
    EncryptionScheme, MessageCodec,
};

/// Unhashed x-coordinate of the ECDH point; both schemes key off this.
pub(crate) fn shared_x(secret_key: &SecretKey, public_key: &PublicKey) -> [u8; 32] {
    let mut point = shared_secret_point(&public_key.to_even_point(), secret_key.inner());
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    point.zeroize();
    x
}
