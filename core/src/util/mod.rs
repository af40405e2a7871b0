mod bitmap;
pub(crate) mod codec;
mod crypto;

pub use self::bitmap::BitMap;
pub use self::crypto::{RandomInit, Rng, Skcipher};
