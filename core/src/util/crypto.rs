use crate::prelude::Result;

/// Random initialization for Key, Iv and Mac.
pub trait RandomInit: Default {
    fn random() -> Self;
}

/// Random Number Generator.
pub trait Rng {
    /// Create an instance, with `seed` to provide secure entropy.
    fn new(seed: &[u8]) -> Self;

    /// Fill `dest` with random bytes.
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()>;
}

/// Symmetric key cipher.
pub trait Skcipher {
    type Key;
    type Iv;

    /// Encrypt plain text with key and iv.
    ///
    /// On success, the output buffer holds the cipher text, whose length
    /// equals that of the input.
    fn encrypt(&self, input: &[u8], key: &Self::Key, iv: &Self::Iv, output: &mut [u8])
        -> Result<()>;

    /// Decrypt cipher text with key and iv.
    fn decrypt(&self, input: &[u8], key: &Self::Key, iv: &Self::Iv, output: &mut [u8])
        -> Result<()>;
}
