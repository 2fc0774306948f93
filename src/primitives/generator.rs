//! Generators produce the random identifiers used throughout the engine: request ids, token
//! ids and opaque handles.
use base64::encode_config;
use rand::{rngs::OsRng, RngCore};

/// Generates identifiers from random bytes.
///
/// Each generated identifier is an url-safe base64 encoding of the specified number of bytes
/// taken from the operating system random number generator, making guessing infeasible.
pub struct RandomGenerator {
    /// The amount of bytes to generate.
    len: usize,
}

impl RandomGenerator {
    /// Generate identifiers with a specific number of bytes of randomness.
    pub fn new(length: usize) -> RandomGenerator {
        RandomGenerator { len: length }
    }

    /// Produce one fresh identifier.
    pub fn generate(&self) -> String {
        let mut result = vec![0; self.len];
        OsRng.fill_bytes(result.as_mut_slice());
        encode_config(result, base64::URL_SAFE_NO_PAD)
    }
}

/// A fresh identifier with the default 16 bytes of randomness.
pub fn random_id() -> String {
    RandomGenerator::new(16).generate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_url_safe() {
        let generator = RandomGenerator::new(16);
        let one = generator.generate();
        let two = generator.generate();
        assert_ne!(one, two);
        assert!(!one.contains('+'));
        assert!(!one.contains('/'));
        assert!(!one.contains('='));
    }
}
