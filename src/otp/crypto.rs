//! OTP code generation and hashing.
//!
//! Codes are six decimal digits drawn from the OS CSPRNG. Only an Argon2id
//! hash of a code, keyed with a server-side pepper, is ever stored.

use anyhow::{Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use base64ct::{Base64, Encoding};
use rand::{Rng, RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretBox, SecretString};

pub const CODE_LEN: usize = 6;
pub const MIN_PEPPER_LEN: usize = 16;
const CODE_SPACE: u32 = 1_000_000;

/// Draw a fresh six-digit code.
#[must_use]
pub fn generate_code() -> SecretString {
    generate_code_with_rng(&mut OsRng)
}

fn generate_code_with_rng<R: RngCore + ?Sized>(rng: &mut R) -> SecretString {
    let value = rng.gen_range(0..CODE_SPACE);
    SecretString::from(format!("{value:0CODE_LEN$}"))
}

/// Whether `candidate` has the shape of a code. Malformed input is still
/// counted as a failed attempt by the caller.
#[must_use]
pub fn is_well_formed(candidate: &str) -> bool {
    candidate.len() == CODE_LEN && candidate.bytes().all(|b| b.is_ascii_digit())
}

/// Argon2id hasher keyed with the OTP pepper.
pub struct OtpHasher {
    pepper: SecretBox<Vec<u8>>,
}

impl OtpHasher {
    /// # Errors
    /// Returns an error if the pepper is shorter than 16 bytes.
    pub fn new(pepper: Vec<u8>) -> Result<Self> {
        if pepper.len() < MIN_PEPPER_LEN {
            return Err(anyhow!(
                "OTP pepper must be at least {MIN_PEPPER_LEN} bytes"
            ));
        }
        Ok(Self {
            pepper: SecretBox::new(Box::new(pepper)),
        })
    }

    /// Build from the base64 value of `--otp-pepper`.
    ///
    /// # Errors
    /// Returns an error if the value is not base64 or too short.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let pepper = Base64::decode_vec(encoded.trim())
            .map_err(|_| anyhow!("OTP pepper must be valid base64"))?;
        Self::new(pepper)
    }

    fn argon2(&self) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(
            self.pepper.expose_secret(),
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::default(),
        )
        .map_err(|_| anyhow!("failed to initialize Argon2id"))
    }

    /// Hash a code into a PHC string.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn hash(&self, code: &SecretString) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(code.expose_secret().as_bytes(), &salt)
            .map_err(|_| anyhow!("failed to hash OTP code"))?
            .to_string();
        Ok(hash)
    }

    /// Check `candidate` against a stored PHC string.
    ///
    /// # Errors
    /// Returns an error if the stored hash cannot be parsed.
    pub fn verify(&self, candidate: &str, stored_hash: &str) -> Result<bool> {
        let parsed =
            PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid OTP code hash"))?;
        Ok(self
            .argon2()?
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok())
    }
}

impl std::fmt::Debug for OtpHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OtpHasher(***)")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn hasher() -> OtpHasher {
        OtpHasher::new(b"0123456789abcdef-pepper".to_vec()).unwrap()
    }

    #[test]
    fn codes_are_six_digits_with_leading_zeros() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let code = generate_code_with_rng(&mut rng);
            assert!(is_well_formed(code.expose_secret()));
        }
        assert!(is_well_formed(generate_code().expose_secret()));
    }

    #[test]
    fn well_formed_rejects_other_shapes() {
        assert!(is_well_formed("000123"));
        assert!(!is_well_formed("12345"));
        assert!(!is_well_formed("1234567"));
        assert!(!is_well_formed("12a456"));
        assert!(!is_well_formed("١٢٣٤٥٦"));
    }

    #[test]
    fn hash_never_contains_the_code() {
        let code = SecretString::from("482913".to_string());
        let hash = hasher().hash(&code).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("482913"));
        assert!(hasher().verify("482913", &hash).unwrap());
        assert!(!hasher().verify("482914", &hash).unwrap());
    }

    #[test]
    fn pepper_is_part_of_the_hash() {
        let code = SecretString::from("111111".to_string());
        let hash = hasher().hash(&code).unwrap();
        let other = OtpHasher::new(b"another-pepper-of-16+".to_vec()).unwrap();
        assert!(!other.verify("111111", &hash).unwrap());
    }

    #[test]
    fn pepper_must_be_long_enough() {
        assert!(OtpHasher::new(b"short".to_vec()).is_err());
        assert!(OtpHasher::from_base64(&Base64::encode_string(&[9u8; 16])).is_ok());
        assert!(OtpHasher::from_base64("***").is_err());
        assert!(hasher().verify("123456", "not a phc string").is_err());
    }
}
