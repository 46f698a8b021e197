//! Initial password generation for provisioned accounts.

use chrono::{Datelike, Utc};
use rand::rngs::{OsRng, StdRng};
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use tracing::warn;

const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"@#$%&*!?";

/// Generated password length.
pub const PASSWORD_LENGTH: usize = 12;

/// A generated initial password.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedPassword {
    /// The password.
    pub value: String,
    /// False when the pattern-based fallback was used.
    pub secure: bool,
}

impl std::fmt::Debug for GeneratedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedPassword")
            .field("value", &"<redacted>")
            .field("secure", &self.secure)
            .finish()
    }
}

/// Generates a password from the operating system's secure RNG.
#[must_use]
pub fn generate_password(phone: &str) -> GeneratedPassword {
    generate_password_with(&mut OsRng, phone)
}

/// Generates a password seeded from `rng`, falling back to a phone-derived
/// pattern only when the RNG reports a failure.
pub fn generate_password_with<R: RngCore + ?Sized>(rng: &mut R, phone: &str) -> GeneratedPassword {
    let mut seed = [0u8; 32];
    match rng.try_fill_bytes(&mut seed) {
        Ok(()) => GeneratedPassword {
            value: random_password(&mut StdRng::from_seed(seed)),
            secure: true,
        },
        Err(err) => {
            warn!(error = %err, "secure password generation failed, using fallback pattern");
            GeneratedPassword {
                value: fallback_password(phone),
                secure: false,
            }
        }
    }
}

/// One character from each class, the rest from the full alphabet, then
/// shuffled. Every pick is uniform over its set.
fn random_password<R: RngCore>(rng: &mut R) -> String {
    let all: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS].concat();
    let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS]
        .iter()
        .filter_map(|set| set.choose(&mut *rng).copied())
        .collect();
    let remaining = PASSWORD_LENGTH - chars.len();
    chars.extend((0..remaining).filter_map(|_| all.choose(&mut *rng).copied()));
    chars.shuffle(rng);
    chars.into_iter().map(char::from).collect()
}

fn fallback_password(phone: &str) -> String {
    let tail: String = phone
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("Farm@{tail}#{:03}", Utc::now().ordinal())
}
