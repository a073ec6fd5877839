mod clock;
mod hash;
mod ring;

pub use clock::unique_millis;
pub use hash::{fnv1a_64, fnv1a_hex};
pub use ring::Ring;
