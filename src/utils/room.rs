//! Room id generation for the demo binary.
//!
//! Rooms are addressed by an opaque 7-character id of 36-ary digits
//! (≈36 bits); collisions are rare enough that resolution is left to the
//! relay operator.

use rand::Rng;

use crate::core::config::ROOM_ID_LEN;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a random room id.
pub fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_shape() {
        for _ in 0..100 {
            let id = generate_room_id();
            assert_eq!(id.len(), ROOM_ID_LEN);
            assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn room_ids_are_random() {
        let a = generate_room_id();
        let b = generate_room_id();
        // 36^-7 collision odds; equality here means a broken RNG.
        assert_ne!(a, b);
    }
}
