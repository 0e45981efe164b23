//! The action sub-protocol.
//!
//! In-game occurrences (discards, calls, round ends) travel inside a single
//! Notify kind, [`ActionPrototype`], whose `data` is XOR-obfuscated with a
//! keystream that depends only on the byte position and the payload
//! length:
//!
//! ```text
//! out[i] = in[i] ^ (((23 ^ n) + 5 * i + KEY[i % 9]) mod 256)
//! ```
//!
//! Applying the keystream twice gives back the input, so the same function
//! both obfuscates and deobfuscates. It is anti-scraping, not encryption.

use crate::{ActionPrototype, Catalog, Decoded, ProtocolError};

/// The fixed 9-byte keystream table.
pub const ACTION_KEY: [u8; 9] =
    [0x84, 0x5e, 0x4e, 0x42, 0x39, 0xa2, 0x1f, 0x60, 0x1c];

/// XORs `buf` with the action keystream in place.
pub fn apply_keystream(buf: &mut [u8]) {
    let seed = 23 ^ buf.len();
    for (i, byte) in buf.iter_mut().enumerate() {
        let k = seed
            .wrapping_add(i.wrapping_mul(5))
            .wrapping_add(usize::from(ACTION_KEY[i % ACTION_KEY.len()]));
        // Truncation is the mod 256.
        *byte ^= k as u8;
    }
}

/// Returns the plain bytes of an obfuscated action payload.
pub fn deobfuscate(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_keystream(&mut out);
    out
}

/// Returns the obfuscated form of a plain action payload.
///
/// The keystream is an involution, so this is [`deobfuscate`] by another
/// name; it exists so test fixtures read in the right direction.
pub fn obfuscate(data: &[u8]) -> Vec<u8> {
    deobfuscate(data)
}

/// A decoded in-game action.
#[derive(Debug, Clone)]
pub struct ActionEvent {
    /// Position of the action within the round, copied from the prototype.
    pub step: u32,
    /// The action message, decoded from the action catalog.
    pub action: Decoded,
}

impl ActionEvent {
    /// Action schema name.
    pub fn name(&self) -> &str {
        self.action.name()
    }

    /// Borrows the action as `T`, if that is its concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.action.downcast_ref::<T>()
    }
}

/// Deobfuscates a prototype's payload and decodes it against `catalog`.
///
/// # Errors
/// - [`ProtocolError::UnknownSchema`] if the action name is not in `catalog`
/// - [`ProtocolError::Decode`] if the plain bytes do not parse
pub fn decode_action(
    prototype: &ActionPrototype,
    catalog: &Catalog,
) -> Result<ActionEvent, ProtocolError> {
    let plain = deobfuscate(&prototype.data);
    let action = catalog.decode(&prototype.name, &plain)?;
    Ok(ActionEvent {
        step: prototype.step,
        action,
    })
}
