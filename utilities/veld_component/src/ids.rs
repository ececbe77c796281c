//! Identifier types and the compile-time hash producing them.
//!
//! Every component class, interface and event type in the runtime is
//! identified by a 64-bit value hashed at compile time from a UUID string.
//! All identity comparisons at runtime are plain integer comparisons; no
//! string is inspected on a hot path.

/// Unique identifier of a concrete component class.
pub type ClassId = u64;

/// Unique identifier of an interface type.
pub type InterfaceId = ClassId;

/// Unique identifier of an event type.
pub type EventId = ClassId;

/// The reserved invalid identifier.
///
/// No UUID string hashes to this value; it marks "no id".
pub const INVALID_ID: u64 = 0;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashes a UUID string into a 64-bit identifier at compile time.
///
/// FNV-1a over the UTF-8 bytes of `uuid`. An empty string maps to
/// [`INVALID_ID`]. Use a fresh UUID per type to keep collisions out of
/// practical reach.
pub const fn hash_id(uuid: &str) -> u64 {
    let bytes = uuid.as_bytes();
    if bytes.is_empty() {
        return INVALID_ID;
    }

    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Hashes a UUID string into a [`ClassId`].
pub const fn class_id(uuid: &str) -> ClassId {
    hash_id(uuid)
}

/// Hashes a UUID string into an [`InterfaceId`].
pub const fn interface_id(uuid: &str) -> InterfaceId {
    hash_id(uuid)
}

/// Hashes a UUID string into an [`EventId`].
pub const fn event_id(uuid: &str) -> EventId {
    hash_id(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_fnv1a_vectors() {
        // Reference vectors for 64-bit FNV-1a.
        assert_eq!(hash_id("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(hash_id("foobar"), 0x85dd_35c8_b3d1_4484);
    }

    #[test]
    fn empty_is_invalid() {
        assert_eq!(hash_id(""), INVALID_ID);
    }

    #[test]
    fn usable_in_const_context() {
        const ID: ClassId = class_id("veld-test-const-id");
        assert_ne!(ID, INVALID_ID);
    }

    #[test]
    fn distinct_inputs_distinct_ids() {
        assert_ne!(
            class_id("veld-test-id-one"),
            class_id("veld-test-id-two")
        );
    }
}
