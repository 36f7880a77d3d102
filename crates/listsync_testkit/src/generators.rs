//! Property-based test generators using proptest.

use listsync_core::{Document, EntityKey, IndexChange};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;

/// Strategy for ids drawn from an open space.
pub fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}"
}

/// Strategy for entity keys over two entity types.
pub fn entity_key_strategy() -> impl Strategy<Value = EntityKey> {
    (prop_oneof![Just("listing"), Just("user")], id_strategy())
        .prop_map(|(entity_type, id)| EntityKey::new(entity_type, id))
}

/// Strategy for listing documents.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    ("[A-Za-z ]{0,24}", any::<u32>(), any::<bool>()).prop_map(|(title, price, active)| {
        json!({
            "title": title,
            "price": price,
            "active": active,
        })
    })
}

/// Strategy for changes over a handful of listing keys, so sequences
/// revisit keys often.
pub fn change_strategy() -> impl Strategy<Value = IndexChange> {
    let key = (0u8..5).prop_map(|n| EntityKey::new("listing", format!("k{n}")));
    (key, prop::option::weighted(0.8, document_strategy())).prop_map(|(key, document)| {
        match document {
            Some(document) => IndexChange::upsert(key, document),
            None => IndexChange::delete(key),
        }
    })
}

/// Strategy for sequences of changes.
pub fn change_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<IndexChange>> {
    prop::collection::vec(change_strategy(), 0..=max_len)
}

/// Strategy for id sets.
pub fn id_set_strategy(max_len: usize) -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(id_strategy(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_keys_are_well_formed(key in entity_key_strategy()) {
            prop_assert!(key.entity_type == "listing" || key.entity_type == "user");
            prop_assert!(!key.id.is_empty() && key.id.len() <= 8);
        }

        #[test]
        fn upserts_carry_payloads(change in change_strategy()) {
            match change.kind {
                listsync_core::ChangeKind::Upsert => prop_assert!(change.payload.is_some()),
                listsync_core::ChangeKind::Delete => prop_assert!(change.payload.is_none()),
            }
        }
    }
}
