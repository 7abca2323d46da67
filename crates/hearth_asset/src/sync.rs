//! Client synchronization packets for indexed asset tables.
//!
//! A server that assigned index `i` to key `k` never re-binds `i` while
//! any client session lives; the registry's reload rules uphold that, so
//! these packets can carry bare indices.

use hearth_protocol::packets::{AssetEntry, AssetInitPacket, AssetRemovePacket, AssetUpsertPacket};
use hearth_protocol::Encode;

use crate::registry::{Asset, AssetDiff, AssetRegistry};

/// Full contents of `T`'s table, for a joining client.
pub fn init_packet<T: Asset + Encode>(registry: &AssetRegistry) -> anyhow::Result<AssetInitPacket> {
    let table = registry
        .table::<T>()
        .ok_or_else(|| anyhow::anyhow!("asset kind '{}' is not registered", T::KIND))?;

    let mut entries = Vec::with_capacity(table.len());
    for (key, index, asset) in table.iter() {
        entries.push(encode_entry(key.as_str(), index, asset)?);
    }

    Ok(AssetInitPacket {
        kind: T::KIND.to_owned(),
        entries,
    })
}

/// The changed subset after a hot reload.
pub fn upsert_packet<T: Asset + Encode>(
    registry: &AssetRegistry,
    diff: &AssetDiff,
) -> anyhow::Result<AssetUpsertPacket> {
    let mut entries = Vec::with_capacity(diff.upserted.len());
    for (key, index) in &diff.upserted {
        let asset = registry
            .by_index::<T>(*index)
            .ok_or_else(|| anyhow::anyhow!("index {index} missing after reload"))?;
        entries.push(encode_entry(key.as_str(), *index, asset)?);
    }

    Ok(AssetUpsertPacket {
        kind: T::KIND.to_owned(),
        entries,
    })
}

/// Keys dropped by a hot reload.
pub fn remove_packet<T: Asset>(diff: &AssetDiff) -> AssetRemovePacket {
    AssetRemovePacket {
        kind: T::KIND.to_owned(),
        keys: diff.removed.iter().map(|key| key.to_string()).collect(),
    }
}

fn encode_entry(key: &str, index: u32, asset: &impl Encode) -> anyhow::Result<AssetEntry> {
    let mut payload = Vec::new();
    asset.encode(&mut payload)?;

    Ok(AssetEntry {
        key: key.to_owned(),
        index,
        payload,
    })
}
