use ethers::types::H256;
use ethers::utils::keccak256;

use crate::error::{SyncError, SyncResult};
use crate::metadata::{StorageEntrySchema, StorageHasher, StorageKeySpec, StoragePath};

/// Raw (unhashed) bytes of one map key part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPart(pub Vec<u8>);

impl From<H256> for KeyPart {
    fn from(value: H256) -> Self {
        KeyPart(value.as_bytes().to_vec())
    }
}

impl From<&H256> for KeyPart {
    fn from(value: &H256) -> Self {
        KeyPart(value.as_bytes().to_vec())
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart(value.to_le_bytes().to_vec())
    }
}

impl KeyPart {
    pub fn as_h256(&self) -> SyncResult<H256> {
        if self.0.len() != 32 {
            return Err(SyncError::decode(
                "key part",
                format!("expected 32 bytes, got {}", self.0.len()),
            ));
        }
        Ok(H256::from_slice(&self.0))
    }
}

/// Fully or partially built storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(pub Vec<u8>);

impl StorageKey {
    /// `keccak256(pallet)[..16] ++ keccak256(item)[..16]`.
    pub fn for_item(path: &StoragePath) -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(&keccak256(path.pallet.as_bytes())[..16]);
        bytes.extend_from_slice(&keccak256(path.item.as_bytes())[..16]);
        StorageKey(bytes)
    }

    /// Item prefix followed by `parts` hashed per the schema. `parts` may be a prefix
    /// of the declared key list, producing a key suitable for prefix scans.
    pub fn build(
        path: &StoragePath,
        schema: &StorageEntrySchema,
        parts: &[KeyPart],
    ) -> SyncResult<Self> {
        if parts.len() > schema.keys.len() {
            return Err(SyncError::Unexpected(format!(
                "{}.{} takes {} key parts, got {}",
                path.pallet,
                path.item,
                schema.keys.len(),
                parts.len()
            )));
        }

        let mut key = Self::for_item(path);
        for (part, spec) in parts.iter().zip(&schema.keys) {
            if part.0.len() != spec.len {
                return Err(SyncError::Unexpected(format!(
                    "{}.{} key part expects {} bytes, got {}",
                    path.pallet,
                    path.item,
                    spec.len,
                    part.0.len()
                )));
            }
            hash_part(spec, &part.0, &mut key.0);
        }
        Ok(key)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }

    pub fn from_hex(s: &str) -> SyncResult<Self> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(trimmed)
            .map(StorageKey)
            .map_err(|e| SyncError::decode("storage key", e))
    }

    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Recovers the raw map key parts from a full key. Only parts hashed with a
    /// transparent hasher can be recovered; all hashers in use are transparent.
    pub fn map_key_parts(&self, schema: &StorageEntrySchema) -> SyncResult<Vec<KeyPart>> {
        let mut cursor = 32usize;
        let mut parts = Vec::with_capacity(schema.keys.len());

        for spec in &schema.keys {
            let start = cursor + spec.hasher.prefix_len();
            let end = start + spec.len;
            if end > self.0.len() {
                return Err(SyncError::decode(
                    "storage key",
                    format!("key of {} bytes is shorter than its schema", self.0.len()),
                ));
            }
            parts.push(KeyPart(self.0[start..end].to_vec()));
            cursor = end;
        }

        if cursor != self.0.len() {
            return Err(SyncError::decode(
                "storage key",
                format!("{} trailing bytes", self.0.len() - cursor),
            ));
        }
        Ok(parts)
    }
}

fn hash_part(spec: &StorageKeySpec, raw: &[u8], out: &mut Vec<u8>) {
    match spec.hasher {
        StorageHasher::Identity => out.extend_from_slice(raw),
        StorageHasher::Keccak128Concat => {
            out.extend_from_slice(&keccak256(raw)[..16]);
            out.extend_from_slice(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{RuntimeSchema, DEX_INFOS, POOL_RESERVES};

    #[test]
    fn map_key_parts_recovers_raw_parts() {
        let schema = RuntimeSchema::pool_xyk();
        let entry = schema.entry(&POOL_RESERVES).unwrap();
        let base = H256::repeat_byte(0x11);
        let target = H256::repeat_byte(0x22);

        let key = StorageKey::build(&POOL_RESERVES, entry, &[base.into(), target.into()]).unwrap();
        assert_eq!(key.0.len(), 32 + 2 * (16 + 32));

        let parts = key.map_key_parts(entry).unwrap();
        assert_eq!(parts[0].as_h256().unwrap(), base);
        assert_eq!(parts[1].as_h256().unwrap(), target);
    }

    #[test]
    fn prefix_key_is_a_prefix_of_full_key() {
        let schema = RuntimeSchema::pool_xyk();
        let entry = schema.entry(&POOL_RESERVES).unwrap();
        let base = H256::repeat_byte(0x11);

        let prefix = StorageKey::build(&POOL_RESERVES, entry, &[base.into()]).unwrap();
        let full = StorageKey::build(
            &POOL_RESERVES,
            entry,
            &[base.into(), H256::repeat_byte(0x33).into()],
        )
        .unwrap();
        assert!(full.starts_with(&prefix));
        assert!(prefix.map_key_parts(entry).is_err());
    }

    #[test]
    fn identity_hasher_keeps_u32_little_endian() {
        let schema = RuntimeSchema::pool_xyk();
        let entry = schema.entry(&DEX_INFOS).unwrap();
        let key = StorageKey::build(&DEX_INFOS, entry, &[7u32.into()]).unwrap();
        assert_eq!(&key.0[32..], &[7, 0, 0, 0]);
        assert_eq!(StorageKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn rejects_wrong_part_width() {
        let schema = RuntimeSchema::pool_xyk();
        let entry = schema.entry(&DEX_INFOS).unwrap();
        let result = StorageKey::build(&DEX_INFOS, entry, &[KeyPart(vec![1, 2])]);
        assert!(matches!(result, Err(SyncError::Unexpected(_))));
    }
}
