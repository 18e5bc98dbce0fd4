use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

use super::batch::Batch;
use super::block::DataBlock;

/// What goes into a cache fingerprint.
///
/// `Identity` trusts that equal (base name, history) pairs imply equal
/// payloads. `IdentityAndPayload` also hashes the pixel/table contents, at
/// the cost of reading every payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintMode {
    #[default]
    Identity,
    IdentityAndPayload,
}

/// Deterministic hex digest of the sorted (base name, history) pairs of a batch.
pub fn fingerprint(batch: &Batch, mode: FingerprintMode) -> Result<String> {
    let mut entries = batch
        .iter()
        .map(|block| entry(block, mode))
        .collect::<Result<Vec<String>>>()?;
    entries.sort();

    let mut hasher = Sha256::new();
    for e in &entries {
        hasher.update(e.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

fn entry(block: &DataBlock, mode: FingerprintMode) -> Result<String> {
    let identity = format!(
        "{}|{}",
        block.base_name(),
        block.history().as_history_string()
    );
    match mode {
        FingerprintMode::Identity => Ok(identity),
        FingerprintMode::IdentityAndPayload => {
            let mut hasher = Sha256::new();
            match block {
                DataBlock::Image(image) => {
                    let data = image.data()?;
                    let (h, w) = data.dim();
                    hasher.update((h as u64).to_le_bytes());
                    hasher.update((w as u64).to_le_bytes());
                    for v in data.iter() {
                        hasher.update(v.to_le_bytes());
                    }
                }
                DataBlock::Sources(table) => {
                    let table = table.data();
                    for column in table.columns() {
                        hasher.update(column.as_bytes());
                        hasher.update(b"\t");
                    }
                    for row in table.rows() {
                        hasher.update(b"\n");
                        for v in row {
                            hasher.update(v.to_string().as_bytes());
                            hasher.update(b"\t");
                        }
                    }
                }
            }
            Ok(format!("{}|{}", identity, hex::encode(hasher.finalize())))
        }
    }
}
