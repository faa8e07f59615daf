//! Hash-chain verification for the gesture event log.
//!
//! Each row stores `prev_hash` and `entry_hash = SHA-256(prev_hash || payload)`.
//! The first row's `prev_hash` is the latest retention checkpoint's chain head,
//! or all zeroes when nothing has ever been pruned.

use anyhow::{anyhow, Result};
use rusqlite::{Connection, Row};
use sha2::{Digest, Sha256};

/// Chain link hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenLink {
    pub id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Rows checked before the first break (or all rows).
    pub verified: u64,
    /// Head the chain was anchored to; `None` when no checkpoint exists.
    pub checkpoint_head: Option<[u8; 32]>,
    /// Hash of the last row that verified.
    pub head: [u8; 32],
    pub broken: Option<BrokenLink>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken.is_none()
    }
}

/// One stored chain row.
#[derive(Debug, Clone)]
pub struct ChainRow {
    pub id: i64,
    pub payload_json: String,
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
}

/// Walk `rows` in id order starting from `anchor`, stopping at the first row
/// whose link or hash does not match.
pub fn verify_rows<I>(anchor: Option<[u8; 32]>, rows: I) -> ChainReport
where
    I: IntoIterator<Item = ChainRow>,
{
    let mut expected_prev = anchor.unwrap_or([0u8; 32]);
    let mut report = ChainReport {
        verified: 0,
        checkpoint_head: anchor,
        head: expected_prev,
        broken: None,
    };

    for row in rows {
        if row.prev_hash != expected_prev {
            report.broken = Some(BrokenLink {
                id: row.id,
                reason: format!(
                    "prev_hash={}, expected_prev={}",
                    hex::encode(row.prev_hash),
                    hex::encode(expected_prev)
                ),
            });
            break;
        }
        let computed = hash_entry(&expected_prev, row.payload_json.as_bytes());
        if computed != row.entry_hash {
            report.broken = Some(BrokenLink {
                id: row.id,
                reason: format!(
                    "computed_hash={}, stored_hash={}",
                    hex::encode(computed),
                    hex::encode(row.entry_hash)
                ),
            });
            break;
        }
        expected_prev = row.entry_hash;
        report.head = row.entry_hash;
        report.verified += 1;
    }
    report
}

/// Verify the `gesture_events` chain in a SQLite log.
pub fn verify_chain(conn: &Connection) -> Result<ChainReport> {
    let anchor = latest_checkpoint_head(conn)?;
    let mut stmt = conn.prepare(
        "SELECT id, payload_json, prev_hash, entry_hash FROM gesture_events ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?
        .map(|r| {
            let (id, payload_json, prev, entry) = r?;
            Ok(ChainRow {
                id,
                payload_json,
                prev_hash: to_hash32(&prev, id, "prev_hash")?,
                entry_hash: to_hash32(&entry, id, "entry_hash")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(verify_rows(anchor, rows))
}

pub fn latest_checkpoint_head(conn: &Connection) -> Result<Option<[u8; 32]>> {
    let mut stmt =
        conn.prepare("SELECT chain_head_hash FROM checkpoints ORDER BY id DESC LIMIT 1")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(Some(blob32(row, 0)?)),
        None => Ok(None),
    }
}

pub(crate) fn blob32(row: &Row<'_>, idx: usize) -> Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    if bytes.len() != 32 {
        return Err(anyhow!("expected 32-byte blob at col {}", idx));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn to_hash32(bytes: &[u8], id: i64, column: &str) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| anyhow!("corrupt event log: {} size at id {}", column, id))
}
