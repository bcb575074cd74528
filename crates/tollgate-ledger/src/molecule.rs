//! Canonical (molecule) serialization of the structures that enter a
//! transaction hash or a witness.
//!
//! Fixed-size structs are concatenated fields. Tables and dynamic vectors
//! share one layout: a `u32` total size, one `u32` offset per item, then the
//! items. Fixed vectors are a `u32` item count followed by the items.

use crate::types::{CellDep, CellInput, CellOutput, OutPoint, Script, Transaction};

fn table(fields: &[Vec<u8>]) -> Vec<u8> {
    let header = 4 * (fields.len() + 1);
    let total = header + fields.iter().map(Vec::len).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    let mut offset = header;
    for field in fields {
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += field.len();
    }
    for field in fields {
        out.extend_from_slice(field);
    }
    out
}

fn dynvec(items: &[Vec<u8>]) -> Vec<u8> {
    table(items)
}

fn fixvec(count: usize, items: impl IntoIterator<Item = Vec<u8>>) -> Vec<u8> {
    let mut out = (count as u32).to_le_bytes().to_vec();
    for item in items {
        out.extend_from_slice(&item);
    }
    out
}

pub fn bytes(data: &[u8]) -> Vec<u8> {
    fixvec(data.len(), std::iter::once(data.to_vec()))
}

pub fn script(s: &Script) -> Vec<u8> {
    table(&[
        s.code_hash.0.to_vec(),
        vec![s.hash_type.to_byte()],
        bytes(&s.args),
    ])
}

pub fn out_point(o: &OutPoint) -> Vec<u8> {
    let mut out = o.tx_hash.0.to_vec();
    out.extend_from_slice(&o.index.to_le_bytes());
    out
}

pub fn cell_input(i: &CellInput) -> Vec<u8> {
    let mut out = i.since.to_le_bytes().to_vec();
    out.extend(out_point(&i.previous_output));
    out
}

pub fn cell_dep(d: &CellDep) -> Vec<u8> {
    let mut out = out_point(&d.out_point);
    out.push(d.dep_type.to_byte());
    out
}

pub fn cell_output(o: &CellOutput) -> Vec<u8> {
    table(&[
        o.capacity.to_le_bytes().to_vec(),
        script(&o.lock),
        o.type_script.as_ref().map(script).unwrap_or_default(),
    ])
}

/// Serialize the raw part of a transaction (everything except witnesses).
pub fn serialize_raw_transaction(tx: &Transaction) -> Vec<u8> {
    let outputs: Vec<Vec<u8>> = tx.outputs.iter().map(cell_output).collect();
    let outputs_data: Vec<Vec<u8>> = tx.outputs_data.iter().map(|d| bytes(d)).collect();
    table(&[
        tx.version.to_le_bytes().to_vec(),
        fixvec(tx.cell_deps.len(), tx.cell_deps.iter().map(cell_dep)),
        fixvec(tx.header_deps.len(), tx.header_deps.iter().map(|h| h.0.to_vec())),
        fixvec(tx.inputs.len(), tx.inputs.iter().map(cell_input)),
        dynvec(&outputs),
        dynvec(&outputs_data),
    ])
}

/// `WitnessArgs` with only the `lock` field set.
pub fn witness_args_with_lock(lock: &[u8]) -> Vec<u8> {
    table(&[bytes(lock), Vec::new(), Vec::new()])
}

/// Extract the `lock` field of a serialized `WitnessArgs`, if present.
pub fn witness_args_lock(witness: &[u8]) -> Option<Vec<u8>> {
    let read_u32 = |at: usize| -> Option<usize> {
        let raw: [u8; 4] = witness.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw) as usize)
    };
    let total = read_u32(0)?;
    if total != witness.len() || total < 16 {
        return None;
    }
    let start = read_u32(4)?;
    let end = read_u32(8)?;
    if start != 16 || end < start || end > total {
        return None;
    }
    if start == end {
        return None;
    }
    let field = witness.get(start..end)?;
    let len = u32::from_le_bytes(field.get(..4)?.try_into().ok()?) as usize;
    let body = field.get(4..)?;
    (body.len() == len).then(|| body.to_vec())
}
