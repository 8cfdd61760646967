//! Systematic Reed–Solomon erasure coding over GF(2^8).
//!
//! A record is split into `k` equally sized data shards (zero padded) and
//! extended with `m` parity shards computed from a Cauchy matrix. Any `k` of
//! the `k + m` shards reconstruct the record.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use tabula_common::error::{TabulaError, TabulaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErasureCodec {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "reed_solomon_3_3")]
    ReedSolomon3_3,
    #[serde(rename = "reed_solomon_6_3")]
    ReedSolomon6_3,
    /// 12 data parts and 4 parity parts (two local + two global groups).
    #[serde(rename = "lrc_12_2_2")]
    Lrc12_2_2,
    #[serde(rename = "isa_lrc_12_2_2")]
    IsaLrc12_2_2,
}

impl ErasureCodec {
    pub fn is_erasure(self) -> bool {
        self != ErasureCodec::None
    }

    pub fn data_parts(self) -> usize {
        match self {
            ErasureCodec::None => 1,
            ErasureCodec::ReedSolomon3_3 => 3,
            ErasureCodec::ReedSolomon6_3 => 6,
            ErasureCodec::Lrc12_2_2 | ErasureCodec::IsaLrc12_2_2 => 12,
        }
    }

    pub fn parity_parts(self) -> usize {
        match self {
            ErasureCodec::None => 0,
            ErasureCodec::ReedSolomon3_3 | ErasureCodec::ReedSolomon6_3 => 3,
            ErasureCodec::Lrc12_2_2 | ErasureCodec::IsaLrc12_2_2 => 4,
        }
    }

    /// Part losses every codeword survives. The local reconstruction code
    /// only guarantees three, even though most four-part losses decode.
    pub fn guaranteed_tolerated_losses(self) -> usize {
        match self {
            ErasureCodec::Lrc12_2_2 | ErasureCodec::IsaLrc12_2_2 => 3,
            other => other.parity_parts(),
        }
    }

    pub fn total_parts(self) -> usize {
        self.data_parts() + self.parity_parts()
    }

    pub fn name(self) -> &'static str {
        match self {
            ErasureCodec::None => "none",
            ErasureCodec::ReedSolomon3_3 => "reed_solomon_3_3",
            ErasureCodec::ReedSolomon6_3 => "reed_solomon_6_3",
            ErasureCodec::Lrc12_2_2 => "lrc_12_2_2",
            ErasureCodec::IsaLrc12_2_2 => "isa_lrc_12_2_2",
        }
    }

    fn coder(self) -> ReedSolomon {
        ReedSolomon::new(self.data_parts(), self.parity_parts())
    }

    /// Split `record` into `total_parts()` shards.
    pub fn encode(self, record: &[u8]) -> Vec<Vec<u8>> {
        if !self.is_erasure() {
            return vec![record.to_vec()];
        }
        self.coder().encode(record)
    }

    /// Rebuild a record of `original_len` bytes from any `data_parts()` shards.
    pub fn decode(self, shards: &[Option<Vec<u8>>], original_len: usize) -> TabulaResult<Vec<u8>> {
        if !self.is_erasure() {
            return shards
                .iter()
                .flatten()
                .next()
                .cloned()
                .ok_or_else(|| TabulaError::internal("no replica to decode from"));
        }
        self.coder().decode(shards, original_len)
    }
}

impl fmt::Display for ErasureCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErasureCodec {
    type Err = TabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ErasureCodec::None),
            "reed_solomon_3_3" | "isa_reed_solomon_3_3" => Ok(ErasureCodec::ReedSolomon3_3),
            "reed_solomon_6_3" | "isa_reed_solomon_6_3" => Ok(ErasureCodec::ReedSolomon6_3),
            "lrc_12_2_2" => Ok(ErasureCodec::Lrc12_2_2),
            "isa_lrc_12_2_2" => Ok(ErasureCodec::IsaLrc12_2_2),
            other => Err(TabulaError::argument(format!("unknown erasure codec {other:?}"))),
        }
    }
}

// ── GF(2^8) arithmetic ────────────────────────────────────────────────

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11d;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_inv(a: u8) -> u8 {
    let t = tables();
    t.exp[255 - t.log[a as usize] as usize]
}

/// Invert a square matrix in place; `None` when singular.
fn invert(mut m: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    let n = m.len();
    let mut inv: Vec<Vec<u8>> = (0..n)
        .map(|i| (0..n).map(|j| u8::from(i == j)).collect())
        .collect();
    for col in 0..n {
        let pivot = (col..n).find(|&r| m[r][col] != 0)?;
        m.swap(col, pivot);
        inv.swap(col, pivot);
        let scale = gf_inv(m[col][col]);
        for j in 0..n {
            m[col][j] = gf_mul(m[col][j], scale);
            inv[col][j] = gf_mul(inv[col][j], scale);
        }
        for r in 0..n {
            if r != col && m[r][col] != 0 {
                let factor = m[r][col];
                for j in 0..n {
                    let (dm, di) = (gf_mul(factor, m[col][j]), gf_mul(factor, inv[col][j]));
                    m[r][j] ^= dm;
                    inv[r][j] ^= di;
                }
            }
        }
    }
    Some(inv)
}

struct ReedSolomon {
    data: usize,
    parity: usize,
}

impl ReedSolomon {
    fn new(data: usize, parity: usize) -> Self {
        Self { data, parity }
    }

    /// Row `part` of the systematic encoding matrix `[I; C]`.
    fn matrix_row(&self, part: usize) -> Vec<u8> {
        if part < self.data {
            return (0..self.data).map(|j| u8::from(j == part)).collect();
        }
        let x = part as u8;
        (0..self.data).map(|j| gf_inv(x ^ j as u8)).collect()
    }

    fn shard_len(&self, len: usize) -> usize {
        len.div_ceil(self.data).max(1)
    }

    fn encode(&self, record: &[u8]) -> Vec<Vec<u8>> {
        let len = self.shard_len(record.len());
        let mut shards: Vec<Vec<u8>> = (0..self.data)
            .map(|j| {
                let mut shard = vec![0u8; len];
                let start = (j * len).min(record.len());
                let end = ((j + 1) * len).min(record.len());
                shard[..end - start].copy_from_slice(&record[start..end]);
                shard
            })
            .collect();
        for p in self.data..self.data + self.parity {
            let row = self.matrix_row(p);
            let mut parity = vec![0u8; len];
            for (coef, shard) in row.iter().zip(&shards) {
                for (out, byte) in parity.iter_mut().zip(shard) {
                    *out ^= gf_mul(*coef, *byte);
                }
            }
            shards.push(parity);
        }
        shards
    }

    fn decode(&self, shards: &[Option<Vec<u8>>], original_len: usize) -> TabulaResult<Vec<u8>> {
        let len = self.shard_len(original_len);
        let present: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().map_or(false, |s| s.len() == len))
            .map(|(i, _)| i)
            .take(self.data)
            .collect();
        if present.len() < self.data {
            return Err(TabulaError::internal(format!(
                "need {} shards to decode, have {}",
                self.data,
                present.len()
            )));
        }
        let mut out = Vec::with_capacity(self.data * len);
        if present.iter().enumerate().all(|(i, &p)| i == p) {
            for s in shards.iter().take(self.data).flatten() {
                out.extend_from_slice(s);
            }
        } else {
            let sub: Vec<Vec<u8>> = present.iter().map(|&p| self.matrix_row(p)).collect();
            let inv = invert(sub).ok_or_else(|| TabulaError::internal("singular decode matrix"))?;
            for row in &inv {
                let mut data = vec![0u8; len];
                for (coef, &p) in row.iter().zip(&present) {
                    if let Some(shard) = &shards[p] {
                        for (o, b) in data.iter_mut().zip(shard) {
                            *o ^= gf_mul(*coef, *b);
                        }
                    }
                }
                out.extend_from_slice(&data);
            }
        }
        out.truncate(original_len);
        Ok(out)
    }
}
