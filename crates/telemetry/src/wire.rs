//! Fixed wire layout for the ML mirror: one 68-byte packed little-endian
//! record per datagram. No framing, no version byte — the layout is the
//! contract.
//!
//! | offset | width | field |
//! |--------|-------|----------------------|
//! | 0      | 8     | timestamp_ns         |
//! | 8      | 8     | cache_references     |
//! | 16     | 8     | cache_misses         |
//! | 24     | 8     | branch_instructions  |
//! | 32     | 8     | branch_misses        |
//! | 40     | 8     | cycles               |
//! | 48     | 8     | instructions         |
//! | 56     | 4     | cache_miss_rate f32  |
//! | 60     | 4     | branch_miss_rate f32 |
//! | 64     | 4     | ipc f32              |

use crate::TelemetrySample;

pub const SAMPLE_WIRE_LEN: usize = 68;

pub fn encode(sample: &TelemetrySample) -> [u8; SAMPLE_WIRE_LEN] {
    let mut buf = [0u8; SAMPLE_WIRE_LEN];
    buf[0..8].copy_from_slice(&sample.timestamp_ns.to_le_bytes());
    buf[8..16].copy_from_slice(&sample.cache_references.to_le_bytes());
    buf[16..24].copy_from_slice(&sample.cache_misses.to_le_bytes());
    buf[24..32].copy_from_slice(&sample.branch_instructions.to_le_bytes());
    buf[32..40].copy_from_slice(&sample.branch_misses.to_le_bytes());
    buf[40..48].copy_from_slice(&sample.cycles.to_le_bytes());
    buf[48..56].copy_from_slice(&sample.instructions.to_le_bytes());
    buf[56..60].copy_from_slice(&sample.cache_miss_rate.to_le_bytes());
    buf[60..64].copy_from_slice(&sample.branch_miss_rate.to_le_bytes());
    buf[64..68].copy_from_slice(&sample.ipc.to_le_bytes());
    buf
}

pub fn decode(buf: &[u8]) -> Option<TelemetrySample> {
    if buf.len() != SAMPLE_WIRE_LEN {
        return None;
    }

    let u64_at = |off: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[off..off + 8]);
        u64::from_le_bytes(raw)
    };
    let f32_at = |off: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[off..off + 4]);
        f32::from_le_bytes(raw)
    };

    Some(TelemetrySample {
        timestamp_ns: u64_at(0),
        cache_references: u64_at(8),
        cache_misses: u64_at(16),
        branch_instructions: u64_at(24),
        branch_misses: u64_at(32),
        cycles: u64_at(40),
        instructions: u64_at(48),
        cache_miss_rate: f32_at(56),
        branch_miss_rate: f32_at(60),
        ipc: f32_at(64),
    })
}
