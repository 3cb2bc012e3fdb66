//! Payload layouts. Everything on the wire is little-endian: small numeric
//! payloads are hand-packed, structured assets travel as bincode-encoded
//! serde values. Nothing here assumes shared host struct layout.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ProtocolError;
use crate::spatial::BoundingBox;
use crate::stats::RenderStats;

pub const BOUNDING_BOX_LEN: usize = 24;
pub const RENDER_STATS_LEN: usize = 28;

pub fn encode_u32(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

pub fn decode_u32(body: &[u8]) -> Result<u32, ProtocolError> {
    let arr: [u8; 4] = body.try_into().map_err(|_| ProtocolError::BadPayload {
        what: "u32 word",
        expected: 4,
        got: body.len(),
    })?;
    Ok(u32::from_le_bytes(arr))
}

/// Image-slab payload: `(offset << 16) | chunk_size`, both fields ≤ 16 bits.
pub fn encode_render_start(offset: u16, chunk: u16) -> Bytes {
    encode_u32(((offset as u32) << 16) | chunk as u32)
}

/// Bare list of `u32` worker ids; the count is implied by the body length.
pub fn encode_worker_ids(ids: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ids.len() * 4);
    for id in ids {
        buf.put_u32_le(*id);
    }
    buf.freeze()
}

pub fn encode_bounding_box(bounds: &BoundingBox) -> Bytes {
    let mut buf = BytesMut::with_capacity(BOUNDING_BOX_LEN);
    for axis in 0..3 {
        buf.put_f32_le(bounds.min[axis]);
    }
    for axis in 0..3 {
        buf.put_f32_le(bounds.max[axis]);
    }
    buf.freeze()
}

pub fn decode_bounding_box(body: &[u8]) -> Result<BoundingBox, ProtocolError> {
    if body.len() != BOUNDING_BOX_LEN {
        return Err(ProtocolError::BadPayload {
            what: "bounding box",
            expected: BOUNDING_BOX_LEN,
            got: body.len(),
        });
    }
    let f = |i: usize| {
        f32::from_le_bytes([body[i * 4], body[i * 4 + 1], body[i * 4 + 2], body[i * 4 + 3]])
    };
    Ok(BoundingBox {
        min: [f(0), f(1), f(2)],
        max: [f(3), f(4), f(5)],
    })
}

pub fn encode_render_stats(stats: &RenderStats) -> Bytes {
    let mut buf = BytesMut::with_capacity(RENDER_STATS_LEN);
    buf.put_u64_le(stats.rays_produced);
    buf.put_u64_le(stats.rays_killed);
    buf.put_u64_le(stats.rays_queued);
    buf.put_f32_le(stats.progress);
    buf.freeze()
}

pub fn decode_render_stats(body: &[u8]) -> Result<RenderStats, ProtocolError> {
    if body.len() != RENDER_STATS_LEN {
        return Err(ProtocolError::BadPayload {
            what: "render stats",
            expected: RENDER_STATS_LEN,
            got: body.len(),
        });
    }
    let u = |i: usize| {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&body[i..i + 8]);
        u64::from_le_bytes(arr)
    };
    let mut p = [0u8; 4];
    p.copy_from_slice(&body[24..28]);
    Ok(RenderStats {
        rays_produced: u(0),
        rays_killed: u(8),
        rays_queued: u(16),
        progress: f32::from_le_bytes(p),
    })
}

pub fn encode_asset<T: Serialize>(what: &'static str, value: &T) -> Result<Bytes, ProtocolError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::BadAsset { what, source })
}

pub fn decode_asset<T: DeserializeOwned>(
    what: &'static str,
    body: &[u8],
) -> Result<T, ProtocolError> {
    bincode::deserialize(body).map_err(|source| ProtocolError::BadAsset { what, source })
}
