use crate::SgComError;

const MAGIC: &[u8; 4] = b"SGPK";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4 + 8 + 4;

/// One frame of engine output as broadcast to remote players.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePacket {
    pub sequence: u32,
    pub time_ms: f64,
    pub values: Vec<f32>,
}

impl FramePacket {
    /// Little-endian layout: magic, version, sequence, time, count, values.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.values.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.time_ms.to_le_bytes());
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for value in &self.values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SgComError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC || bytes[4] != VERSION {
            return Err(SgComError::InvalidPacket);
        }

        let sequence = u32::from_le_bytes(take(bytes, 5)?);
        let time_ms = f64::from_le_bytes(take(bytes, 9)?);
        let count = u32::from_le_bytes(take(bytes, 17)?) as usize;

        let body = &bytes[HEADER_LEN..];
        if body.len() != count * 4 || !time_ms.is_finite() {
            return Err(SgComError::InvalidPacket);
        }

        let values = body
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self {
            sequence,
            time_ms,
            values,
        })
    }
}

fn take<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], SgComError> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(SgComError::InvalidPacket)
}
