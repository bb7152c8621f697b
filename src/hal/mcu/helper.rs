use anyhow::{anyhow,Result};

pub fn bytes_be_to_u32(bytes: &[u8]) -> Result<u32> {
    match bytes {
        [b0, b1, b2, b3, ..] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => Err(anyhow!("ERROR: bytes_be_to_u32: bytes.len() < 4")),
    }
}

pub fn spi_req_frame_size(meta: &[u8]) -> usize {
    (((meta[3] as u16) << 8) | (meta[4] as u16)) as usize
}
