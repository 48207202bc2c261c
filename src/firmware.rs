//! Firmware image preparation and OAD (over-the-air download) block transfer.
//!
//! The device accepts a flat binary whose header carries three fields at fixed offsets:
//!
//! | Offset  | Field                                  |
//! |---------|----------------------------------------|
//! | `0x274` | image length (u32, little-endian)      |
//! | `0x278` | CRC32 of the image (u32, little-endian)|
//! | `0x27C` | firmware version tag (4 bytes)         |
//!
//! The CRC covers every byte of the image except its own 4-byte field, so patching the
//! field does not change the checksum. The image is then sent as 20-byte transfer units:
//! a 2-byte little-endian block index followed by 18 payload bytes, the final block
//! padded with `0xFF`.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Payload bytes per transfer block.
pub const OAD_BLOCK_SIZE: usize = 18;

/// Offset of the image length field.
pub const LENGTH_OFFSET: usize = 0x274;

/// Offset of the CRC32 field.
pub const CRC_OFFSET: usize = 0x278;

/// Offset of the firmware version tag.
pub const VERSION_OFFSET: usize = 0x27C;

/// Smallest image that still contains the whole header.
pub const HEADER_END: usize = VERSION_OFFSET + 4;

/// Byte used to pad the final block.
pub const BLOCK_PADDING: u8 = 0xFF;

const CRC_PAGE_SIZE: usize = 256;
const CRC_FIELD_LEN: usize = 4;

/// Status byte the device sends once the whole image has been verified.
const OAD_STATUS_SUCCESS: u8 = 0x00;
/// Status byte the device sends when its CRC over the received image disagrees.
const OAD_STATUS_CRC_ERROR: u8 = 0x01;

// ============================================================================
// Chunking
// ============================================================================

/// One transfer unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u16,
    pub payload: Vec<u8>,
    /// Whether the payload tail is `0xFF` padding.
    pub padded: bool,
}

impl Block {
    /// Wire form: little-endian index followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Split `image` into indexed blocks of `block_size` payload bytes.
pub fn chunk(image: &[u8], block_size: usize) -> Result<Vec<Block>> {
    if block_size == 0 {
        return Err(DriverError::InvalidInput("block size must be non-zero".into()));
    }
    let n_blocks = image.len().div_ceil(block_size);
    if n_blocks > usize::from(u16::MAX) + 1 {
        return Err(DriverError::InvalidInput(format!(
            "image of {} bytes needs {n_blocks} blocks, index space is 16-bit",
            image.len()
        )));
    }

    let blocks = image
        .chunks(block_size)
        .enumerate()
        .map(|(k, data)| {
            let mut payload = data.to_vec();
            let padded = payload.len() < block_size;
            payload.resize(block_size, BLOCK_PADDING);
            Block {
                index: k as u16,
                payload,
                padded,
            }
        })
        .collect();
    Ok(blocks)
}

/// Concatenate block payloads and cut the result back to `len` bytes.
pub fn reassemble(blocks: &[Block], len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = blocks.iter().flat_map(|b| b.payload.iter().copied()).collect();
    out.truncate(len);
    out
}

// ============================================================================
// Checksum and header fields
// ============================================================================

/// CRC32 (IEEE) over `image`, skipping the 4 bytes at `crc_offset`.
///
/// The image is consumed in 256-byte pages the same way the bootloader reads flash.
pub fn compute_crc32(image: &[u8], crc_offset: usize) -> Result<u32> {
    let window_end = crc_offset + CRC_FIELD_LEN;
    if window_end > image.len() {
        return Err(DriverError::InvalidInput(format!(
            "crc field at {crc_offset:#X} lies outside a {}-byte image",
            image.len()
        )));
    }

    let mut hasher = crc32fast::Hasher::new();
    for (page_no, page) in image.chunks(CRC_PAGE_SIZE).enumerate() {
        let base = page_no * CRC_PAGE_SIZE;
        if window_end <= base || crc_offset >= base + page.len() {
            hasher.update(page);
            continue;
        }
        let lo = crc_offset.saturating_sub(base);
        let hi = (window_end - base).min(page.len());
        hasher.update(&page[..lo]);
        hasher.update(&page[hi..]);
    }
    Ok(hasher.finalize())
}

/// Store `crc` in the header CRC field.
pub fn integrate_crc_to_file(image: &mut [u8], crc: u32) -> Result<()> {
    write_u32_reversed(image, CRC_OFFSET, crc)
}

/// Store `len` in the header length field.
pub fn integrate_file_length(image: &mut [u8], len: u32) -> Result<()> {
    write_u32_reversed(image, LENGTH_OFFSET, len)
}

/// Writes the big-endian bytes of `value` in reverse order (`be[3 - i]` at `offset + i`).
fn write_u32_reversed(image: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let field = image
        .get_mut(offset..offset + 4)
        .ok_or_else(|| DriverError::InvalidInput(format!("header field {offset:#X} out of range")))?;
    let be = value.to_be_bytes();
    for (i, byte) in field.iter_mut().enumerate() {
        *byte = be[3 - i];
    }
    Ok(())
}

fn read_u32_le(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        image[offset],
        image[offset + 1],
        image[offset + 2],
        image[offset + 3],
    ])
}

// ============================================================================
// Firmware Image
// ============================================================================

/// A firmware binary loaded for one OAD session.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    declared_length: u32,
    crc32: u32,
    version_tag: [u8; 4],
}

impl FirmwareImage {
    /// Wrap raw image bytes, reading whatever header fields they already carry.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < HEADER_END {
            return Err(DriverError::InvalidInput(format!(
                "firmware image of {} bytes is shorter than its {HEADER_END}-byte header",
                bytes.len()
            )));
        }
        if u32::try_from(bytes.len()).is_err() {
            return Err(DriverError::InvalidInput("firmware image exceeds 4 GiB".into()));
        }
        let mut version_tag = [0u8; 4];
        version_tag.copy_from_slice(&bytes[VERSION_OFFSET..HEADER_END]);
        Ok(Self {
            declared_length: read_u32_le(&bytes, LENGTH_OFFSET),
            crc32: read_u32_le(&bytes, CRC_OFFSET),
            version_tag,
            bytes,
        })
    }

    /// Read an image from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!("loaded firmware image: path={}, len={}", path.display(), bytes.len());
        Self::from_bytes(bytes)
    }

    /// Patch the length and CRC fields; returns the CRC written.
    pub fn prepare(&mut self) -> Result<u32> {
        let len = self.bytes.len() as u32;
        integrate_file_length(&mut self.bytes, len)?;
        let crc = compute_crc32(&self.bytes, CRC_OFFSET)?;
        integrate_crc_to_file(&mut self.bytes, crc)?;
        self.declared_length = len;
        self.crc32 = crc;
        info!(
            "firmware image prepared: len={}, crc32={:#010X}, version={}",
            len,
            crc,
            self.version_string()
        );
        Ok(crc)
    }

    /// Whether the stored header matches the image contents.
    pub fn verify(&self) -> bool {
        self.declared_length as usize == self.bytes.len()
            && compute_crc32(&self.bytes, CRC_OFFSET).is_ok_and(|crc| crc == self.crc32)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn declared_length(&self) -> u32 {
        self.declared_length
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn version_tag(&self) -> [u8; 4] {
        self.version_tag
    }

    /// Version tag rendered as text where printable, hex otherwise.
    pub fn version_string(&self) -> String {
        if self.version_tag.iter().all(|b| b.is_ascii_graphic()) {
            String::from_utf8_lossy(&self.version_tag).into_owned()
        } else {
            format!("{:02X?}", self.version_tag)
        }
    }

    pub fn block_count(&self) -> usize {
        (self.declared_length as usize).div_ceil(OAD_BLOCK_SIZE)
    }

    pub fn blocks(&self) -> Result<Vec<Block>> {
        let len = (self.declared_length as usize).min(self.bytes.len());
        chunk(&self.bytes[..len], OAD_BLOCK_SIZE)
    }
}

// ============================================================================
// OAD Transfer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OadState {
    InProgress,
    Completed,
    Aborted,
}

/// Serves blocks to the device as it requests them and tracks the outcome.
#[derive(Debug)]
pub struct OadTransfer {
    blocks: Vec<Block>,
    crc32: u32,
    highest_served: Option<u16>,
    state: OadState,
}

impl OadTransfer {
    /// Start a transfer of a prepared image.
    pub fn new(image: &FirmwareImage) -> Result<Self> {
        if !image.verify() {
            return Err(DriverError::InvalidInput(
                "firmware header does not match image; call prepare() first".into(),
            ));
        }
        let blocks = image.blocks()?;
        info!(
            "OAD transfer started: blocks={}, crc32={:#010X}",
            blocks.len(),
            image.crc32()
        );
        Ok(Self {
            blocks,
            crc32: image.crc32(),
            highest_served: None,
            state: OadState::InProgress,
        })
    }

    pub fn state(&self) -> OadState {
        self.state
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Fraction of blocks served so far, in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        match self.highest_served {
            Some(i) if !self.blocks.is_empty() => (usize::from(i) + 1) as f32 / self.blocks.len() as f32,
            _ => 0.0,
        }
    }

    /// Parse a block request notification (2-byte little-endian index).
    pub fn parse_request(data: &[u8]) -> Result<u16> {
        match data {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(DriverError::InvalidInput(format!(
                "block request of {} bytes",
                data.len()
            ))),
        }
    }

    /// Return the block the device asked for.
    pub fn request(&mut self, index: u16) -> Result<&Block> {
        if self.state != OadState::InProgress {
            return Err(DriverError::NotReady(format!(
                "OAD transfer is {:?}",
                self.state
            )));
        }
        let block = self.blocks.get(usize::from(index)).ok_or_else(|| {
            DriverError::InvalidInput(format!(
                "block {index} requested, image has {}",
                self.blocks.len()
            ))
        })?;
        self.highest_served = Some(self.highest_served.map_or(index, |h| h.max(index)));
        Ok(block)
    }

    /// Apply the device's final status byte.
    pub fn handle_status(&mut self, status: u8) -> Result<()> {
        match status {
            OAD_STATUS_SUCCESS => {
                self.state = OadState::Completed;
                info!("OAD transfer completed: crc32={:#010X}", self.crc32);
                Ok(())
            }
            OAD_STATUS_CRC_ERROR => {
                self.state = OadState::Aborted;
                warn!("OAD transfer aborted, device rejected checksum: crc32={:#010X}", self.crc32);
                Err(DriverError::ChecksumMismatch { crc32: self.crc32 })
            }
            other => {
                self.state = OadState::Aborted;
                warn!("OAD transfer aborted: status={:#04X}", other);
                Err(DriverError::OadStatus(other))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_1000_bytes() {
        let image = pattern(1000);
        let blocks = chunk(&image, OAD_BLOCK_SIZE).unwrap();
        assert_eq!(blocks.len(), 56);

        let last = &blocks[55];
        assert_eq!(last.index, 55);
        assert!(last.padded);
        assert_eq!(&last.payload[..10], &image[990..]);
        assert_eq!(&last.payload[10..], &[0xFF; 8]);
        assert!(blocks[..55].iter().all(|b| !b.padded));

        let mut joined: Vec<u8> = blocks.iter().flat_map(|b| b.payload.clone()).collect();
        while joined.last() == Some(&0xFF) {
            joined.pop();
        }
        assert_eq!(joined, image);
        assert_eq!(reassemble(&blocks, 1000), image);
    }

    #[test]
    fn test_block_wire_form() {
        let blocks = chunk(&pattern(40), OAD_BLOCK_SIZE).unwrap();
        let bytes = blocks[1].to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..2], &[0x01, 0x00]);
        assert_eq!(&bytes[2..], &pattern(40)[18..36]);
    }

    #[test]
    fn test_chunk_exact_multiple_has_no_padding() {
        let blocks = chunk(&pattern(36), OAD_BLOCK_SIZE).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[1].padded);
    }

    #[test]
    fn test_chunk_rejects_zero_block_size() {
        assert!(chunk(&pattern(10), 0).is_err());
    }

    #[test]
    fn test_crc32_check_value() {
        let mut image = b"123456789".to_vec();
        image.extend([0xAA; 4]);
        assert_eq!(compute_crc32(&image, 9).unwrap(), 0xCBF4_3926);

        let mut middle = b"1234".to_vec();
        middle.extend([0x55; 4]);
        middle.extend(b"56789");
        assert_eq!(compute_crc32(&middle, 4).unwrap(), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_window_across_page_boundary() {
        let image = pattern(600);
        let mut without = image[..254].to_vec();
        without.extend_from_slice(&image[258..]);
        assert_eq!(
            compute_crc32(&image, 254).unwrap(),
            crc32fast::hash(&without)
        );
    }

    #[test]
    fn test_crc32_rejects_field_outside_image() {
        assert!(compute_crc32(&pattern(8), 6).is_err());
    }

    #[test]
    fn test_crc_is_stable_after_patching() {
        let mut image = pattern(2048);
        let crc = compute_crc32(&image, CRC_OFFSET).unwrap();
        integrate_crc_to_file(&mut image, crc).unwrap();
        assert_eq!(compute_crc32(&image, CRC_OFFSET).unwrap(), crc);
        assert_eq!(read_u32_le(&image, CRC_OFFSET), crc);
    }

    #[test]
    fn test_fields_are_little_endian() {
        let mut image = vec![0u8; HEADER_END];
        integrate_file_length(&mut image, 0x1122_3344).unwrap();
        assert_eq!(&image[LENGTH_OFFSET..LENGTH_OFFSET + 4], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_prepare_and_verify() {
        let mut bytes = pattern(4000);
        bytes[VERSION_OFFSET..HEADER_END].copy_from_slice(b"v2.1");
        let mut image = FirmwareImage::from_bytes(bytes).unwrap();
        assert!(!image.verify());

        let crc = image.prepare().unwrap();
        assert!(image.verify());
        assert_eq!(image.crc32(), crc);
        assert_eq!(image.declared_length(), 4000);
        assert_eq!(image.version_tag(), *b"v2.1");
        assert_eq!(image.version_string(), "v2.1");
        assert_eq!(image.block_count(), 223);
        assert_eq!(image.blocks().unwrap().len(), 223);

        // Preparing twice writes the same checksum.
        assert_eq!(image.prepare().unwrap(), crc);
    }

    #[test]
    fn test_short_image_rejected() {
        assert!(FirmwareImage::from_bytes(vec![0; HEADER_END - 1]).is_err());
    }

    #[test]
    fn test_transfer_requires_prepared_image() {
        let image = FirmwareImage::from_bytes(pattern(1024)).unwrap();
        assert!(OadTransfer::new(&image).is_err());
    }

    #[test]
    fn test_transfer_serves_requested_blocks() {
        let mut image = FirmwareImage::from_bytes(pattern(1024)).unwrap();
        image.prepare().unwrap();
        let mut oad = OadTransfer::new(&image).unwrap();
        assert_eq!(oad.block_count(), 57);

        let idx = OadTransfer::parse_request(&[0x05, 0x00]).unwrap();
        let block = oad.request(idx).unwrap();
        assert_eq!(block.index, 5);
        assert_eq!(block.payload, image.bytes()[90..108].to_vec());
        assert!(oad.request(57).is_err());

        oad.request(56).unwrap();
        assert!((oad.progress() - 1.0).abs() < f32::EPSILON);
        oad.handle_status(0).unwrap();
        assert_eq!(oad.state(), OadState::Completed);
        assert!(oad.request(0).is_err());
    }

    #[test]
    fn test_checksum_mismatch_aborts_transfer() {
        let mut image = FirmwareImage::from_bytes(pattern(1024)).unwrap();
        let crc = image.prepare().unwrap();
        let mut oad = OadTransfer::new(&image).unwrap();
        match oad.handle_status(1) {
            Err(DriverError::ChecksumMismatch { crc32 }) => assert_eq!(crc32, crc),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(oad.state(), OadState::Aborted);
        assert!(matches!(oad.request(0), Err(DriverError::NotReady(_))));
    }

    #[test]
    fn test_parse_request_rejects_short_payload() {
        assert!(OadTransfer::parse_request(&[0x01]).is_err());
    }
}
