//! Raw BGZF block framing and decompression.
//!
//! BGZF wraps deflate streams in independent gzip members of at most 64 KiB
//! uncompressed, each carrying its total size in a `BC` extra subfield so a
//! reader can walk block boundaries without inflating. The applicator
//! depends on that property: it recodes one input block into one output
//! block, leaving boundaries where it found them.
//!
//! Block layout:
//!
//! ```text
//! header (18 bytes): 1f 8b 08 04 | MTIME(4) XFL OS | XLEN=6 | "BC" len=2 BSIZE(2)
//! deflate payload
//! footer (8 bytes):  CRC32(4) ISIZE(4)
//! ```

use std::io::{self, Read};

use libdeflater::Decompressor;

/// Size of the BGZF block header.
pub const BGZF_HEADER_SIZE: usize = 18;

/// Size of the BGZF block footer (CRC32 + ISIZE).
pub const BGZF_FOOTER_SIZE: usize = 8;

/// Largest uncompressed payload a block may carry.
pub const BGZF_MAX_UNCOMPRESSED: usize = 65280;

/// The distinguished empty block that terminates a BGZF stream.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02, 0x00,
    0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// One raw (still compressed) BGZF block.
#[derive(Debug, Clone)]
pub struct BgzfBlock {
    /// Complete block bytes: header + deflate payload + footer.
    pub data: Vec<u8>,
}

impl BgzfBlock {
    /// Whether this is the EOF marker block.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.data == BGZF_EOF
    }

    /// The deflate payload between header and footer.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        if self.data.len() <= BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE {
            return &[];
        }
        &self.data[BGZF_HEADER_SIZE..self.data.len() - BGZF_FOOTER_SIZE]
    }

    /// Uncompressed size recorded in the ISIZE footer field.
    #[must_use]
    pub fn uncompressed_size(&self) -> usize {
        if self.data.len() < BGZF_FOOTER_SIZE {
            return 0;
        }
        let n = self.data.len();
        u32::from_le_bytes([self.data[n - 4], self.data[n - 3], self.data[n - 2], self.data[n - 1]])
            as usize
    }

    /// CRC32 of the uncompressed payload, from the footer.
    #[must_use]
    pub fn crc32(&self) -> u32 {
        if self.data.len() < BGZF_FOOTER_SIZE {
            return 0;
        }
        let n = self.data.len();
        u32::from_le_bytes([self.data[n - 8], self.data[n - 7], self.data[n - 6], self.data[n - 5]])
    }
}

/// Reads one raw BGZF block, validating its framing.
///
/// Returns `Ok(None)` at a clean EOF (no more bytes). A short read inside a
/// block surfaces as `UnexpectedEof`.
pub fn read_block<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<BgzfBlock>> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "invalid BGZF magic: expected 0x1f 0x8b, got 0x{:02x} 0x{:02x}",
                header[0], header[1]
            ),
        ));
    }
    if header[2] != 0x08 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid BGZF compression method 0x{:02x}", header[2]),
        ));
    }
    if header[3] & 0x04 == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "BGZF block missing FEXTRA flag"));
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "BGZF block missing BC extra subfield",
        ));
    }

    // BSIZE holds total block size minus one.
    let block_size = u16::from_le_bytes([header[16], header[17]]) as usize + 1;
    if block_size < BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("BGZF block too small: {block_size} bytes"),
        ));
    }

    let mut data = vec![0u8; block_size];
    data[..BGZF_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut data[BGZF_HEADER_SIZE..])?;

    Ok(Some(BgzfBlock { data }))
}

/// Reads up to `max_blocks` raw blocks, dropping EOF markers.
///
/// Returns an empty vector once the stream is exhausted.
pub fn read_blocks<R: Read + ?Sized>(
    reader: &mut R,
    max_blocks: usize,
) -> io::Result<Vec<BgzfBlock>> {
    let mut blocks = Vec::with_capacity(max_blocks);
    for _ in 0..max_blocks {
        match read_block(reader)? {
            Some(block) => {
                if !block.is_eof() {
                    blocks.push(block);
                }
            }
            None => break,
        }
    }
    Ok(blocks)
}

/// Inflates `block` and appends the result to `output`, verifying the CRC.
pub fn inflate_into(
    block: &BgzfBlock,
    decompressor: &mut Decompressor,
    output: &mut Vec<u8>,
) -> io::Result<()> {
    let uncompressed_size = block.uncompressed_size();
    if block.is_eof() || uncompressed_size == 0 {
        return Ok(());
    }

    let start = output.len();
    output.resize(start + uncompressed_size, 0);
    decompressor.deflate_decompress(block.payload(), &mut output[start..]).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("BGZF inflate failed: {e:?}"))
    })?;

    let expected = block.crc32();
    let actual = crc32fast::hash(&output[start..]);
    if expected != actual {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("BGZF CRC32 mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"),
        ));
    }

    Ok(())
}
