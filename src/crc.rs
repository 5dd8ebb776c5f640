use byteorder::{ByteOrder, LittleEndian};

/// Performs the firmware-image checksum computation.
///
/// The image is processed as little-endian 32-bit words, each shifted through
/// the CRC-32 register MSB-first with polynomial `0x04C11DB7` and preset
/// `0xFFFFFFFF`. There is no final xor and no bit reversal; this matches the
/// hardware CRC unit in the node's flash updater.
///
/// `data` must be a multiple of 4 bytes long (firmware images are padded to
/// whole 512-byte sectors before checksumming); a trailing partial word is
/// ignored.
pub fn image_crc32(data: &[u8]) -> u32 {
    const POLYNOMIAL: u32 = 0x04C1_1DB7;
    let mut crc: u32 = 0xFFFF_FFFF;

    for chunk in data.chunks_exact(4) {
        let mut word = LittleEndian::read_u32(chunk);
        for _ in 0..32 {
            let msb = (crc ^ word) & 0x8000_0000 != 0;
            crc <<= 1;
            if msb {
                crc ^= POLYNOMIAL;
            }
            word <<= 1;
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_words() {
        // Captured from the reference implementation.
        assert_eq!(image_crc32(&[0x01, 0x00, 0x00, 0x00]), 0xC3C5_C0CC);
        // The preset cancels an all-ones first word.
        assert_eq!(image_crc32(&[0xff, 0xff, 0xff, 0xff]), 0);
    }

    #[test]
    fn padded_sector() {
        // One 512-byte sector: bytes 0x01..=0x10 padded with 496 zero bytes.
        let mut image = vec![0u8; 512];
        for (i, byte) in image[..16].iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        assert_eq!(image_crc32(&image), 0x6934_9A40);
    }
}
