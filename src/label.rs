// Take a look at the license at the top of the repository in the LICENSE file.

//! Minimal on-disk label reading for the rename search.
//!
//! The rename search has to find out which PVID a candidate device holds
//! without the full scan pipeline. It reads one 4 KiB header and extracts
//! the 32-byte PVID; nothing else of the volume-manager layout is
//! interpreted here.

use std::fs;
use std::io::Read;
use std::path::Path;

use log::debug;

const SECTOR_SIZE: usize = 512;
/// The label sits in one of the first four sectors.
const LABEL_SCAN_SECTORS: usize = 4;
const LABEL_ID: &[u8; 8] = b"LABELONE";
const LABEL_TYPE: &[u8; 8] = b"LVM2 001";
/// Size of the header read done per candidate device.
const HEADER_SIZE: usize = 4096;

pub(crate) const PVID_LEN: usize = 32;

/// Read the 4 KiB header of a block device and extract the PVID stored in
/// its label, if it carries one.
///
/// `Ok(None)` means the device is readable but not labelled; an `Err` means
/// the read itself failed (the caller usually just skips the device).
pub fn read_pvid(path: &Path) -> std::io::Result<Option<String>> {
    let mut f = fs::File::open(path)?;
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(extract_pvid(&buf[..filled]))
}

/// Scan sector boundaries of a header buffer for the label and pull the
/// PVID out of the PV header it points at.
pub(crate) fn extract_pvid(buf: &[u8]) -> Option<String> {
    for sector in 0..LABEL_SCAN_SECTORS {
        let base = sector * SECTOR_SIZE;
        if buf.len() < base + SECTOR_SIZE {
            break;
        }
        let label = &buf[base..base + SECTOR_SIZE];
        if &label[0..8] != LABEL_ID {
            continue;
        }
        if &label[24..32] != LABEL_TYPE {
            debug!("label at sector {sector} has unknown type");
            continue;
        }
        // Bytes 20..24 hold the PV header offset within the label sector.
        let offset = u32::from_le_bytes([label[20], label[21], label[22], label[23]]) as usize;
        if offset + PVID_LEN > SECTOR_SIZE {
            debug!("label at sector {sector} has out-of-range pv header offset {offset}");
            continue;
        }
        let raw = &label[offset..offset + PVID_LEN];
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            debug!("label at sector {sector} has a non-textual pvid");
            continue;
        }
        return Some(String::from_utf8_lossy(raw).into_owned());
    }
    None
}

/// Build a labelled header for tests and tooling: label in `sector`, PVID
/// at the conventional offset.
#[cfg(test)]
pub(crate) fn make_header(sector: usize, pvid: &str) -> Vec<u8> {
    assert!(sector < LABEL_SCAN_SECTORS);
    assert_eq!(pvid.len(), PVID_LEN);
    let mut buf = vec![0u8; HEADER_SIZE];
    let base = sector * SECTOR_SIZE;
    let offset = 32u32;
    buf[base..base + 8].copy_from_slice(LABEL_ID);
    buf[base + 20..base + 24].copy_from_slice(&offset.to_le_bytes());
    buf[base + 24..base + 32].copy_from_slice(LABEL_TYPE);
    let pv = base + offset as usize;
    buf[pv..pv + PVID_LEN].copy_from_slice(pvid.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pvid(fill: char) -> String {
        std::iter::repeat_n(fill, PVID_LEN).collect()
    }

    #[test]
    fn finds_pvid_in_any_scanned_sector() {
        for sector in 0..LABEL_SCAN_SECTORS {
            let buf = make_header(sector, &pvid('a'));
            assert_eq!(extract_pvid(&buf).as_deref(), Some(pvid('a').as_str()));
        }
    }

    #[test]
    fn unlabelled_buffer_yields_none() {
        assert_eq!(extract_pvid(&[0u8; HEADER_SIZE]), None);
        assert_eq!(extract_pvid(b"short"), None);
    }

    #[test]
    fn wrong_label_type_is_skipped() {
        let mut buf = make_header(0, &pvid('b'));
        buf[24..32].copy_from_slice(b"LVM1 001");
        assert_eq!(extract_pvid(&buf), None);
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let mut buf = make_header(0, &pvid('c'));
        buf[20..24].copy_from_slice(&(SECTOR_SIZE as u32).to_le_bytes());
        assert_eq!(extract_pvid(&buf), None);
    }

    #[test]
    fn read_pvid_from_backing_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&make_header(1, &pvid('d'))).unwrap();
        f.flush().unwrap();
        let got = read_pvid(f.path()).unwrap();
        assert_eq!(got.as_deref(), Some(pvid('d').as_str()));
    }

    #[test]
    fn read_pvid_short_file_is_not_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"tiny").unwrap();
        f.flush().unwrap();
        assert_eq!(read_pvid(f.path()).unwrap(), None);
    }
}
