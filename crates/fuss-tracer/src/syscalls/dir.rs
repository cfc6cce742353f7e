//! getdents64 emulation for merged directories.
//!
//! Descriptors in the virtual FD table were opened on one backing directory,
//! but their listing must be the merged view across layers, so the records
//! are synthesized entirely from the overlay and the real syscall is
//! suppressed.

use std::os::fd::RawFd;

use nix::errno::Errno;

use super::SyscallCtx;
use crate::memory;

use fuss_overlay::DirEntry;

/// Offset of `d_name` in `linux_dirent64`: u64 ino + s64 off + u16 reclen +
/// u8 type.
const DIRENT64_HEADER: usize = 19;

pub(crate) fn getdents64_entry(ctx: &mut SyscallCtx) {
    let fd = ctx.arg(0) as RawFd;
    let Some(vpath) = ctx.fds.dir(fd) else {
        // Untracked descriptors read their physical directory in the kernel.
        return;
    };
    let buf_addr = ctx.arg(1);
    let buf_len = ctx.arg(2) as usize;

    let entries = match ctx.overlay.read_dir(&vpath) {
        Ok(entries) => entries,
        Err(e) => {
            ctx.skip_errno(e.errno());
            return;
        }
    };

    let pos = ctx.fds.pos(fd);
    if pos >= entries.len() {
        ctx.skip_with(0);
        return;
    }

    let (bytes, consumed) = pack_dirents(&entries[pos..], buf_len);
    if consumed == 0 {
        // Not even one record fits, the kernel's answer is EINVAL.
        ctx.skip_errno(Errno::EINVAL);
        return;
    }
    if memory::write_bytes(ctx.pid, buf_addr, &bytes).is_err() {
        ctx.skip_errno(Errno::EFAULT);
        return;
    }

    ctx.fds.set_pos(fd, pos + consumed);
    ctx.skip_with(bytes.len() as i64);
}

/// Packs as many `linux_dirent64` records as fit in `buf_len` bytes:
/// little-endian u64 ino, s64 off, u16 reclen, u8 type, NUL-terminated
/// name, each record padded to 8-byte alignment. Returns the encoded bytes
/// and the number of entries consumed.
fn pack_dirents(entries: &[DirEntry], buf_len: usize) -> (Vec<u8>, usize) {
    let mut out = Vec::new();
    let mut consumed = 0;

    for entry in entries {
        let reclen = (DIRENT64_HEADER + entry.name.len() + 1 + 7) & !7;
        let start = out.len();
        if start + reclen > buf_len {
            break;
        }
        out.extend_from_slice(&entry.ino.to_le_bytes());
        out.extend_from_slice(&entry.off.to_le_bytes());
        out.extend_from_slice(&(reclen as u16).to_le_bytes());
        out.push(entry.file_type);
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
        out.resize(start + reclen, 0);
        consumed += 1;
    }

    (out, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ino: u64, off: i64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            file_type: libc::DT_REG,
            ino,
            off,
        }
    }

    #[test]
    fn test_record_layout() {
        let (bytes, n) = pack_dirents(&[entry("ab", 7, 1)], 4096);
        assert_eq!(n, 1);
        // 19 header bytes + "ab\0" = 22, padded to 24.
        assert_eq!(bytes.len(), 24);
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 7);
        assert_eq!(i64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(bytes[16..18].try_into().unwrap()), 24);
        assert_eq!(bytes[18], libc::DT_REG);
        assert_eq!(&bytes[19..22], b"ab\0");
        assert_eq!(&bytes[22..24], &[0, 0]);
    }

    #[test]
    fn test_records_are_eight_byte_aligned() {
        let names = ["a", "abcd", "abcdefg", "abcdefgh"];
        let entries: Vec<DirEntry> = names
            .iter()
            .enumerate()
            .map(|(i, n)| entry(n, i as u64, i as i64 + 1))
            .collect();
        let (bytes, n) = pack_dirents(&entries, 4096);
        assert_eq!(n, names.len());
        assert_eq!(bytes.len() % 8, 0);

        // Walk the records back out via their reclen chain.
        let mut off = 0;
        let mut seen = Vec::new();
        while off < bytes.len() {
            let reclen =
                u16::from_le_bytes(bytes[off + 16..off + 18].try_into().unwrap()) as usize;
            assert_eq!(off % 8, 0);
            let name_end = bytes[off + DIRENT64_HEADER..off + reclen]
                .iter()
                .position(|&b| b == 0)
                .unwrap();
            seen.push(
                String::from_utf8(
                    bytes[off + DIRENT64_HEADER..off + DIRENT64_HEADER + name_end].to_vec(),
                )
                .unwrap(),
            );
            off += reclen;
        }
        assert_eq!(seen, names);
    }

    #[test]
    fn test_packing_respects_buffer_size() {
        let entries = vec![entry("first", 1, 1), entry("second", 2, 2)];
        // Only the first record (19 + 6 → 32 bytes) fits.
        let (bytes, n) = pack_dirents(&entries, 40);
        assert_eq!(n, 1);
        assert!(bytes.len() <= 40);

        let (rest, n2) = pack_dirents(&entries[n..], 4096);
        assert_eq!(n2, 1);
        assert!(!rest.is_empty());
    }

    #[test]
    fn test_tiny_buffer_packs_nothing() {
        let (bytes, n) = pack_dirents(&[entry("name", 1, 1)], 8);
        assert_eq!(n, 0);
        assert!(bytes.is_empty());
    }
}
