//! Word-granular reads and writes in a tracee's address space.
//!
//! ptrace peek/poke move one machine word at a time; these helpers deal with
//! the unaligned head/tail fragments (read-modify-write of the enclosing
//! word) and tolerate partial reads at unmapped page boundaries. The
//! chunking logic is written over injected word accessors so it can be
//! exercised against a fake address space without a live tracee.

use nix::sys::ptrace::{self, AddressType};
use nix::unistd::Pid;

const WORD: usize = std::mem::size_of::<libc::c_long>();

fn peek(pid: Pid, addr: u64) -> nix::Result<libc::c_long> {
    ptrace::read(pid, addr as usize as AddressType)
}

fn poke(pid: Pid, addr: u64, word: libc::c_long) -> nix::Result<()> {
    unsafe { ptrace::write(pid, addr as usize as AddressType, word) }
}

/// Reads a NUL-terminated string of at most `max_len` bytes. Returns None on
/// a null address, an unreadable or unterminated buffer, or non-UTF-8 bytes
/// (paths we cannot represent are never intercepted).
pub fn read_string(pid: Pid, addr: u64, max_len: usize) -> Option<String> {
    read_string_with(|a| peek(pid, a), addr, max_len)
}

/// Fills `buf` from tracee memory. A failed peek past the first word returns
/// the length of the prefix read so far; only a failure on the very first
/// word is an error.
pub fn read_bytes(pid: Pid, addr: u64, buf: &mut [u8]) -> nix::Result<usize> {
    read_bytes_with(|a| peek(pid, a), addr, buf)
}

/// Writes `data` into tracee memory, preserving the bytes around unaligned
/// head and tail fragments.
pub fn write_bytes(pid: Pid, addr: u64, data: &[u8]) -> nix::Result<()> {
    write_bytes_with(|a| peek(pid, a), |a, w| poke(pid, a, w), addr, data)
}

/// Writes `s` plus a NUL terminator.
pub fn write_string(pid: Pid, addr: u64, s: &str) -> nix::Result<()> {
    let mut data = Vec::with_capacity(s.len() + 1);
    data.extend_from_slice(s.as_bytes());
    data.push(0);
    write_bytes(pid, addr, &data)
}

fn read_string_with<P>(peek: P, addr: u64, max_len: usize) -> Option<String>
where
    P: Fn(u64) -> nix::Result<libc::c_long>,
{
    if addr == 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(64);
    let mut off = 0usize;
    while off < max_len {
        let word = peek(addr.wrapping_add(off as u64)).ok()?;
        for b in word.to_ne_bytes() {
            if b == 0 {
                return String::from_utf8(bytes).ok();
            }
            bytes.push(b);
            if bytes.len() >= max_len {
                return String::from_utf8(bytes).ok();
            }
        }
        off += WORD;
    }
    String::from_utf8(bytes).ok()
}

fn read_bytes_with<P>(peek: P, addr: u64, buf: &mut [u8]) -> nix::Result<usize>
where
    P: Fn(u64) -> nix::Result<libc::c_long>,
{
    if buf.is_empty() {
        return Ok(0);
    }
    let words = buf.len().div_ceil(WORD);
    for i in 0..words {
        match peek(addr.wrapping_add((i * WORD) as u64)) {
            Ok(word) => {
                let start = i * WORD;
                let end = (start + WORD).min(buf.len());
                buf[start..end].copy_from_slice(&word.to_ne_bytes()[..end - start]);
            }
            Err(e) if i == 0 => return Err(e),
            Err(_) => return Ok(i * WORD),
        }
    }
    Ok(buf.len())
}

fn write_bytes_with<P, Q>(peek: P, poke: Q, addr: u64, data: &[u8]) -> nix::Result<()>
where
    P: Fn(u64) -> nix::Result<libc::c_long>,
    Q: Fn(u64, libc::c_long) -> nix::Result<()>,
{
    if data.is_empty() {
        return Ok(());
    }

    let mut addr = addr;
    let mut data = data;

    let head = (addr as usize) % WORD;
    if head != 0 {
        let aligned = addr - head as u64;
        let mut word = peek(aligned)?.to_ne_bytes();
        let n = (WORD - head).min(data.len());
        word[head..head + n].copy_from_slice(&data[..n]);
        poke(aligned, libc::c_long::from_ne_bytes(word))?;
        data = &data[n..];
        addr = aligned.wrapping_add(WORD as u64);
    }

    while data.len() >= WORD {
        let mut word = [0u8; WORD];
        word.copy_from_slice(&data[..WORD]);
        poke(addr, libc::c_long::from_ne_bytes(word))?;
        data = &data[WORD..];
        addr = addr.wrapping_add(WORD as u64);
    }

    if !data.is_empty() {
        let mut word = peek(addr)?.to_ne_bytes();
        word[..data.len()].copy_from_slice(data);
        poke(addr, libc::c_long::from_ne_bytes(word))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::cell::RefCell;

    const BASE: u64 = 0x7f00_0000_1000;

    /// Word-granular fake of a tracee address space: a flat mapping at
    /// [`BASE`], faulting on any word that reaches past its end.
    struct FakeMem {
        bytes: RefCell<Vec<u8>>,
    }

    impl FakeMem {
        fn new(init: &[u8]) -> Self {
            Self {
                bytes: RefCell::new(init.to_vec()),
            }
        }

        fn peek(&self, addr: u64) -> nix::Result<libc::c_long> {
            let off = addr.checked_sub(BASE).ok_or(Errno::EFAULT)? as usize;
            let bytes = self.bytes.borrow();
            if off + WORD > bytes.len() {
                return Err(Errno::EFAULT);
            }
            let mut word = [0u8; WORD];
            word.copy_from_slice(&bytes[off..off + WORD]);
            Ok(libc::c_long::from_ne_bytes(word))
        }

        fn poke(&self, addr: u64, word: libc::c_long) -> nix::Result<()> {
            let off = addr.checked_sub(BASE).ok_or(Errno::EFAULT)? as usize;
            let mut bytes = self.bytes.borrow_mut();
            if off + WORD > bytes.len() {
                return Err(Errno::EFAULT);
            }
            bytes[off..off + WORD].copy_from_slice(&word.to_ne_bytes());
            Ok(())
        }

        fn read_string(&self, addr: u64, max_len: usize) -> Option<String> {
            read_string_with(|a| self.peek(a), addr, max_len)
        }

        fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> nix::Result<usize> {
            read_bytes_with(|a| self.peek(a), addr, buf)
        }

        fn write_bytes(&self, addr: u64, data: &[u8]) -> nix::Result<()> {
            write_bytes_with(|a| self.peek(a), |a, w| self.poke(a, w), addr, data)
        }

        fn write_string(&self, addr: u64, s: &str) -> nix::Result<()> {
            let mut data = Vec::with_capacity(s.len() + 1);
            data.extend_from_slice(s.as_bytes());
            data.push(0);
            self.write_bytes(addr, &data)
        }
    }

    #[test]
    fn test_read_string_stops_at_first_nul() {
        let mem = FakeMem::new(b"hello\0trailing-garbage\0\0");
        assert_eq!(mem.read_string(BASE, 4096).as_deref(), Some("hello"));
    }

    #[test]
    fn test_read_string_null_address() {
        let mem = FakeMem::new(b"irrelevant\0\0\0\0\0\0");
        assert_eq!(read_string_with(|a| mem.peek(a), 0, 4096), None);
    }

    #[test]
    fn test_read_string_honors_max_len() {
        let mem = FakeMem::new(&[b'a'; 32]);
        assert_eq!(mem.read_string(BASE, 8).as_deref(), Some("aaaaaaaa"));
    }

    #[test]
    fn test_read_string_unterminated_buffer_is_none() {
        // One mapped word of non-NUL bytes, then a fault: no terminator was
        // ever seen, so the read does not produce a truncated path.
        let mem = FakeMem::new(&[b'a'; WORD]);
        assert_eq!(mem.read_string(BASE, 4096), None);
    }

    #[test]
    fn test_read_string_rejects_non_utf8() {
        let mem = FakeMem::new(&[0xff, 0xfe, b'x', 0, 0, 0, 0, 0]);
        assert_eq!(mem.read_string(BASE, 4096), None);
    }

    #[test]
    fn test_read_bytes_full_and_partial_tail_word() {
        let mem = FakeMem::new(b"0123456789abcdef");
        let mut buf = [0u8; 11];
        assert_eq!(mem.read_bytes(BASE, &mut buf).unwrap(), 11);
        assert_eq!(&buf, b"0123456789a");
    }

    #[test]
    fn test_read_bytes_returns_prefix_at_fault() {
        // Only one word is mapped; a 3-word read comes back with the prefix.
        let mem = FakeMem::new(&[7u8; WORD]);
        let mut buf = [0u8; 3 * WORD];
        assert_eq!(mem.read_bytes(BASE, &mut buf).unwrap(), WORD);
        assert_eq!(&buf[..WORD], &[7u8; WORD]);
    }

    #[test]
    fn test_read_bytes_first_word_fault_is_an_error() {
        let mem = FakeMem::new(&[0u8; WORD]);
        let mut buf = [0u8; 4];
        assert_eq!(
            mem.read_bytes(BASE - WORD as u64, &mut buf),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn test_write_bytes_unaligned_preserves_neighbors() {
        let mem = FakeMem::new(&[0xaa; 4 * WORD]);
        // Head and tail both land mid-word.
        mem.write_bytes(BASE + 3, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();

        let bytes = mem.bytes.borrow();
        assert_eq!(&bytes[..3], &[0xaa, 0xaa, 0xaa]);
        assert_eq!(&bytes[3..13], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(bytes[13..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_write_bytes_whole_words() {
        let mem = FakeMem::new(&[0u8; 2 * WORD]);
        let data: Vec<u8> = (1..=2 * WORD as u8).collect();
        mem.write_bytes(BASE, &data).unwrap();
        assert_eq!(*mem.bytes.borrow(), data);
    }

    #[test]
    fn test_write_bytes_fault_surfaces() {
        let mem = FakeMem::new(&[0u8; WORD]);
        assert_eq!(
            mem.write_bytes(BASE, &[1u8; 2 * WORD]),
            Err(Errno::EFAULT)
        );
    }

    #[test]
    fn test_write_string_read_string_round_trip() {
        let mem = FakeMem::new(&[0xaa; 4 * WORD]);
        mem.write_string(BASE + 5, "/upper/a/b.txt").unwrap();
        assert_eq!(
            mem.read_string(BASE + 5, 4096).as_deref(),
            Some("/upper/a/b.txt")
        );
        // Bytes before the write are untouched.
        assert!(mem.bytes.borrow()[..5].iter().all(|&b| b == 0xaa));
    }
}
