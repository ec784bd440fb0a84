//! vdso discovery and symbol table parsing.
//!
//! The native vdso is located through our own maps listing and its
//! symbol table is read in place: program headers to `PT_DYNAMIC`, the
//! dynamic section to hash/symtab/strtab, then the fixed set of symbol
//! names restore relocates. A missing mapping or a malformed image
//! yields an empty table, never an error.
//!
//! The compat (32-bit) checks run in forked helper children because
//! mapping the compat vdso evicts the native one from the address space.

#[cfg(target_arch = "x86_64")]
use std::io;
#[cfg(target_arch = "x86_64")]
use std::os::fd::{AsRawFd, OwnedFd};

use tracing::debug;

#[cfg(target_arch = "x86_64")]
use crate::helper::{probe_in_child, ChildStatus, ScopedChild};
#[cfg(target_arch = "x86_64")]
use crate::probes::owned_fd;
use crate::probes::{read_self_maps, MapsEntry};
use crate::types::{VdsoSymbol, VdsoSymtable};

/// Symbols restore relocates in the native x86_64 vdso.
#[cfg(target_arch = "x86_64")]
const NATIVE_SYMBOLS: &[&str] = &[
    "__vdso_clock_gettime",
    "__vdso_clock_getres",
    "__vdso_getcpu",
    "__vdso_gettimeofday",
    "__vdso_time",
];

/// Symbols restore relocates in the native aarch64 vdso.
#[cfg(target_arch = "aarch64")]
const NATIVE_SYMBOLS: &[&str] = &[
    "__kernel_clock_getres",
    "__kernel_clock_gettime",
    "__kernel_gettimeofday",
    "__kernel_rt_sigreturn",
];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const NATIVE_SYMBOLS: &[&str] = &[];

/// Symbols of the 32-bit compat vdso on x86_64 hosts.
#[cfg(target_arch = "x86_64")]
const COMPAT_SYMBOLS: &[&str] = &[
    "__kernel_vsyscall",
    "__kernel_sigreturn",
    "__kernel_rt_sigreturn",
    "__vdso_clock_gettime",
    "__vdso_gettimeofday",
    "__vdso_time",
];

/// Upper bound on how many names one table can ask for.
const MAX_EXPECTED_SYMBOLS: usize = 8;

/// Sanity cap on a believable vdso mapping.
const MAX_VDSO_LEN: u64 = 1 << 20;

pub fn expected_symbols() -> &'static [&'static str] {
    NATIVE_SYMBOLS
}

/// Combined outcome of the vdso probes.
#[derive(Debug, Clone)]
pub struct VdsoProbe {
    pub table: VdsoSymtable,
    pub hint_reliable: bool,
    pub can_map: bool,
    pub compat: Option<VdsoSymtable>,
}

/// Locate and parse the vdso, and classify the compat-mapping support.
pub fn probe_vdso(task_size: u64) -> VdsoProbe {
    let entries = match read_self_maps() {
        Ok(entries) => entries,
        Err(err) => {
            debug!(error = %err, "maps not readable for vdso discovery");
            return VdsoProbe {
                table: VdsoSymtable::default(),
                hint_reliable: false,
                can_map: false,
                compat: None,
            };
        }
    };

    let vdso = find_named(&entries, "[vdso]");
    let vvar = find_named(&entries, "[vvar]");

    let table = match vdso {
        Some(entry) if entry.end <= task_size && entry.len() <= MAX_VDSO_LEN => {
            parse_vdso_in_place(entry).unwrap_or_else(|| {
                debug!("vdso image did not parse, leaving table empty");
                VdsoSymtable::default()
            })
        }
        Some(_) => {
            debug!("vdso mapping outside the expected address range");
            VdsoSymtable::default()
        }
        None => {
            debug!("no vdso mapping present");
            VdsoSymtable::default()
        }
    };

    let hint_reliable = match (vvar, vdso) {
        (Some(vvar), Some(vdso)) => vvar.start < vdso.start,
        _ => false,
    };

    let can_map = probe_can_map_vdso(vdso);
    let compat = if can_map {
        harvest_compat_table(vdso)
    } else {
        None
    };

    VdsoProbe {
        table,
        hint_reliable,
        can_map,
        compat,
    }
}

fn find_named<'a>(entries: &'a [MapsEntry], name: &str) -> Option<&'a MapsEntry> {
    entries.iter().find(|e| e.path.as_deref() == Some(name))
}

fn parse_vdso_in_place(entry: &MapsEntry) -> Option<VdsoSymtable> {
    let len = usize::try_from(entry.len()).ok()?;
    if len == 0 {
        return None;
    }
    let image = unsafe { std::slice::from_raw_parts(entry.start as *const u8, len) };
    parse_vdso_image(image, expected_symbols())
}

/// Parse a vdso ELF image and resolve `names` to mapping-relative
/// offsets. Returns `None` when the image is not a well-formed
/// little-endian ELF with a dynamic symbol table.
pub fn parse_vdso_image(image: &[u8], names: &[&str]) -> Option<VdsoSymtable> {
    let mut offsets = [u64::MAX; MAX_EXPECTED_SYMBOLS];
    let count = names.len().min(MAX_EXPECTED_SYMBOLS);
    resolve_symbol_offsets(image, &names[..count], &mut offsets[..count])?;

    let symbols = names[..count]
        .iter()
        .zip(&offsets[..count])
        .filter(|(_, &offset)| offset != u64::MAX)
        .map(|(name, &offset)| VdsoSymbol {
            name: (*name).to_string(),
            offset,
        })
        .collect();
    Some(VdsoSymtable {
        len: image.len() as u64,
        symbols,
    })
}

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const DT_NULL: i64 = 0;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;

/// Allocation-free core of the image parse: fills `offsets[i]` with the
/// offset of `names[i]`, `u64::MAX` for unresolved names.
///
/// Also runs inside forked helper children, so it must stay free of
/// heap allocation.
fn resolve_symbol_offsets(image: &[u8], names: &[&str], offsets: &mut [u64]) -> Option<()> {
    for slot in offsets.iter_mut() {
        *slot = u64::MAX;
    }

    if image.get(..4)? != [0x7f, b'E', b'L', b'F'] {
        return None;
    }
    let is64 = match *image.get(4)? {
        ELFCLASS64 => true,
        ELFCLASS32 => false,
        _ => return None,
    };
    if *image.get(5)? != ELFDATA2LSB {
        return None;
    }

    let (phoff, phentsize, phnum) = if is64 {
        (
            read_u64(image, 32)?,
            read_u16(image, 54)? as usize,
            read_u16(image, 56)? as usize,
        )
    } else {
        (
            read_u32(image, 28)? as u64,
            read_u16(image, 42)? as usize,
            read_u16(image, 44)? as usize,
        )
    };
    if phentsize < if is64 { 56 } else { 32 } {
        return None;
    }

    let mut load: Option<(u64, u64)> = None;
    let mut dynamic: Option<(u64, u64)> = None;
    for i in 0..phnum.min(64) {
        let base = usize::try_from(phoff).ok()?.checked_add(i.checked_mul(phentsize)?)?;
        let p_type = read_u32(image, base)?;
        let (p_offset, p_vaddr, p_filesz) = if is64 {
            (
                read_u64(image, base + 8)?,
                read_u64(image, base + 16)?,
                read_u64(image, base + 32)?,
            )
        } else {
            (
                read_u32(image, base + 4)? as u64,
                read_u32(image, base + 8)? as u64,
                read_u32(image, base + 16)? as u64,
            )
        };
        if p_type == PT_LOAD && load.is_none() {
            load = Some((p_vaddr, p_offset));
        } else if p_type == PT_DYNAMIC {
            dynamic = Some((p_vaddr, p_filesz));
        }
    }
    let (load_vaddr, load_offset) = load?;
    let (dyn_vaddr, dyn_size) = dynamic?;

    // Dynamic entries carry virtual addresses; the image is mapped by
    // file offset, so translate through the load segment.
    let to_image_offset = |vaddr: u64| -> Option<usize> {
        let rel = match vaddr.checked_sub(load_vaddr) {
            Some(rel) => rel.checked_add(load_offset)?,
            None => vaddr,
        };
        let off = usize::try_from(rel).ok()?;
        if off < image.len() {
            Some(off)
        } else {
            None
        }
    };

    let dyn_off = to_image_offset(dyn_vaddr)?;
    let dyn_ent = if is64 { 16 } else { 8 };
    let mut hash_vaddr = None;
    let mut strtab_vaddr = None;
    let mut symtab_vaddr = None;
    for i in 0..(usize::try_from(dyn_size).ok()? / dyn_ent).min(64) {
        let base = dyn_off.checked_add(i * dyn_ent)?;
        let (tag, value) = if is64 {
            (read_u64(image, base)? as i64, read_u64(image, base + 8)?)
        } else {
            (
                read_u32(image, base)? as i32 as i64,
                read_u32(image, base + 4)? as u64,
            )
        };
        match tag {
            DT_NULL => break,
            DT_HASH => hash_vaddr = Some(value),
            DT_STRTAB => strtab_vaddr = Some(value),
            DT_SYMTAB => symtab_vaddr = Some(value),
            _ => {}
        }
    }

    let hash_off = to_image_offset(hash_vaddr?)?;
    let strtab_off = to_image_offset(strtab_vaddr?)?;
    let symtab_off = to_image_offset(symtab_vaddr?)?;

    // DT_HASH: nbucket, nchain, then the tables; nchain counts symbols.
    let nchain = read_u32(image, hash_off + 4)? as usize;
    let sym_ent = if is64 { 24 } else { 16 };
    let mut resolved = 0;
    for idx in 0..nchain.min(512) {
        let base = symtab_off.checked_add(idx * sym_ent)?;
        let name_off = read_u32(image, base)? as usize;
        let value = if is64 {
            read_u64(image, base + 8)?
        } else {
            read_u32(image, base + 4)? as u64
        };
        let name = match read_cstr(image, strtab_off.checked_add(name_off)?) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        for (i, wanted) in names.iter().enumerate() {
            if offsets[i] == u64::MAX && name == wanted.as_bytes() {
                offsets[i] = value.checked_sub(load_vaddr).unwrap_or(value);
                resolved += 1;
            }
        }
        if resolved == names.len() {
            break;
        }
    }
    Some(())
}

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    let bytes = data.get(off..off + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let bytes = data.get(off..off + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    let bytes = data.get(off..off + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

fn read_cstr(data: &[u8], off: usize) -> Option<&[u8]> {
    let tail = data.get(off..)?;
    let end = tail.iter().take(128).position(|&b| b == 0)?;
    Some(&tail[..end])
}

/// Scan a raw maps listing for the `[vdso]` line and return its range.
///
/// Allocation-free so it can run in a freshly forked child.
pub(crate) fn find_vdso_range(maps: &[u8]) -> Option<(u64, u64)> {
    for line in maps.split(|&b| b == b'\n') {
        if !ends_with_token(line, b"[vdso]") {
            continue;
        }
        let dash = line.iter().position(|&b| b == b'-')?;
        let space = line.iter().position(|&b| b == b' ')?;
        if dash >= space {
            return None;
        }
        let start = parse_hex(&line[..dash])?;
        let end = parse_hex(&line[dash + 1..space])?;
        if end <= start {
            return None;
        }
        return Some((start, end));
    }
    None
}

fn ends_with_token(line: &[u8], token: &[u8]) -> bool {
    line.len() >= token.len() && &line[line.len() - token.len()..] == token
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    let mut value = 0u64;
    for &b in digits {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | u64::from(nibble);
    }
    Some(value)
}

/// Whether the compat vdso can be mapped on demand.
///
/// Runs in a helper child: the child evicts its own vdso and asks the
/// kernel for the 32-bit image, so the parent's address space is never
/// disturbed.
#[cfg(target_arch = "x86_64")]
fn probe_can_map_vdso(vdso: Option<&MapsEntry>) -> bool {
    const ARCH_MAP_VDSO_32: libc::c_int = 0x2002;
    let range = vdso.map(|e| (e.start, e.len()));
    let exit = probe_in_child(move || {
        if let Some((start, len)) = range {
            unsafe {
                libc::munmap(start as *mut libc::c_void, len as usize);
            }
        }
        let rc = unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_MAP_VDSO_32, 0usize) };
        if rc == 0 {
            return 1;
        }
        match io::Error::last_os_error().raw_os_error() {
            // The call exists but an image is still in the way.
            Some(libc::ENOMEM) | Some(libc::EEXIST) => 1,
            _ => 0,
        }
    });
    matches!(exit, Some(1))
}

#[cfg(not(target_arch = "x86_64"))]
fn probe_can_map_vdso(_vdso: Option<&MapsEntry>) -> bool {
    false
}

/// Map the compat vdso in a helper child and bring its symbol table
/// back over a pipe.
#[cfg(target_arch = "x86_64")]
fn harvest_compat_table(vdso: Option<&MapsEntry>) -> Option<VdsoSymtable> {
    const ARCH_MAP_VDSO_32: libc::c_int = 0x2002;

    let (read_fd, write_fd) = probe_pipe()?;
    // The child inherits the descriptor across fork; only the number is
    // captured so the parent keeps ownership of its copy.
    let write_raw = write_fd.as_raw_fd();
    let range = vdso.map(|e| (e.start, e.len()));
    // Reserved before fork so the child never has to allocate.
    let mut maps_buf = vec![0u8; 256 * 1024];

    let child = ScopedChild::spawn(move || {
        if let Some((start, len)) = range {
            unsafe {
                libc::munmap(start as *mut libc::c_void, len as usize);
            }
        }
        let rc = unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_MAP_VDSO_32, 0usize) };
        if rc != 0 {
            return 2;
        }

        let filled = match read_file_raw(c"/proc/self/maps".as_ptr(), &mut maps_buf) {
            Some(n) => n,
            None => return 3,
        };
        let (start, end) = match find_vdso_range(&maps_buf[..filled]) {
            Some(range) => range,
            None => return 3,
        };
        let len = (end - start) as usize;
        if len as u64 > MAX_VDSO_LEN {
            return 3;
        }
        let image = unsafe { std::slice::from_raw_parts(start as *const u8, len) };

        let mut offsets = [u64::MAX; MAX_EXPECTED_SYMBOLS];
        if resolve_symbol_offsets(image, COMPAT_SYMBOLS, &mut offsets[..COMPAT_SYMBOLS.len()])
            .is_none()
        {
            return 4;
        }

        let mut message = [0u8; 8 * (1 + MAX_EXPECTED_SYMBOLS)];
        message[..8].copy_from_slice(&(len as u64).to_le_bytes());
        for (i, offset) in offsets.iter().enumerate().take(COMPAT_SYMBOLS.len()) {
            message[8 * (i + 1)..8 * (i + 2)].copy_from_slice(&offset.to_le_bytes());
        }
        let want = 8 * (1 + COMPAT_SYMBOLS.len());
        if write_all_raw(write_raw, &message[..want]).is_none() {
            return 5;
        }
        0
    });

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            debug!(error = %err, "could not fork compat vdso helper");
            return None;
        }
    };
    // Close our copy of the write end so the read sees EOF.
    drop(write_fd);

    let mut message = Vec::new();
    {
        use std::io::Read;
        let mut reader = std::fs::File::from(read_fd);
        if let Err(err) = reader.read_to_end(&mut message) {
            debug!(error = %err, "compat vdso pipe read failed");
            return None;
        }
    }

    match child.wait_exit() {
        Ok(ChildStatus::Exited(0)) => {}
        Ok(status) => {
            debug!(?status, "compat vdso helper gave up");
            return None;
        }
        Err(err) => {
            debug!(error = %err, "compat vdso helper reap failed");
            return None;
        }
    }

    let want = 8 * (1 + COMPAT_SYMBOLS.len());
    if message.len() != want {
        debug!(got = message.len(), want, "short compat vdso message");
        return None;
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&message[..8]);
    let len = u64::from_le_bytes(word);
    let symbols = COMPAT_SYMBOLS
        .iter()
        .enumerate()
        .filter_map(|(i, name)| {
            word.copy_from_slice(&message[8 * (i + 1)..8 * (i + 2)]);
            let offset = u64::from_le_bytes(word);
            if offset == u64::MAX {
                None
            } else {
                Some(VdsoSymbol {
                    name: (*name).to_string(),
                    offset,
                })
            }
        })
        .collect();
    Some(VdsoSymtable { len, symbols })
}

#[cfg(not(target_arch = "x86_64"))]
fn harvest_compat_table(_vdso: Option<&MapsEntry>) -> Option<VdsoSymtable> {
    None
}

#[cfg(target_arch = "x86_64")]
fn probe_pipe() -> Option<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        debug!(error = %io::Error::last_os_error(), "pipe for vdso helper failed");
        return None;
    }
    let read_fd = owned_fd(fds[0]).ok()?;
    let write_fd = owned_fd(fds[1]).ok()?;
    Some((read_fd, write_fd))
}

/// Read a file with raw syscalls into a caller-provided buffer.
#[cfg(target_arch = "x86_64")]
fn read_file_raw(path: *const libc::c_char, buf: &mut [u8]) -> Option<usize> {
    let fd = unsafe { libc::open(path, libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return None;
    }
    let mut filled = 0;
    loop {
        if filled == buf.len() {
            break;
        }
        let rc = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if rc < 0 {
            unsafe { libc::close(fd) };
            return None;
        }
        if rc == 0 {
            break;
        }
        filled += rc as usize;
    }
    unsafe { libc::close(fd) };
    Some(filled)
}

#[cfg(target_arch = "x86_64")]
fn write_all_raw(fd: libc::c_int, mut data: &[u8]) -> Option<()> {
    while !data.is_empty() {
        let rc = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if rc <= 0 {
            return None;
        }
        data = &data[rc as usize..];
    }
    Some(())
}
