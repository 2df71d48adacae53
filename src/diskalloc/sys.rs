use std::{fs::File, io, os::unix::fs::MetadataExt, path::Path};

#[cfg(target_os = "linux")]
pub(super) fn allocate(file: &File, size: u64) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    if size == 0 {
        return Ok(true);
    }
    let len = nix::libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "allocation size overflow"))?;
    // KEEP_SIZE reserves blocks without moving EOF, so append mode is unaffected.
    nix::fcntl::fallocate(
        file.as_raw_fd(),
        nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
        0,
        len,
    )
    .map_err(io::Error::from)?;
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
pub(super) fn allocate(_file: &File, _size: u64) -> io::Result<bool> {
    Ok(false)
}

pub(super) fn allocated(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.blocks() * 512)
}

fn statvfs(path: &Path) -> io::Result<nix::sys::statvfs::Statvfs> {
    nix::sys::statvfs::statvfs(path).map_err(io::Error::from)
}

pub(super) fn used_space(path: &Path) -> io::Result<u64> {
    let stat = statvfs(path)?;
    let frag = stat.fragment_size() as u64;
    Ok((stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * frag)
}

pub(super) fn total_space(path: &Path) -> io::Result<u64> {
    let stat = statvfs(path)?;
    Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
}
