//! Backing-file I/O: reads and writes that respect the real/virtual size
//! split (§3, §6: "reads past the real size up to virtualFilesize return
//! zeros").

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use super::manifest::HASH_BLOCK_SIZE;
use super::model::{Image, ImageState};

/// Path of a `.map`/`.crc`/`.meta` sidecar for a backing file at `path`
/// (§6: `<name>.r<rid>.<ext>`).
pub fn sidecar_path(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

async fn ensure_fd_open(state: &mut ImageState, path: &std::path::Path) -> io::Result<()> {
    if state.fd.is_none() {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        state.fd = Some(file);
    }
    Ok(())
}

/// Read `length` bytes starting at `offset`, zero-filling whatever part of
/// the range falls past `real_size` in the virtual tail.
pub async fn read_range(image: &Image, offset: u64, length: u32) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; length as usize];
    let end = offset + length as u64;
    let real_end = end.min(image.real_size);

    if offset < real_end {
        let readable = (real_end - offset) as usize;
        let mut state = image.state.write().await;
        ensure_fd_open(&mut state, &image.path).await?;
        let file = state.fd.as_mut().expect("just opened");
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut out[..readable]).await?;
    }

    Ok(out)
}

/// Write `data` at `offset` into the backing file. The caller marks the
/// cache-map present only after this returns `Ok`, per the invariant in §3
/// ("a bit in the cache-map is set only after the corresponding bytes are
/// durably written").
pub async fn write_range(image: &Image, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut state = image.state.write().await;
    ensure_fd_open(&mut state, &image.path).await?;
    let file = state.fd.as_mut().expect("just opened");
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

/// Read one full hash-block (real content, zero-padded to the virtual
/// tail), for the integrity checker and the manifest's load-time quick
/// check.
pub async fn read_hash_block(image: &Image, hash_block_idx: u64) -> io::Result<Vec<u8>> {
    let start = hash_block_idx * HASH_BLOCK_SIZE;
    let len = (image.virtual_size.saturating_sub(start)).min(HASH_BLOCK_SIZE) as u32;
    read_range(image, start, len).await
}
