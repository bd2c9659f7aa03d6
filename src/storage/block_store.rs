//! Local block files.
//!
//! Each block of an image lives in its own file under
//! `{data_root}/{image}/{index}`, sized exactly to the image's block
//! size. A missing file reads as zeros and a mis-sized file is treated as
//! corrupt, deleted, and read as zeros; writes re-allocate in both cases,
//! so replicas heal on the next write. Callers hold the relevant
//! per-block lock — nothing here locks.

use crate::types::{UkaiConfig, UkaiError};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

fn image_dir(config: &UkaiConfig, image: &str) -> PathBuf {
    config.data_root.join(image)
}

fn block_path(config: &UkaiConfig, image: &str, block_index: u64) -> PathBuf {
    image_dir(config, image).join(config.block_file_name(block_index))
}

/// Read `size` bytes at `offset` within a block. Absent or corrupt block
/// files yield zeros.
pub fn read(
    config: &UkaiConfig,
    image: &str,
    block_size: u64,
    block_index: u64,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>, UkaiError> {
    let path = block_path(config, image, block_index);
    match fs::metadata(&path) {
        Err(_) => return Ok(vec![0; size as usize]),
        Ok(meta) if meta.len() != block_size => {
            log::warn!(
                "block file {} is {} bytes, expected {}; discarding",
                path.display(),
                meta.len(),
                block_size
            );
            fs::remove_file(&path)?;
            return Ok(vec![0; size as usize]);
        }
        Ok(_) => {}
    }
    let mut file = fs::File::open(&path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0; size as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

/// Write `data` at `offset` within a block, allocating the block file
/// first when it is absent or mis-sized. Returns the written length.
pub fn write(
    config: &UkaiConfig,
    image: &str,
    block_size: u64,
    block_index: u64,
    offset: u64,
    data: &[u8],
) -> Result<u64, UkaiError> {
    let path = block_path(config, image, block_index);
    let needs_allocation = match fs::metadata(&path) {
        Err(_) => true,
        Ok(meta) => meta.len() != block_size,
    };
    if needs_allocation {
        allocate(config, image, block_size, block_index)?;
    }
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(data.len() as u64)
}

/// Create the block file sized to `block_size`. A single zero byte at the
/// last offset keeps the file sparse where the filesystem supports it.
pub fn allocate(
    config: &UkaiConfig,
    image: &str,
    block_size: u64,
    block_index: u64,
) -> Result<(), UkaiError> {
    if block_size == 0 {
        return Err(UkaiError::Invalid("block_size must be positive".to_string()));
    }
    let dir = image_dir(config, image);
    fs::create_dir_all(&dir)?;
    let path = dir.join(config.block_file_name(block_index));
    let mut file = fs::File::create(&path)?;
    file.seek(SeekFrom::Start(block_size - 1))?;
    file.write_all(&[0])?;
    log::debug!("allocated block {} of {} at {}", block_index, image, path.display());
    Ok(())
}

/// Remove the block file; a missing file is not an error.
pub fn deallocate(config: &UkaiConfig, image: &str, block_index: u64) -> Result<(), UkaiError> {
    let path = block_path(config, image, block_index);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove the whole image directory; a missing directory is not an error.
pub fn destroy_image(config: &UkaiConfig, image: &str) -> Result<(), UkaiError> {
    let dir = image_dir(config, image);
    match fs::remove_dir_all(&dir) {
        Ok(()) => {
            log::info!("destroyed local data of {}", image);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
