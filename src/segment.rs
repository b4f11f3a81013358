//! Named shared-memory segments and the length-prefixed frame protocol

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

use crate::{
    config::{FabricConfig, PrefixFallback},
    error::{FabricError, Result},
    names,
};

/// Bytes reserved at offset 0 for the little-endian `i32` frame length
pub const FRAME_HEADER_LEN: usize = 4;

/// A named object mapped into this process
pub(crate) struct RawMapping {
    pub(crate) mmap: MmapMut,
    pub(crate) file: File,
    pub(crate) size: usize,
    pub(crate) created: bool,
}

/// Attach to a named shm object, creating it at `requested_size` if absent
///
/// Attaching adopts the existing object's size; an undersized existing
/// object (a creator that died between create and resize) is grown to the
/// requested size. The create race between two processes resolves through
/// `O_EXCL`: the loser re-enters the attach path.
pub(crate) fn map_object(
    object_name: &str,
    requested_size: usize,
    permissions: u32,
) -> Result<RawMapping> {
    let path = names::shm_path(object_name)?;
    let mode = Mode::from_bits_truncate(permissions);

    loop {
        match shm_open(path.as_str(), OFlag::O_RDWR, mode) {
            Ok(fd) => {
                let file = File::from(fd);
                let mut size = file
                    .metadata()
                    .map_err(|e| FabricError::from_io(e, "failed to stat shm object"))?
                    .len() as usize;
                if size < requested_size {
                    file.set_len(requested_size as u64)
                        .map_err(|e| FabricError::from_io(e, "failed to resize shm object"))?;
                    size = requested_size;
                }
                let mmap = map_file(&file, size)?;
                return Ok(RawMapping {
                    mmap,
                    file,
                    size,
                    created: false,
                });
            }
            Err(Errno::ENOENT) => {
                match shm_open(
                    path.as_str(),
                    OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
                    mode,
                ) {
                    Ok(fd) => {
                        let file = File::from(fd);
                        if let Err(e) = file.set_len(requested_size as u64) {
                            let _ = shm_unlink(path.as_str());
                            return Err(FabricError::from_io(e, "failed to size new shm object"));
                        }
                        let mmap = map_file(&file, requested_size)?;
                        return Ok(RawMapping {
                            mmap,
                            file,
                            size: requested_size,
                            created: true,
                        });
                    }
                    // Lost the create race; the winner's object is attachable.
                    Err(Errno::EEXIST) => continue,
                    Err(Errno::EACCES) | Err(Errno::EPERM) => {
                        return Err(FabricError::access_denied(object_name));
                    }
                    Err(e) => {
                        return Err(FabricError::platform(format!(
                            "shm_open({}) failed: {}",
                            path, e
                        )));
                    }
                }
            }
            Err(Errno::EACCES) | Err(Errno::EPERM) => {
                return Err(FabricError::access_denied(object_name));
            }
            Err(e) => {
                return Err(FabricError::platform(format!(
                    "shm_open({}) failed: {}",
                    path, e
                )));
            }
        }
    }
}

fn map_file(file: &File, size: usize) -> Result<MmapMut> {
    unsafe {
        MmapOptions::new()
            .len(size)
            .map_mut(file)
            .map_err(|e| FabricError::from_io(e, "failed to map shm object"))
    }
}

/// Attach or create an object, applying the two-tier privileged-prefix retry
///
/// The privileged name is always attempted first. Under
/// [`PrefixFallback::Lenient`], a permissions-class refusal retries once with
/// the prefix stripped, which keeps cross-process scope within the current
/// session. Returns the mapping together with the object name actually used.
pub(crate) fn map_object_with_fallback(
    config: &FabricConfig,
    object_name: &str,
    size: usize,
) -> Result<(RawMapping, String)> {
    match map_object(object_name, size, config.permissions) {
        Ok(mapping) => Ok((mapping, object_name.to_string())),
        Err(FabricError::AccessDenied { .. })
            if config.fallback == PrefixFallback::Lenient =>
        {
            let session_name = names::strip_prefix(object_name, &config.privileged_prefix)
                .ok_or_else(|| FabricError::access_denied(object_name))?;
            tracing::debug!(
                object = %object_name,
                "privileged namespace refused open, retrying in session scope"
            );
            let mapping = map_object(&session_name, size, config.permissions)?;
            Ok((mapping, session_name))
        }
        Err(e) => Err(e),
    }
}

/// Remove an object name from the shm namespace, ignoring absence
pub(crate) fn unlink_object(object_name: &str) {
    if let Ok(path) = names::shm_path(object_name) {
        let _ = shm_unlink(path.as_str());
    }
}

/// A fixed-size named byte region holding one length-prefixed JSON frame
///
/// The first participant to open a name creates the object; later
/// participants attach to it. Closing detaches this process without
/// removing the name, so a crashed writer never strands attached readers.
///
/// Frame layout is the wire contract: a little-endian `i32` length at
/// offset 0, then that many bytes of UTF-8 JSON at offset 4. Writers must
/// hold the associated mutex across `write_frame`, readers across
/// `read_frame`; the segment itself provides no atomicity.
pub struct SharedSegment {
    object_name: String,
    size: usize,
    mmap: Option<MmapMut>,
    _file: Option<File>,
}

impl SharedSegment {
    /// Attach to the named segment, creating it at `size` if absent
    pub fn open(config: &FabricConfig, object_name: &str, size: usize) -> Result<Self> {
        if size < FRAME_HEADER_LEN + 1 {
            return Err(FabricError::invalid(format!(
                "segment size {} cannot hold a frame",
                size
            )));
        }
        let (mapping, actual_name) = map_object_with_fallback(config, object_name, size)?;
        tracing::debug!(
            object = %actual_name,
            size = mapping.size,
            created = mapping.created,
            "attached shared segment"
        );
        Ok(Self {
            object_name: actual_name,
            size: mapping.size,
            mmap: Some(mapping.mmap),
            _file: Some(mapping.file),
        })
    }

    /// The object name actually in use (post-fallback)
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Total capacity in bytes, including the frame header
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the segment is still mapped
    pub fn is_attached(&self) -> bool {
        self.mmap.is_some()
    }

    /// Write one frame, overwriting the previous one
    ///
    /// Requires `payload.len() + 4 <= size`. The caller must hold the
    /// segment's mutex.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let size = self.size;
        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| FabricError::not_attached(&self.object_name))?;
        if payload.len() > i32::MAX as usize || payload.len() + FRAME_HEADER_LEN > size {
            return Err(FabricError::oversize(
                payload.len(),
                size - FRAME_HEADER_LEN,
            ));
        }
        mmap[..FRAME_HEADER_LEN].copy_from_slice(&(payload.len() as i32).to_le_bytes());
        mmap[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Read the current frame
    ///
    /// A zero length reports `Empty`; a negative or out-of-range length
    /// reports `Invalid`. The caller must hold the segment's mutex.
    pub fn read_frame(&self) -> Result<Vec<u8>> {
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| FabricError::not_attached(&self.object_name))?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&mmap[..FRAME_HEADER_LEN]);
        let len = i32::from_le_bytes(header);
        if len == 0 {
            return Err(FabricError::empty(&self.object_name));
        }
        if len < 0 || len as usize > self.size - FRAME_HEADER_LEN {
            return Err(FabricError::invalid(format!(
                "frame length {} out of range for segment of {} bytes",
                len, self.size
            )));
        }
        Ok(mmap[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len as usize].to_vec())
    }

    /// Raw view of the mapped bytes
    pub fn as_slice(&self) -> Result<&[u8]> {
        self.mmap
            .as_deref()
            .ok_or_else(|| FabricError::not_attached(&self.object_name))
    }

    /// Raw mutable view of the mapped bytes
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.mmap
            .as_deref_mut()
            .ok_or_else(|| FabricError::not_attached(&self.object_name))
    }

    /// Detach from the object, releasing the mapping and descriptor
    ///
    /// The name stays in the namespace for other holders; use
    /// [`crate::purge_provider_objects`] to remove names explicitly.
    pub fn close(&mut self) {
        self.mmap = None;
        self._file = None;
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("object_name", &self.object_name)
            .field("size", &self.size)
            .field("attached", &self.is_attached())
            .finish()
    }
}
