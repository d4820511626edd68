use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to open image file {path}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to stat image file {path}: {source}")]
    Stat {
        path: PathBuf,
        source: io::Error,
    },
    #[error("image file {path} is empty")]
    Empty { path: PathBuf },
    #[error("failed to map image file {path}: {source}")]
    Map {
        path: PathBuf,
        source: io::Error,
    },
}

/// The test image, mapped read/write/execute.
///
/// The mapping is private and writable because the image carries the memory
/// block for store testing inside itself. The bottom of the mapping is the
/// code entry point. Never unmapped: the process lives exactly as long as
/// the test.
pub struct Image {
    base: *mut libc::c_void,
    len: usize,
}

impl Image {
    pub fn load(path: &Path) -> Result<Image, ImageError> {
        let file = File::open(path).map_err(|source| ImageError::Open {
            path: path.to_owned(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| ImageError::Stat {
                path: path.to_owned(),
                source,
            })?
            .len() as usize;
        if len == 0 {
            return Err(ImageError::Empty {
                path: path.to_owned(),
            });
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ImageError::Map {
                path: path.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Image { base, len })
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Jump to the image's entry point.
    ///
    /// # Safety
    ///
    /// The image must contain valid machine code for the current
    /// architecture, starting at the bottom of the mapping. Control only
    /// comes back if the image returns, which a well-formed test image
    /// never does (it ends with an end-of-test marker instead).
    pub unsafe fn enter(&self) {
        let entry: extern "C" fn() = std::mem::transmute(self.base);
        entry();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_maps_the_whole_file() {
        // In the build directory rather than /tmp: mapping with PROT_EXEC
        // needs a filesystem that is not mounted noexec.
        let mut file = tempfile::NamedTempFile::new_in(".").unwrap();
        file.write_all(&[0xd5u8, 0x03, 0x20, 0x1f]).unwrap(); // arbitrary bytes
        file.flush().unwrap();

        let image = Image::load(file.path()).unwrap();
        assert_ne!(image.base(), 0);
        assert_eq!(image.len(), 4);
        let mapped = unsafe { std::slice::from_raw_parts(image.base() as *const u8, 4) };
        assert_eq!(mapped, &[0xd5, 0x03, 0x20, 0x1f]);
    }

    #[test]
    fn empty_image_is_rejected() {
        let file = tempfile::NamedTempFile::new_in(".").unwrap();
        assert!(matches!(
            Image::load(file.path()),
            Err(ImageError::Empty { .. })
        ));
    }

    #[test]
    fn missing_image_is_rejected() {
        assert!(matches!(
            Image::load(Path::new("no-such-image.bin")),
            Err(ImageError::Open { .. })
        ));
    }
}
