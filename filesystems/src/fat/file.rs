// Regular file access on a mounted volume
// A `FatFile` is a plain handle; every operation goes through the volume
// that opened it. Size and first cluster are written back to the directory
// entry after each write.

use super::dir_entry::{attributes::*, DirEntry};
use super::directory::DirLocation;
use super::volume::FatVolume;
use fat2fs_core::{BlockDevice, FatError, FatResult};
use log::{debug, trace};
use std::io::SeekFrom;

/// How to open a file. Mirrors `std::fs::OpenOptions`.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    fn wants_write(&self) -> bool {
        self.write || self.append
    }
}

/// Open file handle
#[derive(Debug)]
pub struct FatFile {
    path: String,
    entry: DirEntry,
    location: DirLocation,
    position: u64,
    readable: bool,
    writable: bool,
    append: bool,
    /// Last (chain index, cluster) visited, for sequential access
    cursor: Option<(u32, u32)>,
}

impl FatFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.entry.file_size as u64
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn first_cluster(&self) -> u32 {
        self.entry.first_cluster()
    }

    /// Move the file position. Seeking past the end is allowed; a later
    /// write fills the gap with zeros.
    pub fn seek(&mut self, pos: SeekFrom) -> FatResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            FatError::InvalidInput(format!("seek to {:?} from {} is out of range", pos, self.position))
        })?;
        Ok(self.position)
    }
}

impl<D: BlockDevice> FatVolume<D> {
    /// Open the file at `path`
    pub fn open(&mut self, path: &str, options: &OpenOptions) -> FatResult<FatFile> {
        let creating = options.create || options.create_new;
        if (options.wants_write() || creating || options.truncate) && !self.is_writable() {
            return Err(FatError::ReadOnly);
        }
        if (creating || options.truncate) && !options.wants_write() {
            return Err(FatError::InvalidInput("create and truncate need write access".to_string()));
        }

        let (parent, name) = self.resolve_parent(path)?;
        let record = match self.find_entry(parent, name)? {
            Some(_) if options.create_new => return Err(FatError::AlreadyExists(path.to_string())),
            Some(record) => record,
            None if creating => {
                debug!("Creating {}", path);
                self.create_entry(parent, name, ATTR_ARCHIVE, 0, 0)?
            }
            None => return Err(FatError::NotFound(path.to_string())),
        };

        if record.is_directory() {
            return Err(FatError::IsADirectory(path.to_string()));
        }
        if options.wants_write() && record.attributes() & ATTR_READ_ONLY != 0 {
            return Err(FatError::InvalidInput(format!("{} has the read-only attribute", path)));
        }

        let mut file = FatFile {
            path: path.to_string(),
            entry: record.entry,
            location: record.location,
            position: 0,
            readable: options.read || !options.wants_write(),
            writable: options.wants_write(),
            append: options.append,
            cursor: None,
        };

        if options.truncate && file.size() > 0 {
            self.truncate(&mut file, 0)?;
        }
        if options.append {
            file.position = file.size();
        }
        Ok(file)
    }

    /// Cluster holding chain position `index`. With `grow` set, missing
    /// clusters are allocated on the way.
    fn file_cluster(&mut self, file: &mut FatFile, index: u32, grow: bool) -> FatResult<u32> {
        if file.first_cluster() == 0 {
            if !grow {
                return Err(FatError::ChainCorrupted(format!("{} has data but no clusters", file.path)));
            }
            let first = self.allocate_cluster(None)?;
            file.entry.set_first_cluster(first);
            self.update_entry(file.location, &file.entry)?;
            file.cursor = Some((0, first));
        }

        let (mut idx, mut cluster) = match file.cursor {
            Some((i, c)) if i <= index => (i, c),
            _ => (0, file.first_cluster()),
        };

        while idx < index {
            cluster = match self.next_cluster(cluster)? {
                Some(next) => next,
                None if grow => self.allocate_cluster(Some(cluster))?,
                None => {
                    return Err(FatError::ChainCorrupted(format!(
                        "chain of {} ends before its size of {} bytes",
                        file.path,
                        file.size()
                    )))
                }
            };
            idx += 1;
        }

        file.cursor = Some((idx, cluster));
        Ok(cluster)
    }

    /// Sector and in-sector offset of byte `pos` of the file
    fn locate(&mut self, file: &mut FatFile, pos: u64, grow: bool) -> FatResult<(u32, usize)> {
        let bpc = self.geometry.bytes_per_cluster() as u64;
        let bps = self.geometry.bytes_per_sector as u64;
        let cluster = self.file_cluster(file, (pos / bpc) as u32, grow)?;
        let in_cluster = pos % bpc;
        let sector = self.geometry.cluster_to_sector(cluster) + (in_cluster / bps) as u32;
        Ok((sector, (in_cluster % bps) as usize))
    }

    /// Read from the current position. Returns 0 at or past end of file.
    pub fn read(&mut self, file: &mut FatFile, buf: &mut [u8]) -> FatResult<usize> {
        if !file.readable {
            return Err(FatError::InvalidInput(format!("{} is not open for reading", file.path)));
        }
        if file.position >= file.size() || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min((file.size() - file.position) as usize);
        let bps = self.geometry.bytes_per_sector as usize;
        let mut sector_buf = vec![0u8; bps];
        let mut done = 0;

        while done < len {
            let pos = file.position;
            let (sector, offset) = self.locate(file, pos, false)?;
            let n = (bps - offset).min(len - done);
            self.device.read_blocks(sector as u64, 1, &mut sector_buf)?;
            buf[done..done + n].copy_from_slice(&sector_buf[offset..offset + n]);
            done += n;
            file.position += n as u64;
        }

        trace!("Read {} bytes from {}", done, file.path);
        Ok(done)
    }

    /// Write at the current position, growing the file as needed. A write
    /// that fails part way returns the bytes that made it to disk.
    pub fn write(&mut self, file: &mut FatFile, data: &[u8]) -> FatResult<usize> {
        self.ensure_writable()?;
        if !file.writable {
            return Err(FatError::InvalidInput(format!("{} is not open for writing", file.path)));
        }
        if data.is_empty() {
            return Ok(0);
        }
        if file.append {
            file.position = file.size();
        }
        if file.position + data.len() as u64 > u32::MAX as u64 {
            return Err(FatError::InvalidInput("FAT files are limited to 4 GiB - 1".to_string()));
        }

        if file.position > file.size() {
            let target = file.position;
            self.fill_zeros(file, target)?;
        }

        let start = file.position;
        let result = self.write_at_position(file, data);
        let written = (file.position - start) as usize;
        self.sync_entry(file)?;

        match result {
            Ok(_) => {
                trace!("Wrote {} bytes to {}", written, file.path);
                Ok(written)
            }
            Err(e) if written > 0 => {
                debug!("Short write to {} after {} bytes: {}", file.path, written, e);
                Ok(written)
            }
            Err(e) => Err(e),
        }
    }

    /// Extend the file with zeros up to `target`
    fn fill_zeros(&mut self, file: &mut FatFile, target: u64) -> FatResult<()> {
        let zeros = vec![0u8; self.geometry.bytes_per_cluster() as usize];
        file.position = file.size();
        while file.position < target {
            let n = ((target - file.position) as usize).min(zeros.len());
            self.write_at_position(file, &zeros[..n])?;
            self.sync_entry(file)?;
        }
        Ok(())
    }

    /// Copy `data` to disk at the file position, advancing the position and
    /// the in-memory size as each sector lands.
    fn write_at_position(&mut self, file: &mut FatFile, data: &[u8]) -> FatResult<usize> {
        let bps = self.geometry.bytes_per_sector as usize;
        let mut sector_buf = vec![0u8; bps];
        let mut done = 0;

        while done < data.len() {
            let pos = file.position;
            let (sector, offset) = self.locate(file, pos, true)?;
            let n = (bps - offset).min(data.len() - done);

            if n == bps {
                self.device.write_blocks(sector as u64, 1, &data[done..done + n])?;
            } else {
                self.device.read_blocks(sector as u64, 1, &mut sector_buf)?;
                sector_buf[offset..offset + n].copy_from_slice(&data[done..done + n]);
                self.device.write_blocks(sector as u64, 1, &sector_buf)?;
            }

            done += n;
            file.position += n as u64;
            if file.position > file.size() {
                file.entry.file_size = file.position as u32;
            }
        }
        Ok(done)
    }

    /// Write size, first cluster and timestamps back to the directory entry
    fn sync_entry(&mut self, file: &mut FatFile) -> FatResult<()> {
        file.entry.touch();
        self.update_entry(file.location, &file.entry)
    }

    /// Shrink the file to `size` bytes, releasing clusters past the end
    pub fn truncate(&mut self, file: &mut FatFile, size: u64) -> FatResult<()> {
        self.ensure_writable()?;
        if !file.writable {
            return Err(FatError::InvalidInput(format!("{} is not open for writing", file.path)));
        }
        if size >= file.size() {
            return Ok(());
        }

        let first = file.first_cluster();
        if first != 0 {
            if size == 0 {
                self.free_chain(first)?;
                file.entry.set_first_cluster(0);
            } else {
                let bpc = self.geometry.bytes_per_cluster() as u64;
                let keep = self.file_cluster(file, ((size - 1) / bpc) as u32, false)?;
                self.truncate_chain(keep)?;
            }
        }

        file.entry.file_size = size as u32;
        file.cursor = None;
        if file.position > size {
            file.position = size;
        }
        self.sync_entry(file)?;
        debug!("Truncated {} to {} bytes", file.path, size);
        Ok(())
    }

    /// Release the handle. Everything is already on disk.
    pub fn close(&mut self, file: FatFile) -> FatResult<()> {
        trace!("Closed {} ({} bytes)", file.path, file.size());
        Ok(())
    }

    /// Whole contents of the file at `path`
    pub fn read_file(&mut self, path: &str) -> FatResult<Vec<u8>> {
        let mut file = self.open(path, OpenOptions::new().read(true))?;
        let mut data = vec![0u8; file.size() as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.read(&mut file, &mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        self.close(file)?;
        Ok(data)
    }

    /// Create or replace the file at `path` with `data`
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> FatResult<()> {
        let mut file = self.open(path, OpenOptions::new().write(true).create(true).truncate(true))?;
        let written = self.write(&mut file, data)?;
        if written < data.len() {
            return Err(FatError::DiskFull);
        }
        self.close(file)
    }
}
