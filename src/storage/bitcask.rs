use super::{Batch, Range, Scan, Store, Write};
use crate::error::{Error, Result};

use log::debug;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::Path;
use std::sync::Mutex;

/// Size of the blocks read from the log file and kept in the block cache.
const BLOCK_SIZE: usize = 4096;

/// Default block cache capacity, in bytes.
pub const DEFAULT_CACHE_CAPACITY: usize = 600 * 1024 * 1024;

/// Value length marking a deleted key in the log.
const TOMBSTONE: u32 = u32::MAX;

/// A file-backed key/value store using a variant of the BitCask design: an
/// append-only log file of put and delete entries, with an in-memory keydir
/// mapping each live key to the location of its value in the log. The keydir
/// is rebuilt by scanning the log when the store is opened.
///
/// Log entries have the format:
///
/// [key length: u32] [value length: u32] [key] [value]
///
/// Deletes are recorded as an entry with value length u32::MAX and no value
/// bytes. Value reads go through a fixed-size block cache with a configurable
/// byte capacity. Superseded log entries are not reclaimed, like old MVCC
/// versions above this store.
pub struct BitCask {
    log: Log,
    /// Maps keys to the offset and length of their current value in the log.
    keydir: BTreeMap<Vec<u8>, (u64, u32)>,
}

impl BitCask {
    /// Opens or creates a BitCask store at the given path, with the default
    /// block cache capacity.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_cache_capacity(path, DEFAULT_CACHE_CAPACITY)
    }

    /// Opens or creates a BitCask store at the given path, with a block cache
    /// holding at most the given number of bytes.
    pub fn with_cache_capacity(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let keydir = Self::build_keydir(&mut file)?;
        debug!("Opened log {} with {} live keys", path.display(), keydir.len());
        let log = Log { file: Mutex::new(file), cache: Mutex::new(BlockCache::new(capacity)) };
        Ok(Self { log, keydir })
    }

    /// Builds the keydir by scanning the log file.
    fn build_keydir(file: &mut File) -> Result<BTreeMap<Vec<u8>, (u64, u32)>> {
        let size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut keydir = BTreeMap::new();
        let mut header = [0u8; 8];
        let mut len_buf = [0u8; 4];
        let mut pos: u64 = 0;
        while pos < size {
            reader.read_exact(&mut header)?;
            len_buf.copy_from_slice(&header[0..4]);
            let key_len = u32::from_be_bytes(len_buf);
            len_buf.copy_from_slice(&header[4..8]);
            let value_len = u32::from_be_bytes(len_buf);
            pos += 8;

            let mut key = vec![0; key_len as usize];
            reader.read_exact(&mut key)?;
            pos += key_len as u64;

            if value_len == TOMBSTONE {
                keydir.remove(&key);
            } else {
                keydir.insert(key, (pos, value_len));
                reader.seek_relative(value_len as i64)?;
                pos += value_len as u64;
            }
        }
        Ok(keydir)
    }
}

impl std::fmt::Display for BitCask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "bitcask")
    }
}

impl Store for BitCask {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.keydir.get(key) {
            Some((offset, len)) => Ok(Some(self.log.read_value(*offset, *len)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, range: Range) -> Scan<'_> {
        Box::new(
            self.keydir
                .range(range)
                .map(|(key, (offset, len))| Ok((key.clone(), self.log.read_value(*offset, *len)?))),
        )
    }

    fn write(&mut self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let file = self.log.file.get_mut()?;
        let mut pos = file.seek(SeekFrom::End(0))?;
        let appended_at = pos;

        // Stage the keydir updates and apply them only once the batch has been
        // fully written, so a failed write can't leave readers pointing at
        // unwritten data.
        let mut updates = Vec::with_capacity(batch.len());
        let mut writer = BufWriter::new(file);
        for write in &batch {
            match write {
                Write::Put(key, value) => {
                    writer.write_all(&(key.len() as u32).to_be_bytes())?;
                    writer.write_all(&(value.len() as u32).to_be_bytes())?;
                    writer.write_all(key)?;
                    writer.write_all(value)?;
                    pos += 8 + key.len() as u64;
                    updates.push((key.clone(), Some((pos, value.len() as u32))));
                    pos += value.len() as u64;
                }
                Write::Delete(key) => {
                    writer.write_all(&(key.len() as u32).to_be_bytes())?;
                    writer.write_all(&TOMBSTONE.to_be_bytes())?;
                    writer.write_all(key)?;
                    pos += 8 + key.len() as u64;
                    updates.push((key.clone(), None));
                }
            }
        }
        writer.flush()?;
        drop(writer);

        for (key, location) in updates {
            match location {
                Some(location) => self.keydir.insert(key, location),
                None => self.keydir.remove(&key),
            };
        }
        // The last block may have been cached while partially written.
        self.log.cache.get_mut()?.invalidate_from(appended_at);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.log.file.get_mut()?.sync_all()?)
    }
}

impl Drop for BitCask {
    /// Attempt to fsync data on drop, in case we're running without flushes.
    fn drop(&mut self) {
        self.log.file.get_mut().map(|f| f.sync_all()).ok();
    }
}

/// The append-only log file and its block cache. Both are behind mutexes for
/// interior mutability, since reads must seek and populate the cache while
/// the store is behind a shared reference.
struct Log {
    file: Mutex<File>,
    cache: Mutex<BlockCache>,
}

impl Log {
    /// Reads a value from the log at the given location, through the block
    /// cache.
    fn read_value(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let first = offset / BLOCK_SIZE as u64;
        let last = (offset + len as u64 - 1) / BLOCK_SIZE as u64;
        let mut value = Vec::with_capacity(len as usize);
        let mut cache = self.cache.lock()?;
        for id in first..=last {
            if !cache.contains(id) {
                let block = self.read_block(id)?;
                cache.insert(id, block);
            }
            let block = cache
                .get(id)
                .ok_or_else(|| Error::Internal("block missing from cache".into()))?;
            let start = if id == first { (offset % BLOCK_SIZE as u64) as usize } else { 0 };
            let end = if id == last {
                ((offset + len as u64 - 1) % BLOCK_SIZE as u64) as usize + 1
            } else {
                BLOCK_SIZE
            };
            if end > block.len() {
                return Err(Error::Internal("value extends past end of log".into()));
            }
            value.extend_from_slice(&block[start..end]);
        }
        Ok(value)
    }

    /// Reads a single block from the log file. The final block may be shorter
    /// than BLOCK_SIZE.
    fn read_block(&self, id: u64) -> Result<Vec<u8>> {
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(id * BLOCK_SIZE as u64))?;
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        (&mut *file).take(BLOCK_SIZE as u64).read_to_end(&mut block)?;
        Ok(block)
    }
}

/// A FIFO cache of log file blocks, bounded by a byte capacity.
struct BlockCache {
    capacity: usize,
    size: usize,
    blocks: HashMap<u64, Vec<u8>>,
    /// Cached block ids in insertion order, for eviction.
    queue: VecDeque<u64>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, size: 0, blocks: HashMap::new(), queue: VecDeque::new() }
    }

    fn contains(&self, id: u64) -> bool {
        self.blocks.contains_key(&id)
    }

    fn get(&self, id: u64) -> Option<&Vec<u8>> {
        self.blocks.get(&id)
    }

    /// Inserts a block, evicting the oldest blocks while over capacity. The
    /// block being inserted is itself never evicted.
    fn insert(&mut self, id: u64, block: Vec<u8>) {
        self.size += block.len();
        if let Some(old) = self.blocks.insert(id, block) {
            self.size -= old.len();
        } else {
            self.queue.push_back(id);
        }
        while self.size > self.capacity && self.queue.len() > 1 {
            if let Some(evict) = self.queue.pop_front() {
                if let Some(block) = self.blocks.remove(&evict) {
                    self.size -= block.len();
                }
            }
        }
    }

    /// Drops all cached blocks at or past the given file offset. Called when
    /// the log is appended to, since the final block may have been cached
    /// while partially written.
    fn invalidate_from(&mut self, offset: u64) {
        let from = offset / BLOCK_SIZE as u64;
        self.queue.retain(|id| *id < from);
        let stale: Vec<u64> = self.blocks.keys().copied().filter(|id| *id >= from).collect();
        for id in stale {
            if let Some(block) = self.blocks.remove(&id) {
                self.size -= block.len();
            }
        }
    }
}
