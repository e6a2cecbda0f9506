//! Key/value storage engines, including an MVCC transaction layer. For
//! details, see the [`bitcask`] and [`mvcc`] module documentation.

pub mod bitcask;
pub mod memory;
pub mod mvcc;

pub use bitcask::BitCask;
pub use memory::Memory;
pub use mvcc::MVCC;

use crate::error::Result;

use std::fmt::Display;
use std::ops::{Bound, RangeBounds};

/// An ordered byte-keyed store. Reads take shared references, so the MVCC
/// layer can serve concurrent readers behind a reader-writer lock; all
/// mutations go through atomic write batches.
pub trait Store: Display + Send + Sync {
    /// Gets a value for a key, if it exists.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterates over an ordered range of key/value pairs.
    fn scan(&self, range: Range) -> Scan<'_>;

    /// Applies a batch of writes atomically: either every put and delete in
    /// the batch is visible to subsequent reads, or none are.
    fn write(&mut self, batch: Batch) -> Result<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> Result<()>;
}

/// Iterator over a key/value range.
pub type Scan<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// A write in a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of writes applied as a single atomic unit. Batches are single-use
/// and scoped to one operation.
pub type Batch = Vec<Write>;

/// A scan range.
pub struct Range {
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
}

impl Range {
    /// Creates a new range from the given Rust range. We can't use the
    /// RangeBounds directly in scan() since that prevents us from using
    /// Store as a trait object.
    pub fn from<R: RangeBounds<Vec<u8>>>(range: R) -> Self {
        Self {
            start: match range.start_bound() {
                Bound::Included(v) => Bound::Included(v.to_vec()),
                Bound::Excluded(v) => Bound::Excluded(v.to_vec()),
                Bound::Unbounded => Bound::Unbounded,
            },
            end: match range.end_bound() {
                Bound::Included(v) => Bound::Included(v.to_vec()),
                Bound::Excluded(v) => Bound::Excluded(v.to_vec()),
                Bound::Unbounded => Bound::Unbounded,
            },
        }
    }
}

impl RangeBounds<Vec<u8>> for Range {
    fn start_bound(&self) -> Bound<&Vec<u8>> {
        match &self.start {
            Bound::Included(v) => Bound::Included(v),
            Bound::Excluded(v) => Bound::Excluded(v),
            Bound::Unbounded => Bound::Unbounded,
        }
    }

    fn end_bound(&self) -> Bound<&Vec<u8>> {
        match &self.end {
            Bound::Included(v) => Bound::Included(v),
            Bound::Excluded(v) => Bound::Excluded(v),
            Bound::Unbounded => Bound::Unbounded,
        }
    }
}

#[cfg(test)]
pub(crate) trait TestSuite<S: Store> {
    fn setup() -> Result<S>;

    fn test() -> Result<()> {
        Self::test_get()?;
        Self::test_delete()?;
        Self::test_scan()?;
        Self::test_write_atomic()?;
        Self::test_random()?;
        Ok(())
    }

    fn set(store: &mut S, key: &[u8], value: Vec<u8>) -> Result<()> {
        store.write(vec![Write::Put(key.to_vec(), value)])
    }

    fn delete(store: &mut S, key: &[u8]) -> Result<()> {
        store.write(vec![Write::Delete(key.to_vec())])
    }

    fn test_get() -> Result<()> {
        let mut s = Self::setup()?;
        Self::set(&mut s, b"a", vec![0x01])?;
        assert_eq!(Some(vec![0x01]), s.get(b"a")?);
        assert_eq!(None, s.get(b"b")?);
        Self::set(&mut s, b"a", vec![0x02])?;
        assert_eq!(Some(vec![0x02]), s.get(b"a")?);
        Ok(())
    }

    fn test_delete() -> Result<()> {
        let mut s = Self::setup()?;
        Self::set(&mut s, b"a", vec![0x01])?;
        assert_eq!(Some(vec![0x01]), s.get(b"a")?);
        Self::delete(&mut s, b"a")?;
        assert_eq!(None, s.get(b"a")?);
        Self::delete(&mut s, b"b")?;
        Ok(())
    }

    fn test_scan() -> Result<()> {
        let mut s = Self::setup()?;
        Self::set(&mut s, b"a", vec![0x01])?;
        Self::set(&mut s, b"b", vec![0x02])?;
        Self::set(&mut s, b"ba", vec![0x02, 0x01])?;
        Self::set(&mut s, b"bb", vec![0x02, 0x02])?;
        Self::set(&mut s, b"c", vec![0x03])?;

        // Bounded ranges
        assert_eq!(
            vec![
                (b"b".to_vec(), vec![0x02]),
                (b"ba".to_vec(), vec![0x02, 0x01]),
                (b"bb".to_vec(), vec![0x02, 0x02]),
            ],
            s.scan(Range::from(b"b".to_vec()..b"bz".to_vec())).collect::<Result<Vec<_>>>()?
        );

        // Inclusive/exclusive ranges
        assert_eq!(
            vec![(b"b".to_vec(), vec![0x02]), (b"ba".to_vec(), vec![0x02, 0x01])],
            s.scan(Range::from(b"b".to_vec()..b"bb".to_vec())).collect::<Result<Vec<_>>>()?
        );
        assert_eq!(
            vec![
                (b"b".to_vec(), vec![0x02]),
                (b"ba".to_vec(), vec![0x02, 0x01]),
                (b"bb".to_vec(), vec![0x02, 0x02]),
            ],
            s.scan(Range::from(b"b".to_vec()..=b"bb".to_vec())).collect::<Result<Vec<_>>>()?
        );

        // Open ranges
        assert_eq!(
            vec![(b"bb".to_vec(), vec![0x02, 0x02]), (b"c".to_vec(), vec![0x03])],
            s.scan(Range::from(b"bb".to_vec()..)).collect::<Result<Vec<_>>>()?
        );
        assert_eq!(
            vec![(b"a".to_vec(), vec![0x01]), (b"b".to_vec(), vec![0x02])],
            s.scan(Range::from(..=b"b".to_vec())).collect::<Result<Vec<_>>>()?
        );

        // Full range
        assert_eq!(
            vec![
                (b"a".to_vec(), vec![0x01]),
                (b"b".to_vec(), vec![0x02]),
                (b"ba".to_vec(), vec![0x02, 0x01]),
                (b"bb".to_vec(), vec![0x02, 0x02]),
                (b"c".to_vec(), vec![0x03]),
            ],
            s.scan(Range::from(..)).collect::<Result<Vec<_>>>()?
        );
        Ok(())
    }

    fn test_write_atomic() -> Result<()> {
        let mut s = Self::setup()?;
        Self::set(&mut s, b"a", vec![0x01])?;
        s.write(vec![
            Write::Put(b"b".to_vec(), vec![0x02]),
            Write::Delete(b"a".to_vec()),
            Write::Put(b"c".to_vec(), vec![0x03]),
        ])?;
        assert_eq!(None, s.get(b"a")?);
        assert_eq!(Some(vec![0x02]), s.get(b"b")?);
        assert_eq!(Some(vec![0x03]), s.get(b"c")?);

        // An empty batch is a no-op.
        s.write(Vec::new())?;
        assert_eq!(
            vec![(b"b".to_vec(), vec![0x02]), (b"c".to_vec(), vec![0x03])],
            s.scan(Range::from(..)).collect::<Result<Vec<_>>>()?
        );
        Ok(())
    }

    fn test_random() -> Result<()> {
        use rand::Rng;
        let mut s = Self::setup()?;
        let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(397_427_893);

        // Create a bunch of random items and insert them
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for i in 0..1000_u64 {
            items.push((rng.gen::<[u8; 32]>().to_vec(), i.to_be_bytes().to_vec()))
        }
        for (key, value) in items.iter() {
            Self::set(&mut s, key, value.clone())?;
        }

        // Fetch the random items, both via get() and scan()
        for (key, value) in items.iter() {
            assert_eq!(s.get(key)?, Some(value.clone()))
        }
        let mut expect = items.clone();
        expect.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(expect, s.scan(Range::from(..)).collect::<Result<Vec<_>>>()?);

        // Remove the items
        for (key, _) in items {
            Self::delete(&mut s, &key)?;
            assert_eq!(None, s.get(&key)?);
        }
        assert!(s.scan(Range::from(..)).collect::<Result<Vec<_>>>()?.is_empty());

        Ok(())
    }
}
