//! Heap-backed storage.

use super::{check_access, DType, Dataset, Storage, StorageKind};
use crate::error::{ChunkError, Result};
use crate::plan::ChunkRange;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

enum Slot {
    /// Buffer released by its last handle.
    Idle(Vec<f64>),
    /// Buffer currently owned by an open handle of the given length.
    Open(usize),
}

type Registry = Rc<RefCell<HashMap<String, Slot>>>;

/// Storage keeping every dataset in a heap buffer.
///
/// Closing a handle parks its buffer so [`Storage::open`] can hand it out
/// again; [`Storage::create`] always starts from zeros.
#[derive(Default)]
pub struct MemoryStorage {
    arrays: Registry,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, name: &str, data: Vec<f64>) -> Box<dyn Dataset> {
        self.arrays
            .borrow_mut()
            .insert(name.to_string(), Slot::Open(data.len()));
        Box::new(MemoryDataset {
            name: name.to_string(),
            data,
            registry: Rc::clone(&self.arrays),
            released: false,
        })
    }
}

impl Storage for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn create(&mut self, name: &str, len: usize, _dtype: DType) -> Result<Box<dyn Dataset>> {
        if matches!(self.arrays.borrow().get(name), Some(Slot::Open(_))) {
            return Err(ChunkError::DatasetBusy(name.to_string()));
        }
        Ok(self.acquire(name, vec![0.0; len]))
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn Dataset>> {
        let slot = self.arrays.borrow_mut().remove(name);
        let data = match slot {
            Some(Slot::Idle(data)) => data,
            Some(open @ Slot::Open(_)) => {
                self.arrays.borrow_mut().insert(name.to_string(), open);
                return Err(ChunkError::DatasetBusy(name.to_string()));
            }
            None => return Err(ChunkError::DatasetNotFound(name.to_string())),
        };
        Ok(self.acquire(name, data))
    }

    fn size_bytes(&self) -> Result<u64> {
        let elements: usize = self
            .arrays
            .borrow()
            .values()
            .map(|slot| match slot {
                Slot::Idle(data) => data.len(),
                Slot::Open(len) => *len,
            })
            .sum();
        Ok((elements * DType::Float64.item_size()) as u64)
    }
}

/// Handle to a heap buffer owned by a [`MemoryStorage`].
pub struct MemoryDataset {
    name: String,
    data: Vec<f64>,
    registry: Registry,
    released: bool,
}

impl MemoryDataset {
    /// Borrows the whole buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let data = std::mem::take(&mut self.data);
        // The registry borrow is never held across a handle operation.
        if let Ok(mut arrays) = self.registry.try_borrow_mut() {
            arrays.insert(self.name.clone(), Slot::Idle(data));
        }
    }
}

impl Dataset for MemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn write_range(&mut self, range: ChunkRange, values: &[f64]) -> Result<()> {
        check_access(range, self.data.len(), values.len())?;
        self.data[range.as_range()].copy_from_slice(values);
        Ok(())
    }

    fn read_range_into(&mut self, range: ChunkRange, out: &mut [f64]) -> Result<()> {
        check_access(range, self.data.len(), out.len())?;
        out.copy_from_slice(&self.data[range.as_range()]);
        Ok(())
    }

    fn size_bytes(&self) -> Result<u64> {
        Ok((self.data.len() * DType::Float64.item_size()) as u64)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryDataset {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read() {
        let mut storage = MemoryStorage::new();
        let mut ds = storage.create("x", 10, DType::Float64).unwrap();
        ds.write_range(ChunkRange::new(2, 5), &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(
            ds.read_range(ChunkRange::new(0, 6)).unwrap(),
            vec![0.0, 0.0, 1.0, 2.0, 3.0, 0.0]
        );
        assert_eq!(ds.size_bytes().unwrap(), 80);
        ds.close().unwrap();
    }

    #[test]
    fn test_reopen_keeps_values() {
        let mut storage = MemoryStorage::new();
        let mut ds = storage.create("x", 4, DType::Float64).unwrap();
        ds.write_range(ChunkRange::new(0, 4), &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        ds.close().unwrap();

        let mut ds = storage.open("x").unwrap();
        assert_eq!(
            ds.read_range(ChunkRange::new(0, 4)).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
        ds.close().unwrap();
    }

    #[test]
    fn test_recreate_starts_from_zeros() {
        let mut storage = MemoryStorage::new();
        let mut ds = storage.create("x", 2, DType::Float64).unwrap();
        ds.write_range(ChunkRange::new(0, 2), &[7.0, 8.0]).unwrap();
        ds.close().unwrap();

        let mut ds = storage.create("x", 2, DType::Float64).unwrap();
        assert_eq!(ds.read_range(ChunkRange::new(0, 2)).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_busy_and_missing() {
        let mut storage = MemoryStorage::new();
        let _ds = storage.create("x", 2, DType::Float64).unwrap();
        assert!(matches!(
            storage.create("x", 2, DType::Float64),
            Err(ChunkError::DatasetBusy(_))
        ));
        assert!(matches!(storage.open("x"), Err(ChunkError::DatasetBusy(_))));
        assert!(matches!(
            storage.open("r"),
            Err(ChunkError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn test_drop_releases() {
        let mut storage = MemoryStorage::new();
        {
            let mut ds = storage.create("x", 3, DType::Float64).unwrap();
            ds.write_range(ChunkRange::new(0, 1), &[5.0]).unwrap();
        }
        let mut ds = storage.open("x").unwrap();
        assert_eq!(ds.read_range(ChunkRange::new(0, 1)).unwrap(), vec![5.0]);
    }

    #[test]
    fn test_out_of_range() {
        let mut storage = MemoryStorage::new();
        let mut ds = storage.create("x", 3, DType::Float64).unwrap();
        assert!(matches!(
            ds.write_range(ChunkRange::new(2, 4), &[1.0, 2.0]),
            Err(ChunkError::Range { .. })
        ));
        assert!(matches!(
            ds.read_range(ChunkRange::new(3, 4)),
            Err(ChunkError::Range { .. })
        ));
    }

    #[test]
    fn test_storage_size() {
        let mut storage = MemoryStorage::new();
        let x = storage.create("x", 10, DType::Float64).unwrap();
        let r = storage.create("r", 10, DType::Float64).unwrap();
        assert_eq!(storage.size_bytes().unwrap(), 160);
        x.close().unwrap();
        r.close().unwrap();
        assert_eq!(storage.size_bytes().unwrap(), 160);
    }
}
