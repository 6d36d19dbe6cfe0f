use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("partition {0} does not exist")]
    UnknownPartition(u32),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One entry read off a partition, with the position used to acknowledge it.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// The write side of an ordered, partitioned, append-only log.
#[async_trait]
pub trait StreamSink: Send + Sync {
    fn partition_count(&self) -> u32;

    /// Append a payload to one partition. Returns once the transport has
    /// accepted the write, so per-partition append order is the caller's
    /// call order.
    async fn append(&self, partition: u32, key: &str, payload: Vec<u8>)
        -> Result<(), StreamError>;
}

/// The read side of an ordered, partitioned, append-only log. The caller
/// owns one cursor per partition and advances it only after the fetched
/// records are fully handled.
#[async_trait]
pub trait StreamSource: Send + Sync {
    fn partition_count(&self) -> u32;

    /// Read up to `max` records from `partition` starting at `cursor`,
    /// in partition order. Empty when caught up.
    async fn fetch(
        &self,
        partition: u32,
        cursor: u64,
        max: usize,
    ) -> Result<Vec<StreamRecord>, StreamError>;
}

/// In-memory log used by tests and local runs; offsets are plain indices.
pub struct MemoryStream {
    partitions: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryStream {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn partition(&self, partition: u32) -> Result<&Mutex<Vec<Vec<u8>>>, StreamError> {
        self.partitions
            .get(partition as usize)
            .ok_or(StreamError::UnknownPartition(partition))
    }

    pub fn len(&self, partition: u32) -> usize {
        self.partitions
            .get(partition as usize)
            .map(|p| p.lock().expect("poisoned MemoryStream mutex").len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, partition: u32) -> bool {
        self.len(partition) == 0
    }
}

#[async_trait]
impl StreamSink for MemoryStream {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(
        &self,
        partition: u32,
        _key: &str,
        payload: Vec<u8>,
    ) -> Result<(), StreamError> {
        self.partition(partition)?
            .lock()
            .expect("poisoned MemoryStream mutex")
            .push(payload);
        Ok(())
    }
}

#[async_trait]
impl StreamSource for MemoryStream {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn fetch(
        &self,
        partition: u32,
        cursor: u64,
        max: usize,
    ) -> Result<Vec<StreamRecord>, StreamError> {
        let entries = self
            .partition(partition)?
            .lock()
            .expect("poisoned MemoryStream mutex");

        let start = (cursor as usize).min(entries.len());
        let end = (start + max).min(entries.len());

        Ok(entries[start..end]
            .iter()
            .enumerate()
            .map(|(i, payload)| StreamRecord {
                offset: (start + i) as u64,
                payload: payload.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_then_fetch_preserves_order() {
        let stream = MemoryStream::new(2);
        for i in 0..5u8 {
            stream.append(0, "k", vec![i]).await.unwrap();
        }

        let records = stream.fetch(0, 0, 10).await.unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.offset, i as u64);
            assert_eq!(record.payload, vec![i as u8]);
        }

        // The other partition is untouched.
        assert!(stream.fetch(1, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_windows_from_cursor() {
        let stream = MemoryStream::new(1);
        for i in 0..10u8 {
            stream.append(0, "k", vec![i]).await.unwrap();
        }

        let records = stream.fetch(0, 4, 3).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 4);
        assert_eq!(records[2].payload, vec![6]);

        // Caught up.
        assert!(stream.fetch(0, 10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_partition_is_an_error() {
        let stream = MemoryStream::new(1);
        assert!(matches!(
            stream.fetch(3, 0, 1).await,
            Err(StreamError::UnknownPartition(3))
        ));
        assert!(matches!(
            stream.append(3, "k", vec![]).await,
            Err(StreamError::UnknownPartition(3))
        ));
    }
}
